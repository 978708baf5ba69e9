//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Require at least one listener
//! - Validate value ranges (limits > 0, header names well formed)
//! - Detect listeners configured on the same explicit address
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashMap;

use axum::http::HeaderName;

use crate::config::schema::{InsecureRequests, ServerConfig};
use crate::forwarding::AddressMatcher;

/// One semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("no listener is enabled (http, https or domain_socket required)")]
    NoListeners,
    #[error("http.insecure_requests = {0:?} requires an https listener")]
    InsecurePolicyWithoutHttps(InsecureRequests),
    #[error("limits.{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("invalid trusted proxy '{rule}': {reason}")]
    TrustedProxy { rule: String, reason: String },
    #[error("proxy.{field} is not a valid header name: '{value}'")]
    HeaderName { field: &'static str, value: String },
    #[error("listeners {first} and {second} are both configured on {address}")]
    DuplicateAddress {
        first: &'static str,
        second: &'static str,
        address: String,
    },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("runtime.io_threads must be at least one")]
    ZeroIoThreads,
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_listeners(config, &mut errors);
    validate_limits(config, &mut errors);
    validate_proxy(config, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Whether the plain HTTP listener will actually be started.
pub fn plain_listener_enabled(config: &ServerConfig) -> bool {
    config.http.enabled && !(config.https.is_some() && config.http.insecure_requests == InsecureRequests::Disabled)
}

fn validate_listeners(config: &ServerConfig, errors: &mut Vec<ValidationError>) {
    if !plain_listener_enabled(config) && config.https.is_none() && config.domain_socket.is_none() {
        errors.push(ValidationError::NoListeners);
    }

    if config.http.enabled && config.https.is_none() && config.http.insecure_requests != InsecureRequests::Enabled {
        errors.push(ValidationError::InsecurePolicyWithoutHttps(config.http.insecure_requests));
    }

    let mut addresses: Vec<(&'static str, &str, u16)> = Vec::new();
    if plain_listener_enabled(config) {
        addresses.push(("http", &config.http.host, config.http.port));
    }
    if let Some(https) = &config.https {
        addresses.push(("https", &https.host, https.port));
        if https.tls.reload_period_secs == Some(0) {
            errors.push(ValidationError::ZeroDuration("https.tls.reload_period_secs"));
        }
    }
    if let Some(management) = &config.management {
        addresses.push(("management", &management.host, management.port));
        if management.tls.as_ref().and_then(|tls| tls.reload_period_secs) == Some(0) {
            errors.push(ValidationError::ZeroDuration("management.tls.reload_period_secs"));
        }
    }

    let mut seen: HashMap<(&str, u16), &'static str> = HashMap::new();
    for (name, host, port) in addresses {
        // Ephemeral ports never collide.
        if port == 0 {
            continue;
        }
        if let Some(first) = seen.insert((host, port), name) {
            errors.push(ValidationError::DuplicateAddress {
                first,
                second: name,
                address: format!("{}:{}", host, port),
            });
        }
    }
}

fn validate_limits(config: &ServerConfig, errors: &mut Vec<ValidationError>) {
    if config.limits.max_connections == Some(0) {
        errors.push(ValidationError::ZeroLimit("max_connections"));
    }
    if config.limits.max_body_size == Some(0) {
        errors.push(ValidationError::ZeroLimit("max_body_size"));
    }
    if config.runtime.io_threads == Some(0) {
        errors.push(ValidationError::ZeroIoThreads);
    }
}

fn validate_proxy(config: &ServerConfig, errors: &mut Vec<ValidationError>) {
    let proxy = &config.proxy;

    for rule in &proxy.trusted_proxies {
        if let Err(e) = AddressMatcher::parse(rule) {
            errors.push(ValidationError::TrustedProxy {
                rule: rule.clone(),
                reason: e.to_string(),
            });
        }
    }

    for (field, value) in [
        ("forwarded_host_header", &proxy.forwarded_host_header),
        ("forwarded_prefix_header", &proxy.forwarded_prefix_header),
    ] {
        if value.is_empty() || HeaderName::from_bytes(value.as_bytes()).is_err() {
            errors.push(ValidationError::HeaderName {
                field,
                value: value.clone(),
            });
        }
    }

    if proxy.dns_timeout_ms == 0 {
        errors.push(ValidationError::ZeroDuration("proxy.dns_timeout_ms"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{DomainSocketConfig, HttpsConfig, ManagementConfig, TlsConfig};

    fn https(port: u16) -> HttpsConfig {
        HttpsConfig {
            host: "0.0.0.0".to_string(),
            port,
            tls: TlsConfig {
                cert_path: "cert.pem".to_string(),
                key_path: "key.pem".to_string(),
                reload_period_secs: None,
            },
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn disabled_plain_listener_alone_is_rejected() {
        let mut config = ServerConfig::default();
        config.http.enabled = false;
        assert_eq!(validate_config(&config).unwrap_err(), vec![ValidationError::NoListeners]);

        config.domain_socket = Some(DomainSocketConfig {
            path: "/tmp/app.sock".to_string(),
        });
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn redirect_requires_https() {
        let mut config = ServerConfig::default();
        config.http.insecure_requests = InsecureRequests::Redirect;
        assert_eq!(
            validate_config(&config).unwrap_err(),
            vec![ValidationError::InsecurePolicyWithoutHttps(InsecureRequests::Redirect)]
        );

        config.https = Some(https(8443));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn disabled_insecure_requests_skip_plain_listener() {
        let mut config = ServerConfig::default();
        config.https = Some(https(8080));
        config.http.insecure_requests = InsecureRequests::Disabled;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn duplicate_explicit_ports_are_reported() {
        let mut config = ServerConfig::default();
        config.management = Some(ManagementConfig {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: None,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::DuplicateAddress {
                first: "http",
                second: "management",
                address: "0.0.0.0:8080".to_string(),
            }]
        );
    }

    #[test]
    fn ephemeral_ports_never_collide() {
        let mut config = ServerConfig::default();
        config.http.port = 0;
        config.management = Some(ManagementConfig {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
        });
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn zero_counts_and_durations_are_distinct() {
        let mut config = ServerConfig::default();
        config.runtime.io_threads = Some(0);
        config.proxy.dns_timeout_ms = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::ZeroIoThreads,
                ValidationError::ZeroDuration("proxy.dns_timeout_ms"),
            ]
        );
        assert_eq!(errors[0].to_string(), "runtime.io_threads must be at least one");
    }

    #[test]
    fn bad_proxy_settings_are_collected() {
        let mut config = ServerConfig::default();
        config.proxy.trusted_proxies = vec!["10.0.0.0/99".to_string(), "10.0.0.1".to_string()];
        config.proxy.forwarded_host_header = String::new();
        config.proxy.forwarded_prefix_header = "bad header".to_string();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(matches!(&errors[0], ValidationError::TrustedProxy { rule, .. } if rule == "10.0.0.0/99"));
    }
}
