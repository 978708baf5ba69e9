//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the listener
//! layer. All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::forwarding::ForwardedPrecedence;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Plain HTTP listener.
    pub http: HttpConfig,

    /// Encrypted listener; absent means no HTTPS.
    pub https: Option<HttpsConfig>,

    /// Unix domain socket listener.
    pub domain_socket: Option<DomainSocketConfig>,

    /// Separate management interface.
    pub management: Option<ManagementConfig>,

    /// Reverse proxy / forwarded header handling.
    pub proxy: ProxyConfig,

    /// Connection and request limits.
    pub limits: LimitsConfig,

    /// Threads, launch mode and shutdown behavior.
    pub runtime: RuntimeConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Plain HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// Set to false to run without a plain listener.
    pub enabled: bool,

    /// Bind host (e.g., "0.0.0.0").
    pub host: String,

    /// Bind port; 0 picks a free port.
    pub port: u16,

    /// What the plain listener does with requests when HTTPS is configured.
    pub insecure_requests: InsecureRequests,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            insecure_requests: InsecureRequests::Enabled,
        }
    }
}

/// Handling of plain-text requests.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InsecureRequests {
    /// Serve the application over plain HTTP.
    #[default]
    Enabled,
    /// Answer with a 301 to the HTTPS listener.
    Redirect,
    /// Do not start the plain listener at all.
    Disabled,
}

/// HTTPS listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HttpsConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_https_port")]
    pub port: u16,

    pub tls: TlsConfig,
}

/// TLS material for a listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,

    /// Re-read the files this often and rotate them into the live listener.
    #[serde(default)]
    pub reload_period_secs: Option<u64>,
}

/// Unix domain socket listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DomainSocketConfig {
    pub path: String,
}

/// Management interface listener.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ManagementConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_management_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Forwarded header handling.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Master switch; when off, forwarded headers are never honored.
    pub proxy_address_forwarding: bool,

    /// Honor the standard `Forwarded` header.
    pub allow_forwarded: bool,

    /// Honor the `X-Forwarded-*` headers.
    pub allow_x_forwarded: bool,

    /// Which family wins when both are present.
    pub precedence: ForwardedPrecedence,

    /// Honor the forwarded host header.
    pub enable_forwarded_host: bool,

    /// Header carrying the original host.
    pub forwarded_host_header: String,

    /// Honor the forwarded prefix header.
    pub enable_forwarded_prefix: bool,

    /// Header carrying the path prefix stripped by the proxy.
    pub forwarded_prefix_header: String,

    /// Trusted proxies: CIDR, IP[:port] or hostname[:port].
    pub trusted_proxies: Vec<String>,

    /// Upper bound on each DNS lookup during trust evaluation.
    pub dns_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            proxy_address_forwarding: false,
            allow_forwarded: true,
            allow_x_forwarded: true,
            precedence: ForwardedPrecedence::Forwarded,
            enable_forwarded_host: true,
            forwarded_host_header: "X-Forwarded-Host".to_string(),
            enable_forwarded_prefix: false,
            forwarded_prefix_header: "X-Forwarded-Prefix".to_string(),
            trusted_proxies: Vec::new(),
            dns_timeout_ms: 5_000,
        }
    }
}

/// Connection and request limits.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections over all TCP based listeners.
    pub max_connections: Option<usize>,

    /// Maximum request body size in bytes.
    pub max_body_size: Option<usize>,
}

/// Runtime sizing and shutdown.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// I/O worker threads; defaults to the available parallelism.
    pub io_threads: Option<usize>,

    /// Launch mode; development and test use fewer threads.
    pub launch_mode: LaunchMode,

    /// How long `stop()` waits for in-flight connections. Unbounded if unset.
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    #[default]
    Normal,
    Development,
    Test,
}

impl LaunchMode {
    pub fn is_dev_or_test(&self) -> bool {
        matches!(self, LaunchMode::Development | LaunchMode::Test)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_https_port() -> u16 {
    8443
}

fn default_management_port() -> u16 {
    9000
}
