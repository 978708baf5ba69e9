//! Startup orchestration.
//!
//! # Responsibilities
//! - Size and build the I/O runtime
//! - Turn a validated `ServerConfig` into a `ListenerSet`
//! - Build the trusted proxy registry and forwarding state
//! - Assemble the `ServerApp` served by every generation
//!
//! # Design Decisions
//! - Fail fast: a bad trusted proxy rule is fatal
//! - Listeners are described here but bound by the manager

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::config::schema::{RuntimeConfig, ServerConfig, TlsConfig};
use crate::config::validation::plain_listener_enabled;
use crate::forwarding::{ProxyTrustResolver, RuleError, SystemResolver, TrustedProxyRegistry};
use crate::http::middleware::ForwardingState;
use crate::lifecycle::generation::ServerApp;
use crate::net::{ListenerRole, ListenerSet, ListenerSpec, TlsMaterial};

/// Number of I/O worker threads for this configuration.
///
/// Defaults to the available parallelism, or `min(2, available)` in
/// development and test launch modes. A configured value is capped at the
/// available parallelism.
pub fn io_threads(config: &RuntimeConfig) -> usize {
    let available = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    io_threads_for(config, available)
}

fn io_threads_for(config: &RuntimeConfig, available: usize) -> usize {
    match config.io_threads {
        Some(threads) => threads.clamp(1, available.max(1)),
        None if config.launch_mode.is_dev_or_test() => available.clamp(1, 2),
        None => available.max(1),
    }
}

/// Multi-threaded runtime sized by [`io_threads`].
pub fn build_runtime(config: &RuntimeConfig) -> io::Result<tokio::runtime::Runtime> {
    let threads = io_threads(config);
    tracing::debug!(io_threads = threads, "Building runtime");
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("edge-io")
        .enable_all()
        .build()
}

fn tls_material(tls: &TlsConfig) -> TlsMaterial {
    TlsMaterial::from_files(&tls.cert_path, &tls.key_path)
}

fn tls_listener(name: &str, host: &str, port: u16, tls: &TlsConfig) -> ListenerSpec {
    let spec = ListenerSpec::tls(name, host, port, tls_material(tls));
    match tls.reload_period_secs {
        Some(secs) if secs > 0 => spec.with_reload_period(Duration::from_secs(secs)),
        _ => spec,
    }
}

/// Listeners described by `config`, in a stable order: http, https,
/// domain socket, management.
pub fn listener_set(config: &ServerConfig) -> ListenerSet {
    let mut set = ListenerSet::new();

    if plain_listener_enabled(config) {
        set.push(ListenerSpec::tcp("http", config.http.host.clone(), config.http.port));
    }
    if let Some(https) = &config.https {
        set.push(tls_listener("https", &https.host, https.port, &https.tls));
    }
    if let Some(socket) = &config.domain_socket {
        set.push(ListenerSpec::unix("domain-socket", &socket.path));
    }
    if let Some(management) = &config.management {
        let spec = match &management.tls {
            Some(tls) => tls_listener("management", &management.host, management.port, tls),
            None => ListenerSpec::tcp("management", management.host.clone(), management.port),
        };
        set.push(spec.with_role(ListenerRole::Management));
    }

    set
}

/// Forwarding state for the `[proxy]` section.
pub fn forwarding_state(config: &ServerConfig) -> Result<ForwardingState, RuleError> {
    let proxy = &config.proxy;
    if !proxy.proxy_address_forwarding {
        return Ok(ForwardingState::disabled());
    }

    let registry = Arc::new(TrustedProxyRegistry::build(&proxy.trusted_proxies)?);
    if registry.is_empty() {
        tracing::warn!("Proxy address forwarding is enabled but no trusted proxies are configured");
    }
    let resolver = ProxyTrustResolver::new(
        registry,
        Arc::new(SystemResolver),
        Duration::from_millis(proxy.dns_timeout_ms),
    );
    Ok(ForwardingState::new(resolver, ForwardingState::options_from_config(proxy)))
}

/// Everything a generation needs besides its listeners.
pub fn server_app(config: &ServerConfig, router: Router, management: Option<Router>) -> Result<ServerApp, RuleError> {
    let mut app = ServerApp::new(router)
        .with_forwarding(forwarding_state(config)?)
        .with_connection_limit(config.limits.max_connections)
        .with_max_body_size(config.limits.max_body_size)
        .with_insecure_requests(config.http.insecure_requests)
        .with_drain_timeout(config.runtime.drain_timeout_secs.map(Duration::from_secs));
    if let Some(management) = management {
        app = app.with_management(management);
    }
    Ok(app)
}
