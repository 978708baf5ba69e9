//! One started set of listeners.
//!
//! A `ServerGeneration` owns the accept loops of its listeners, the periodic
//! TLS reload tasks and the admission counter they share. It is closed
//! exactly once, by the lifecycle manager.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures_util::future::join_all;
use tokio::task::JoinHandle;

use crate::config::schema::InsecureRequests;
use crate::http::redirect::redirect_router;
use crate::http::{build_service, ForwardingState, ListenerServer};
use crate::lifecycle::shutdown::{Shutdown, ShutdownSignal};
use crate::lifecycle::LifecycleError;
use crate::net::listener::BoundSocket;
use crate::net::{ConnectionAdmission, ListenerKind, ListenerRole, LocalEndpoint, TlsMaterial, Transport};

/// Applications and policies served by a generation.
#[derive(Debug, Clone)]
pub struct ServerApp {
    pub router: Router,
    /// Served on management listeners; they fall back to `router`.
    pub management: Option<Router>,
    pub forwarding: ForwardingState,
    pub connection_limit: Option<usize>,
    pub max_body_size: Option<usize>,
    /// Plain listeners redirect to the encrypted one when set to `Redirect`.
    pub insecure_requests: InsecureRequests,
    /// Bound on connection draining during `stop()`.
    pub drain_timeout: Option<Duration>,
}

impl ServerApp {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            management: None,
            forwarding: ForwardingState::disabled(),
            connection_limit: None,
            max_body_size: None,
            insecure_requests: InsecureRequests::Enabled,
            drain_timeout: None,
        }
    }

    pub fn with_management(mut self, router: Router) -> Self {
        self.management = Some(router);
        self
    }

    pub fn with_forwarding(mut self, forwarding: ForwardingState) -> Self {
        self.forwarding = forwarding;
        self
    }

    pub fn with_connection_limit(mut self, limit: Option<usize>) -> Self {
        self.connection_limit = limit;
        self
    }

    pub fn with_max_body_size(mut self, limit: Option<usize>) -> Self {
        self.max_body_size = limit;
        self
    }

    pub fn with_insecure_requests(mut self, policy: InsecureRequests) -> Self {
        self.insecure_requests = policy;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Where a started listener actually listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundListener {
    pub name: Arc<str>,
    pub role: ListenerRole,
    pub transport: Transport,
    pub local: LocalEndpoint,
}

impl BoundListener {
    /// Actual port (never 0), for TCP based listeners.
    pub fn port(&self) -> Option<u16> {
        match &self.local {
            LocalEndpoint::Inet(addr) => Some(addr.port()),
            LocalEndpoint::Path(_) => None,
        }
    }
}

impl fmt::Display for BoundListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.local {
            LocalEndpoint::Inet(addr) => write!(f, "{}://{}", self.transport.scheme(), addr),
            LocalEndpoint::Path(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Outcome of a certificate rotation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// New handshakes use the new material.
    Applied,
    /// No running generation, or shutdown has begun.
    Skipped,
}

#[derive(Debug)]
struct ListenerHandle {
    bound: BoundListener,
    tls: Option<RustlsConfig>,
}

/// A live generation of listeners.
#[derive(Debug)]
pub struct ServerGeneration {
    id: u64,
    listeners: Vec<ListenerHandle>,
    admission: Arc<ConnectionAdmission>,
    shutdown: Shutdown,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    reload_tasks: Mutex<Vec<JoinHandle<()>>>,
    close_passes: AtomicUsize,
}

impl ServerGeneration {
    /// Spawn accept loops and reload tasks for already bound sockets.
    pub(crate) fn launch(id: u64, sockets: Vec<BoundSocket>, app: &ServerApp) -> Self {
        let admission = Arc::new(ConnectionAdmission::new(app.connection_limit));
        let shutdown = Shutdown::new();

        let main = build_service(app.router.clone(), &app.forwarding, app.max_body_size);
        let management = app
            .management
            .clone()
            .map(|router| build_service(router, &app.forwarding, app.max_body_size))
            .unwrap_or_else(|| main.clone());
        let redirect = redirect_target(&sockets, app).map(redirect_router);

        let mut listeners = Vec::with_capacity(sockets.len());
        let mut listener_tasks = Vec::with_capacity(sockets.len());
        let mut reload_tasks = Vec::new();

        for socket in sockets {
            let spec = &socket.spec;
            let router = match (spec.role, spec.transport(), &redirect) {
                (ListenerRole::Management, _, _) => management.clone(),
                (ListenerRole::Main, Transport::Tcp, Some(redirect)) => redirect.clone(),
                _ => main.clone(),
            };

            if let (
                ListenerKind::Tls {
                    material: material @ TlsMaterial::Files { .. },
                    reload_period: Some(period),
                    ..
                },
                Some(config),
            ) = (&spec.kind, &socket.tls)
            {
                reload_tasks.push(tokio::spawn(reload_periodically(
                    spec.name.clone(),
                    material.clone(),
                    config.clone(),
                    *period,
                    shutdown.subscribe(),
                )));
            }

            listeners.push(ListenerHandle {
                bound: BoundListener {
                    name: spec.name.clone(),
                    role: spec.role,
                    transport: spec.transport(),
                    local: socket.local.clone(),
                },
                tls: socket.tls.clone(),
            });

            let server = ListenerServer {
                app: router,
                admission: admission.clone(),
                drain_timeout: app.drain_timeout,
            };
            listener_tasks.push(tokio::spawn(server.run(socket, shutdown.subscribe())));
        }

        Self {
            id,
            listeners,
            admission,
            shutdown,
            listener_tasks: Mutex::new(listener_tasks),
            reload_tasks: Mutex::new(reload_tasks),
            close_passes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listeners(&self) -> Vec<BoundListener> {
        self.listeners.iter().map(|l| l.bound.clone()).collect()
    }

    pub fn listener(&self, name: &str) -> Option<&BoundListener> {
        self.listeners.iter().map(|l| &l.bound).find(|b| &*b.name == name)
    }

    pub fn admission(&self) -> &Arc<ConnectionAdmission> {
        &self.admission
    }

    pub fn is_closing(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Number of periodic reload tasks still owned by this generation.
    pub fn reload_task_count(&self) -> usize {
        self.reload_tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    /// How many times the generation has been closed.
    pub fn close_count(&self) -> usize {
        self.close_passes.load(Ordering::Acquire)
    }

    /// Swap the TLS material of a live listener.
    pub async fn rotate(&self, listener: &str, material: &TlsMaterial) -> Result<RotationOutcome, LifecycleError> {
        if self.is_closing() {
            return Ok(RotationOutcome::Skipped);
        }
        let handle = self
            .listeners
            .iter()
            .find(|l| &*l.bound.name == listener)
            .ok_or_else(|| LifecycleError::UnknownListener(listener.to_string()))?;
        let config = handle
            .tls
            .as_ref()
            .ok_or_else(|| LifecycleError::NotTls(listener.to_string()))?;

        material.apply_to(config).await.map_err(|source| LifecycleError::Tls {
            listener: listener.to_string(),
            source,
        })?;
        tracing::info!(listener = %listener, generation = self.id, "TLS material rotated");
        Ok(RotationOutcome::Applied)
    }

    /// Close every listener and reload task and wait until all of them have
    /// finished. Returns the number of tasks that ended abnormally.
    pub(crate) async fn close(&self) -> usize {
        self.close_passes.fetch_add(1, Ordering::AcqRel);
        self.admission.close();

        let listener_tasks = take_tasks(&self.listener_tasks);
        let reload_tasks = take_tasks(&self.reload_tasks);
        tracing::info!(
            generation = self.id,
            listeners = listener_tasks.len(),
            reload_tasks = reload_tasks.len(),
            "Closing server generation"
        );

        self.shutdown.trigger();

        let results = join_all(listener_tasks.into_iter().chain(reload_tasks)).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        for err in results.into_iter().filter_map(Result::err) {
            tracing::error!(generation = self.id, error = %err, "Listener task terminated abnormally");
        }
        failed
    }
}

fn take_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> Vec<JoinHandle<()>> {
    match tasks.lock() {
        Ok(mut tasks) => std::mem::take(&mut *tasks),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

/// Port of the encrypted main listener, when plain requests must be
/// redirected to it.
fn redirect_target(sockets: &[BoundSocket], app: &ServerApp) -> Option<u16> {
    if app.insecure_requests != InsecureRequests::Redirect {
        return None;
    }
    let port = sockets
        .iter()
        .filter(|s| s.spec.role == ListenerRole::Main && s.spec.transport() == Transport::Tls)
        .find_map(|s| match &s.local {
            LocalEndpoint::Inet(addr) => Some(addr.port()),
            LocalEndpoint::Path(_) => None,
        });
    if port.is_none() {
        tracing::warn!("Insecure requests set to redirect without an encrypted listener, serving plain requests");
    }
    port
}

async fn reload_periodically(
    listener: Arc<str>,
    material: TlsMaterial,
    config: RustlsConfig,
    period: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; the material was just loaded.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                match material.apply_to(&config).await {
                    Ok(()) => tracing::debug!(listener = %listener, "TLS material reloaded"),
                    Err(e) => tracing::warn!(listener = %listener, error = %e, "TLS reload failed, keeping current material"),
                }
            }
        }
    }
    tracing::debug!(listener = %listener, "TLS reload task stopped");
}
