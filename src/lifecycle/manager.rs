//! Server lifecycle management.
//!
//! # Responsibilities
//! - Bind every listener of a `ListenerSet` concurrently
//! - Roll back already bound listeners when any bind fails
//! - Publish the running `ServerGeneration`
//! - Stop exactly once, however many callers ask
//! - Rotate TLS material of a live listener without rebinding
//!
//! # State Machine
//! ```text
//! Stopped → Starting → Running → Stopping → Stopped
//!              │
//!              └── bind failure (after rollback) → Stopped
//! ```

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex};

use crate::lifecycle::generation::{BoundListener, RotationOutcome, ServerApp, ServerGeneration};
use crate::net::listener::{bind, BoundSocket};
use crate::net::{BindError, ListenerSet, TlsError, TlsMaterial};
use crate::observability::metrics;

/// Lifecycle failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("must configure at least one of http, https or unix domain socket")]
    NoListeners,
    #[error("unknown listener '{0}'")]
    UnknownListener(String),
    #[error("listener '{0}' is not a TLS listener")]
    NotTls(String),
    #[error("failed to rotate TLS material of listener '{listener}': {source}")]
    Tls {
        listener: String,
        #[source]
        source: TlsError,
    },
    #[error("{0} listener task(s) terminated abnormally during shutdown")]
    TaskFailed(usize),
}

/// Observable lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl LifecyclePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecyclePhase::Starting,
            2 => LifecyclePhase::Running,
            3 => LifecyclePhase::Stopping,
            _ => LifecyclePhase::Stopped,
        }
    }
}

/// Result of a successful `start()`.
#[derive(Debug, Clone)]
pub struct StartResult {
    pub generation: u64,
    pub listeners: Vec<BoundListener>,
}

impl StartResult {
    pub fn listener(&self, name: &str) -> Option<&BoundListener> {
        self.listeners.iter().find(|l| &*l.name == name)
    }
}

/// Completion of an in-flight stop: `Some(failed_tasks)` once done.
type StopCompletion = watch::Receiver<Option<usize>>;

enum State {
    Stopped,
    Running(Arc<ServerGeneration>),
    Stopping(StopCompletion),
}

struct Inner {
    /// Held for the whole of `start()`, so generations never interleave.
    state: Mutex<State>,
    phase: AtomicU8,
    current: ArcSwapOption<ServerGeneration>,
    next_generation: AtomicU64,
}

impl Inner {
    fn set_phase(&self, phase: LifecyclePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Starts, stops and reconfigures the listeners of one server.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct ServerLifecycleManager {
    inner: Arc<Inner>,
}

impl Default for ServerLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServerLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLifecycleManager")
            .field("phase", &self.phase())
            .field("generation", &self.inner.current.load().as_ref().map(|g| g.id()))
            .finish()
    }
}

/// Resets the phase if `start()` is abandoned half way.
struct StartingGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.set_phase(LifecyclePhase::Stopped);
        }
    }
}

impl ServerLifecycleManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Stopped),
                phase: AtomicU8::new(LifecyclePhase::Stopped as u8),
                current: ArcSwapOption::empty(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.inner.phase.load(Ordering::Acquire))
    }

    /// The running generation, if any. `None` as soon as `stop()` begins.
    pub fn current_generation(&self) -> Option<Arc<ServerGeneration>> {
        self.inner.current.load_full()
    }

    /// Bind every listener concurrently and start serving `app`.
    ///
    /// Either all listeners come up or none stay bound.
    pub async fn start(&self, listeners: ListenerSet, app: ServerApp) -> Result<StartResult, LifecycleError> {
        let mut state = self.inner.state.lock().await;
        match &*state {
            State::Running(_) => return Err(LifecycleError::AlreadyRunning),
            State::Stopping(_) => return Err(LifecycleError::ShuttingDown),
            State::Stopped => {}
        }
        if listeners.is_empty() {
            return Err(LifecycleError::NoListeners);
        }

        self.inner.set_phase(LifecyclePhase::Starting);
        let mut guard = StartingGuard {
            inner: &self.inner,
            armed: true,
        };

        let results = join_all(listeners.iter().map(|spec| bind(spec, &listeners))).await;

        let mut bound: Vec<BoundSocket> = Vec::with_capacity(results.len());
        let mut errors: Vec<BindError> = Vec::new();
        for result in results {
            match result {
                Ok(socket) => {
                    tracing::debug!(listener = %socket.spec.name, address = %socket.local, "Listener bound");
                    bound.push(socket);
                }
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            for e in &errors {
                metrics::record_bind_failure(e.kind());
                tracing::error!(error = %e, listeners = ?e.listeners(), "Failed to bind listener");
            }
            if !bound.is_empty() {
                tracing::error!(count = bound.len(), "Rolling back listeners bound before the failure");
            }
            for socket in bound {
                socket.close();
            }
            return Err(LifecycleError::Bind(errors.remove(0)));
        }

        let id = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let generation = Arc::new(ServerGeneration::launch(id, bound, &app));
        let started = generation.listeners();

        *state = State::Running(generation.clone());
        self.inner.current.store(Some(generation));
        guard.armed = false;
        self.inner.set_phase(LifecyclePhase::Running);

        let summary = started.iter().map(ToString::to_string).collect::<Vec<_>>().join(" and ");
        tracing::info!(generation = id, "Listening on: {}", summary);

        Ok(StartResult {
            generation: id,
            listeners: started,
        })
    }

    /// Stop the running generation and wait until every listener and reload
    /// task has closed.
    ///
    /// Idempotent: concurrent callers share one shutdown, and calling it
    /// while stopped returns immediately.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        let mut completion = {
            let mut state = self.inner.state.lock().await;
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Stopped => return Ok(()),
                State::Stopping(completion) => {
                    *state = State::Stopping(completion.clone());
                    completion
                }
                State::Running(generation) => {
                    let (tx, completion) = watch::channel(None);
                    *state = State::Stopping(completion.clone());
                    self.inner.set_phase(LifecyclePhase::Stopping);
                    self.inner.current.store(None);

                    // Runs detached so an abandoned caller cannot strand
                    // the other waiters.
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        let failed = generation.close().await;
                        let mut state = inner.state.lock().await;
                        *state = State::Stopped;
                        inner.set_phase(LifecyclePhase::Stopped);
                        drop(state);
                        tracing::info!(generation = generation.id(), "Server generation stopped");
                        let _ = tx.send(Some(failed));
                    });
                    completion
                }
            }
        };

        let failed = match completion.wait_for(Option::is_some).await {
            Ok(done) => (*done).unwrap_or(0),
            Err(_) => 0,
        };
        if failed > 0 {
            return Err(LifecycleError::TaskFailed(failed));
        }
        Ok(())
    }

    /// Rotate the TLS material of a running listener in place.
    ///
    /// A no-op (`Skipped`) when nothing is running or shutdown has begun.
    pub async fn rotate_certificate(
        &self,
        listener: &str,
        material: TlsMaterial,
    ) -> Result<RotationOutcome, LifecycleError> {
        match self.current_generation() {
            Some(generation) => generation.rotate(listener, &material).await,
            None => Ok(RotationOutcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ListenerSpec;
    use axum::{routing::get, Router};

    fn app() -> ServerApp {
        ServerApp::new(Router::new().route("/", get(|| async { "ok" })))
    }

    fn ephemeral() -> ListenerSet {
        ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0))
    }

    #[tokio::test]
    async fn start_then_stop() {
        let manager = ServerLifecycleManager::new();
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);

        let started = manager.start(ephemeral(), app()).await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Running);
        assert_ne!(started.listener("http").unwrap().port(), Some(0));
        assert_eq!(manager.current_generation().unwrap().id(), started.generation);

        manager.stop().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);
        assert!(manager.current_generation().is_none());
    }

    #[tokio::test]
    async fn empty_set_is_rejected() {
        let manager = ServerLifecycleManager::new();
        let err = manager.start(ListenerSet::new(), app()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::NoListeners));
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_running() {
        let manager = ServerLifecycleManager::new();
        manager.start(ephemeral(), app()).await.unwrap();
        let err = manager.start(ephemeral(), app()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_stopped_is_a_noop() {
        let manager = ServerLifecycleManager::new();
        manager.stop().await.unwrap();
        manager.stop().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);
    }

    #[tokio::test]
    async fn generations_get_fresh_ids() {
        let manager = ServerLifecycleManager::new();
        let first = manager.start(ephemeral(), app()).await.unwrap().generation;
        manager.stop().await.unwrap();
        let second = manager.start(ephemeral(), app()).await.unwrap().generation;
        manager.stop().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn rotation_without_generation_is_skipped() {
        let manager = ServerLifecycleManager::new();
        let outcome = manager
            .rotate_certificate("https", TlsMaterial::from_files("/nonexistent/c.pem", "/nonexistent/k.pem"))
            .await
            .unwrap();
        assert_eq!(outcome, RotationOutcome::Skipped);
    }

    #[tokio::test]
    async fn rotation_of_plain_listener_is_rejected() {
        let manager = ServerLifecycleManager::new();
        manager.start(ephemeral(), app()).await.unwrap();
        let err = manager
            .rotate_certificate("http", TlsMaterial::from_files("/nonexistent/c.pem", "/nonexistent/k.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotTls(name) if name == "http"));

        let err = manager
            .rotate_certificate("missing", TlsMaterial::from_files("/nonexistent/c.pem", "/nonexistent/k.pem"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownListener(_)));
        manager.stop().await.unwrap();
    }
}
