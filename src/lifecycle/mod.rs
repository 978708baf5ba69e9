//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     ServerConfig → ListenerSet + ServerApp → manager.start()
//!
//! Running (manager.rs, generation.rs):
//!     one ServerGeneration: accept loops + TLS reload tasks + admission
//!
//! Shutdown (manager.rs, shutdown.rs):
//!     stop() → close admission → signal every task → join all → Stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → stop()
//!     SIGHUP → reload config, stop() + start()
//! ```
//!
//! # Design Decisions
//! - Start is all-or-nothing: a bind failure rolls back bound listeners
//! - Stop is idempotent and completes only when everything has closed
//! - Generations never interleave: start holds the state lock throughout

pub mod generation;
pub mod manager;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use generation::{BoundListener, RotationOutcome, ServerApp, ServerGeneration};
pub use manager::{LifecycleError, LifecyclePhase, ServerLifecycleManager, StartResult};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{SignalEvent, Signals};
