//! Edge HTTP listener layer.
//!
//! Accepts connections on TCP, TLS and Unix domain socket listeners, decides
//! per connection whether forwarded headers may be trusted, computes the
//! effective request metadata and manages the lifecycle of the listeners.

pub mod config;
pub mod forwarding;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ServerConfig;
pub use lifecycle::{ServerApp, ServerLifecycleManager};
