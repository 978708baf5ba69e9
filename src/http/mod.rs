//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS/Unix connection
//!     → server.rs (admission, TLS, hyper HTTP/1.1 + HTTP/2)
//!     → middleware/forwarded.rs (trust decision, effective metadata)
//!     → request.rs (raw metadata in, `Effective` extractor out)
//!     → application router
//! ```
//!
//! Plain listeners configured to redirect get `redirect.rs` instead of the
//! application. `body.rs` hands request bodies to blocking consumers.

pub mod body;
pub mod echo;
pub mod middleware;
pub mod redirect;
pub mod request;
pub mod server;

pub use body::BodyReader;
pub use middleware::ForwardingState;
pub use request::Effective;
pub use server::{build_service, ListenerServer};
