//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ListenerSet
//!     → listener.rs (bind TCP / TLS / Unix sockets, classify bind errors)
//!     → tls.rs (load TLS material before the socket is opened)
//!     → connection.rs (admission control, peer address, connection context)
//!     → Hand off to HTTP layer
//!
//! Connection States:
//!     Accepting → Admitted | Rejected → Handshaking → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - Over-limit connections are closed immediately, not queued
//! - Domain sockets bypass the connection limit
//! - TLS material is swappable on a live listener without rebinding

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{
    AdmissionPermit, ConnectionAdmission, ConnectionContext, ConnectionId, PeerAddress, Rejection, Transport,
};
pub use listener::{BindError, ListenerKind, ListenerRole, ListenerSet, ListenerSpec, LocalEndpoint, SocketOptions};
pub use tls::{TlsError, TlsMaterial};
