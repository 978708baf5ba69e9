//! Request middleware.

pub mod forwarded;

pub use forwarded::{forwarded_middleware, ForwardingState};
