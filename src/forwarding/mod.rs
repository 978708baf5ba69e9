//! Proxy trust and forwarded header subsystem.
//!
//! # Data Flow
//! ```text
//! config.proxy.trusted_proxies
//!     → matcher.rs (parse rules: CIDR / IP[:port] / hostname[:port])
//!     → registry.rs (TrustedProxyRegistry, built once per generation)
//!
//! Per connection:
//!     PeerAddress
//!     → trust.rs (ProxyTrustResolver: maybe DNS via dns.rs)
//!     → TrustDecision
//!
//! Per request:
//!     RawRequestMetadata + TrustDecision
//!     → forwarded.rs (Forwarded / X-Forwarded-*)
//!     → EffectiveRequestMetadata
//! ```
//!
//! # Design Decisions
//! - Fail closed: any error in trust evaluation means "not trusted"
//! - Hostname rules resolve once per registry, never per connection
//! - Header parsing never fails a request; bad fields are ignored

pub mod dns;
pub mod forwarded;
pub mod matcher;
pub mod registry;
pub mod trust;

pub use dns::{DnsResolver, SystemResolver};
pub use forwarded::{
    compute_effective, EffectiveRequestMetadata, ForwardedMode, ForwardedPrecedence, ForwardingOptions,
    RawRequestMetadata, RemoteAddress,
};
pub use matcher::{AddressMatcher, RuleError};
pub use registry::{ResolutionReport, TrustedProxyRegistry};
pub use trust::{ProxyTrustResolver, TrustDecision};
