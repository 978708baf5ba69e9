//! Per-connection trust resolution.
//!
//! # State machine
//! ```text
//! PeerAddress
//!     Unknown       → denied (no lookup)
//!     DomainSocket  → denied (proxy checks are IP based)
//!     registry has pending hostname rules → resolve them all (once per registry)
//!     Ip            → registry.is_trusted(ip, port)
//!     Hostname      → DNS lookup → registry.is_trusted(ip, port), failure → denied
//! ```
//!
//! Every failure path converges on `TrustDecision::denied()`; nothing here can
//! abort request processing.

use std::sync::Arc;
use std::time::Duration;

use crate::forwarding::dns::{lookup_with_timeout, DnsResolver, SystemResolver};
use crate::forwarding::registry::TrustedProxyRegistry;
use crate::net::connection::PeerAddress;
use crate::observability::metrics;

/// Default bound on any DNS lookup issued during trust evaluation.
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether forwarded headers from a connection may be honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustDecision {
    pub allowed: bool,
}

impl TrustDecision {
    pub const fn allowed() -> Self {
        Self { allowed: true }
    }

    pub const fn denied() -> Self {
        Self { allowed: false }
    }
}

/// Decides, for one peer, whether it is a trusted proxy.
#[derive(Debug, Clone)]
pub struct ProxyTrustResolver {
    registry: Arc<TrustedProxyRegistry>,
    dns: Arc<dyn DnsResolver>,
    lookup_timeout: Duration,
}

impl ProxyTrustResolver {
    pub fn new(registry: Arc<TrustedProxyRegistry>, dns: Arc<dyn DnsResolver>, lookup_timeout: Duration) -> Self {
        Self {
            registry,
            dns,
            lookup_timeout,
        }
    }

    /// Resolver using the system DNS and the default lookup timeout.
    pub fn with_system_dns(registry: Arc<TrustedProxyRegistry>) -> Self {
        Self::new(registry, Arc::new(SystemResolver), DEFAULT_DNS_TIMEOUT)
    }

    pub fn registry(&self) -> &Arc<TrustedProxyRegistry> {
        &self.registry
    }

    /// Produce the trust decision for one connection.
    pub async fn resolve(&self, peer: &PeerAddress) -> TrustDecision {
        let decision = self.evaluate(peer).await;
        metrics::record_trust_decision(decision.allowed);
        tracing::debug!(peer = %peer, allowed = decision.allowed, "Proxy trust evaluated");
        decision
    }

    async fn evaluate(&self, peer: &PeerAddress) -> TrustDecision {
        match peer {
            PeerAddress::Unknown | PeerAddress::DomainSocket(_) => return TrustDecision::denied(),
            PeerAddress::Ip(_) | PeerAddress::Hostname { .. } => {}
        }

        if self.registry.is_empty() {
            return TrustDecision::denied();
        }

        if self.registry.has_pending_hostname_rules() {
            self.registry
                .resolve_hostnames(self.dns.as_ref(), self.lookup_timeout)
                .await;
        }

        match peer {
            PeerAddress::Ip(addr) => TrustDecision {
                allowed: self.registry.is_trusted(addr.ip(), addr.port()),
            },
            PeerAddress::Hostname { name, port } => {
                match lookup_with_timeout(self.dns.as_ref(), name, self.lookup_timeout).await {
                    Ok(addrs) => TrustDecision {
                        allowed: addrs.first().is_some_and(|ip| self.registry.is_trusted(*ip, *port)),
                    },
                    Err(e) => {
                        tracing::debug!(peer = %name, error = %e, "Peer lookup failed, denying proxy trust");
                        metrics::record_dns_failure("peer");
                        TrustDecision::denied()
                    }
                }
            }
            PeerAddress::Unknown | PeerAddress::DomainSocket(_) => TrustDecision::denied(),
        }
    }
}
