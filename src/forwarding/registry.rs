//! Trusted proxy registry.
//!
//! # Responsibilities
//! - Hold the rules built from configuration
//! - Resolve hostname rules once per registry, concurrently
//! - Answer "is this peer a trusted proxy?" without locking
//!
//! # Design Decisions
//! - Empty registry trusts nothing (fail closed)
//! - A hostname whose lookup fails is dropped, never fatal for other rules
//! - Resolved rules are published in one atomic swap after every lookup finished

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::join_all;
use tokio::sync::OnceCell;

use crate::forwarding::dns::{lookup_with_timeout, DnsResolver};
use crate::forwarding::matcher::{AddressMatcher, RuleError};
use crate::observability::metrics;

/// Outcome of resolving the hostname rules of a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    /// Number of addresses added to the trusted set.
    pub resolved_addresses: usize,
    /// Hostname rules dropped because their lookup failed.
    pub dropped: Vec<String>,
}

/// Set of trusted proxies for one configuration.
#[derive(Debug)]
pub struct TrustedProxyRegistry {
    /// CIDR and exact-IP rules, known at build time.
    static_rules: Vec<AddressMatcher>,
    /// Hostname rules awaiting resolution.
    hostname_rules: Vec<AddressMatcher>,
    /// Exact rules produced by resolving `hostname_rules`.
    resolved: ArcSwap<Vec<AddressMatcher>>,
    /// Completes once, when every hostname lookup has finished.
    resolution: OnceCell<ResolutionReport>,
}

impl TrustedProxyRegistry {
    /// Build a registry from rule strings. Any malformed rule fails the build.
    pub fn build<I, S>(rules: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut static_rules = Vec::new();
        let mut hostname_rules = Vec::new();

        for rule in rules {
            let matcher = AddressMatcher::parse(rule.as_ref())?;
            if matcher.is_hostname() {
                hostname_rules.push(matcher);
            } else {
                static_rules.push(matcher);
            }
        }

        tracing::debug!(
            static_rules = static_rules.len(),
            hostname_rules = hostname_rules.len(),
            "Trusted proxy registry built"
        );

        Ok(Self {
            static_rules,
            hostname_rules,
            resolved: ArcSwap::from_pointee(Vec::new()),
            resolution: OnceCell::new(),
        })
    }

    /// A registry with no rules; trusts nobody.
    pub fn empty() -> Self {
        Self {
            static_rules: Vec::new(),
            hostname_rules: Vec::new(),
            resolved: ArcSwap::from_pointee(Vec::new()),
            resolution: OnceCell::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.static_rules.is_empty() && self.hostname_rules.is_empty()
    }

    pub fn has_hostname_rules(&self) -> bool {
        !self.hostname_rules.is_empty()
    }

    /// True until the hostname rules have been resolved.
    pub fn has_pending_hostname_rules(&self) -> bool {
        self.has_hostname_rules() && !self.resolution.initialized()
    }

    /// Resolve every hostname rule, one lookup per rule, all in flight at once.
    ///
    /// Runs at most once per registry; concurrent callers wait for the same
    /// resolution and later callers get the cached report.
    pub async fn resolve_hostnames(
        &self,
        resolver: &dyn DnsResolver,
        timeout: Duration,
    ) -> ResolutionReport {
        self.resolution
            .get_or_init(|| self.resolve_all(resolver, timeout))
            .await
            .clone()
    }

    async fn resolve_all(&self, resolver: &dyn DnsResolver, timeout: Duration) -> ResolutionReport {
        let lookups = self.hostname_rules.iter().filter_map(|rule| match rule {
            AddressMatcher::Hostname { name, port } => Some(async move {
                let result = lookup_with_timeout(resolver, name, timeout).await;
                (name, *port, result)
            }),
            _ => None,
        });

        let mut report = ResolutionReport::default();
        let mut resolved = Vec::new();

        for (name, port, result) in join_all(lookups).await {
            match result {
                Ok(addrs) => {
                    tracing::debug!(host = %name, addresses = ?addrs, "Trusted proxy hostname resolved");
                    report.resolved_addresses += addrs.len();
                    resolved.extend(addrs.into_iter().map(|addr| AddressMatcher::Exact { addr, port }));
                }
                Err(e) => {
                    tracing::warn!(host = %name, error = %e, "Dropping trusted proxy hostname: lookup failed");
                    metrics::record_dns_failure("trusted_proxy");
                    report.dropped.push(name.clone());
                }
            }
        }

        self.resolved.store(Arc::new(resolved));
        report
    }

    /// Returns true iff the peer matches a CIDR, exact or resolved rule.
    pub fn is_trusted(&self, peer: IpAddr, peer_port: u16) -> bool {
        if self.static_rules.iter().any(|rule| rule.matches(peer, peer_port)) {
            return true;
        }
        self.resolved
            .load()
            .iter()
            .any(|rule| rule.matches(peer, peer_port))
    }
}
