//! Trusted proxy rule matching.
//!
//! # Responsibilities
//! - Parse one trusted-proxy rule string into an `AddressMatcher`
//! - Match a peer IP/port pair against a resolved rule
//!
//! # Design Decisions
//! - Anything containing `/digits` is a CIDR block, never a hostname
//! - Literal IPs are detected at parse time; everything else defers to DNS
//! - `localhost` is pinned to `127.0.0.1` (no DNS round trip)
//! - A port of zero or no port at all means "any port"

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use ipnet::IpNet;

/// Error produced when a trusted proxy rule cannot be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("invalid CIDR block '{0}'")]
    InvalidCidr(String),
    #[error("invalid port in trusted proxy rule '{0}'")]
    InvalidPort(String),
    #[error("invalid hostname in trusted proxy rule '{0}'")]
    InvalidHostname(String),
    #[error("empty trusted proxy rule")]
    Empty,
}

/// One trust rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressMatcher {
    /// Network block; port-agnostic.
    Cidr(IpNet),
    /// Literal address with an optional port constraint.
    Exact { addr: IpAddr, port: Option<u16> },
    /// Hostname that must be resolved before it can match anything.
    Hostname { name: String, port: Option<u16> },
}

impl AddressMatcher {
    /// Parse a rule: `10.0.0.0/8`, `192.168.1.1`, `192.168.1.1:8080`,
    /// `[::1]:8080`, `proxy.internal`, `proxy.internal:9000`.
    pub fn parse(rule: &str) -> Result<Self, RuleError> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(RuleError::Empty);
        }

        if looks_like_cidr(rule) {
            return rule
                .parse::<IpNet>()
                .map(|net| AddressMatcher::Cidr(net.trunc()))
                .map_err(|_| RuleError::InvalidCidr(rule.to_string()));
        }

        if let Ok(addr) = rule.parse::<IpAddr>() {
            return Ok(AddressMatcher::Exact { addr: addr.to_canonical(), port: None });
        }

        if let Ok(sock) = rule.parse::<SocketAddr>() {
            return Ok(AddressMatcher::Exact {
                addr: sock.ip().to_canonical(),
                port: wildcard(sock.port()),
            });
        }

        let (name, port) = match rule.rsplit_once(':') {
            Some((name, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RuleError::InvalidPort(rule.to_string()))?;
                (name, wildcard(port))
            }
            None => (rule, None),
        };

        if !is_valid_hostname(name) {
            return Err(RuleError::InvalidHostname(rule.to_string()));
        }

        if name.eq_ignore_ascii_case("localhost") {
            return Ok(AddressMatcher::Exact {
                addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port,
            });
        }

        Ok(AddressMatcher::Hostname {
            name: name.to_ascii_lowercase(),
            port,
        })
    }

    /// Returns true if the peer matches this rule.
    ///
    /// Hostname rules never match; they have to be resolved into `Exact`
    /// rules first.
    pub fn matches(&self, peer: IpAddr, peer_port: u16) -> bool {
        let peer = peer.to_canonical();
        match self {
            AddressMatcher::Cidr(net) => net.contains(&peer),
            AddressMatcher::Exact { addr, port } => {
                *addr == peer && port.map_or(true, |p| p == peer_port)
            }
            AddressMatcher::Hostname { .. } => false,
        }
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, AddressMatcher::Hostname { .. })
    }
}

impl std::fmt::Display for AddressMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressMatcher::Cidr(net) => write!(f, "{}", net),
            AddressMatcher::Exact { addr, port: Some(port) } => {
                write!(f, "{}", SocketAddr::new(*addr, *port))
            }
            AddressMatcher::Exact { addr, port: None } => write!(f, "{}", addr),
            AddressMatcher::Hostname { name, port: Some(port) } => write!(f, "{}:{}", name, port),
            AddressMatcher::Hostname { name, port: None } => write!(f, "{}", name),
        }
    }
}

fn wildcard(port: u16) -> Option<u16> {
    (port != 0).then_some(port)
}

fn looks_like_cidr(rule: &str) -> bool {
    match rule.rsplit_once('/') {
        Some((_, prefix)) => !prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}
