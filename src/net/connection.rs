//! Connection identity, admission control and per-connection context.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Admit or reject connections against the configured maximum
//! - Describe the peer of a connection for trust evaluation
//! - Hold the single trust decision taken for a connection

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::forwarding::{ProxyTrustResolver, TrustDecision};
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Peer of a connection, as far as the transport can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// Literal IP and port.
    Ip(SocketAddr),
    /// Transport only knows a name; an extra lookup is needed.
    Hostname { name: String, port: u16 },
    /// Local domain socket (path when the peer is bound to one).
    DomainSocket(Option<PathBuf>),
    /// Transport cannot report a peer at all (in-process channels).
    Unknown,
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddress::Ip(addr) => write!(f, "{}", addr),
            PeerAddress::Hostname { name, port } => write!(f, "{}:{}", name, port),
            PeerAddress::DomainSocket(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddress::DomainSocket(None) => write!(f, "unix:<unnamed>"),
            PeerAddress::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// `max_connections` reached.
    AtCapacity,
    /// Shutdown has begun.
    Closed,
}

/// Live connection counter shared by every capacity-bearing listener of a
/// generation.
///
/// Admission is a compare-and-increment loop, so concurrent accepts can never
/// push the count past the limit.
#[derive(Debug)]
pub struct ConnectionAdmission {
    limit: Option<usize>,
    active: AtomicUsize,
    rejected: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionAdmission {
    /// `limit` of `None` admits everything until closed.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            active: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Try to take a slot for a new connection.
    pub fn try_admit(self: &Arc<Self>) -> Result<AdmissionPermit, Rejection> {
        if self.is_closed() {
            return Err(self.reject(Rejection::Closed));
        }

        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if self.limit.is_some_and(|limit| current >= limit) {
                return Err(self.reject(Rejection::AtCapacity));
            }
            match self.active.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        metrics::set_active_connections(current + 1);
        Ok(AdmissionPermit {
            admission: Some(Arc::clone(self)),
        })
    }

    fn reject(&self, reason: Rejection) -> Rejection {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_rejected(reason);
        reason
    }

    /// Stop admitting connections. Permits already handed out stay valid.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    fn release(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        metrics::set_active_connections(previous.saturating_sub(1));
    }
}

/// A held connection slot.
///
/// The slot is returned exactly once: on the first `release` or on drop,
/// whichever comes first.
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Option<Arc<ConnectionAdmission>>,
}

impl AdmissionPermit {
    pub fn release(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.release();
            tracing::trace!("Connection slot released");
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}

/// Transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Tls,
    UnixSocket,
}

impl Transport {
    /// Scheme seen by clients of this transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Transport::Tls => "https",
            Transport::Tcp | Transport::UnixSocket => "http",
        }
    }
}

/// Everything known about one accepted connection.
///
/// Inserted into the extensions of every request served on the connection.
/// The trust decision is computed lazily, at most once, and never shared
/// with any other connection.
#[derive(Debug)]
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub listener: Arc<str>,
    pub transport: Transport,
    pub peer: PeerAddress,
    pub local_addr: Option<SocketAddr>,
    trust: OnceCell<TrustDecision>,
}

impl ConnectionContext {
    pub fn new(listener: Arc<str>, transport: Transport, peer: PeerAddress, local_addr: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::new(),
            listener,
            transport,
            peer,
            local_addr,
            trust: OnceCell::new(),
        }
    }

    /// Trust decision for this connection, resolving it on first use.
    pub async fn trust_decision(&self, resolver: &ProxyTrustResolver) -> TrustDecision {
        *self.trust.get_or_init(|| resolver.resolve(&self.peer)).await
    }
}
