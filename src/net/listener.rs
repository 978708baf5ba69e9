//! Listener descriptions and socket binding.
//!
//! # Responsibilities
//! - Describe one listener (`ListenerSpec`) and a generation's set of them
//! - Bind TCP, TLS and Unix domain sockets with the configured options
//! - Classify bind failures and name the listeners competing for a port

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use tokio::net::{TcpListener, TcpSocket};
#[cfg(unix)]
use tokio::net::UnixListener;

use crate::net::connection::Transport;
use crate::net::tls::{TlsError, TlsMaterial};

/// Which application a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerRole {
    Main,
    Management,
}

/// Transport and endpoint of a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    Tcp {
        host: String,
        port: u16,
    },
    Tls {
        host: String,
        port: u16,
        material: TlsMaterial,
        /// Re-read the material periodically (file based material only).
        reload_period: Option<Duration>,
    },
    UnixSocket {
        path: PathBuf,
    },
}

/// Low level socket settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub reuse_address: bool,
    pub tcp_nodelay: bool,
    pub backlog: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            reuse_address: true,
            tcp_nodelay: true,
            backlog: 1024,
        }
    }
}

/// Immutable description of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSpec {
    pub name: Arc<str>,
    pub role: ListenerRole,
    pub kind: ListenerKind,
    pub options: SocketOptions,
}

impl ListenerSpec {
    pub fn tcp(name: &str, host: impl Into<String>, port: u16) -> Self {
        Self::new(name, ListenerKind::Tcp { host: host.into(), port })
    }

    pub fn tls(name: &str, host: impl Into<String>, port: u16, material: TlsMaterial) -> Self {
        Self::new(
            name,
            ListenerKind::Tls {
                host: host.into(),
                port,
                material,
                reload_period: None,
            },
        )
    }

    pub fn unix(name: &str, path: impl Into<PathBuf>) -> Self {
        Self::new(name, ListenerKind::UnixSocket { path: path.into() })
    }

    fn new(name: &str, kind: ListenerKind) -> Self {
        Self {
            name: Arc::from(name),
            role: ListenerRole::Main,
            kind,
            options: SocketOptions::default(),
        }
    }

    pub fn with_role(mut self, role: ListenerRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Only meaningful for TLS listeners; ignored otherwise.
    pub fn with_reload_period(mut self, period: Duration) -> Self {
        if let ListenerKind::Tls { reload_period, .. } = &mut self.kind {
            *reload_period = Some(period);
        }
        self
    }

    pub fn transport(&self) -> Transport {
        match self.kind {
            ListenerKind::Tcp { .. } => Transport::Tcp,
            ListenerKind::Tls { .. } => Transport::Tls,
            ListenerKind::UnixSocket { .. } => Transport::UnixSocket,
        }
    }

    /// Configured port, for TCP based listeners.
    pub fn port(&self) -> Option<u16> {
        match &self.kind {
            ListenerKind::Tcp { port, .. } | ListenerKind::Tls { port, .. } => Some(*port),
            ListenerKind::UnixSocket { .. } => None,
        }
    }

    /// Domain sockets do not count against the connection limit.
    pub fn is_capacity_bearing(&self) -> bool {
        !matches!(self.kind, ListenerKind::UnixSocket { .. })
    }

    pub fn endpoint(&self) -> String {
        match &self.kind {
            ListenerKind::Tcp { host, port } | ListenerKind::Tls { host, port, .. } => {
                format!("{}:{}", host, port)
            }
            ListenerKind::UnixSocket { path } => format!("unix:{}", path.display()),
        }
    }
}

/// Ordered set of listeners brought up together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerSet {
    listeners: Vec<ListenerSpec>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, spec: ListenerSpec) -> Self {
        self.listeners.push(spec);
        self
    }

    pub fn push(&mut self, spec: ListenerSpec) {
        self.listeners.push(spec);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ListenerSpec> {
        self.listeners.iter()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ListenerSpec> {
        self.listeners.iter().find(|spec| &*spec.name == name)
    }

    /// Names of all listeners configured on `port` (ephemeral port 0 excluded).
    pub fn listeners_on_port(&self, port: u16) -> Vec<String> {
        if port == 0 {
            return Vec::new();
        }
        self.listeners
            .iter()
            .filter(|spec| spec.port() == Some(port))
            .map(|spec| spec.name.to_string())
            .collect()
    }
}

impl<'a> IntoIterator for &'a ListenerSet {
    type Item = &'a ListenerSpec;
    type IntoIter = std::slice::Iter<'a, ListenerSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.listeners.iter()
    }
}

/// Failure to bring a listener up.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("address {endpoint} is already in use (listeners competing for port {port}: {})", .listeners.join(", "))]
    AddressInUse {
        endpoint: String,
        port: u16,
        listeners: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("domain socket {} of listener '{listener}' is already in use", .path.display())]
    SocketInUse {
        listener: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied binding listener '{listener}' to {endpoint}")]
    PermissionDenied {
        listener: String,
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot resolve bind address {endpoint} for listener '{listener}'")]
    Resolve {
        listener: String,
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid TLS material for listener '{listener}': {source}")]
    Tls {
        listener: String,
        #[source]
        source: TlsError,
    },
    #[error("failed to bind listener '{listener}' to {endpoint}: {source}")]
    Io {
        listener: String,
        endpoint: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BindError::AddressInUse { .. } => "address_in_use",
            BindError::SocketInUse { .. } => "socket_in_use",
            BindError::PermissionDenied { .. } => "permission_denied",
            BindError::Resolve { .. } => "resolve",
            BindError::Tls { .. } => "tls",
            BindError::Io { .. } => "io",
        }
    }

    /// Listeners named by this error.
    pub fn listeners(&self) -> Vec<String> {
        match self {
            BindError::AddressInUse { listeners, .. } => listeners.clone(),
            BindError::SocketInUse { listener, .. }
            | BindError::PermissionDenied { listener, .. }
            | BindError::Resolve { listener, .. }
            | BindError::Tls { listener, .. }
            | BindError::Io { listener, .. } => vec![listener.clone()],
        }
    }

    fn from_io(spec: &ListenerSpec, set: &ListenerSet, source: io::Error) -> Self {
        let endpoint = spec.endpoint();
        let listener = spec.name.to_string();
        match (source.kind(), &spec.kind) {
            (io::ErrorKind::AddrInUse, ListenerKind::UnixSocket { path }) => BindError::SocketInUse {
                listener,
                path: path.clone(),
                source,
            },
            (io::ErrorKind::AddrInUse, _) => {
                let port = spec.port().unwrap_or(0);
                let mut listeners = set.listeners_on_port(port);
                if !listeners.contains(&listener) {
                    listeners.insert(0, listener);
                }
                BindError::AddressInUse {
                    endpoint,
                    port,
                    listeners,
                    source,
                }
            }
            (io::ErrorKind::PermissionDenied, _) => BindError::PermissionDenied {
                listener,
                endpoint,
                source,
            },
            _ => BindError::Io {
                listener,
                endpoint,
                source,
            },
        }
    }
}

/// A listening socket.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Where a bound socket actually listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEndpoint {
    Inet(SocketAddr),
    Path(PathBuf),
}

impl fmt::Display for LocalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalEndpoint::Inet(addr) => write!(f, "{}", addr),
            LocalEndpoint::Path(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A listener whose socket is bound but not yet accepting.
#[derive(Debug)]
pub struct BoundSocket {
    pub spec: ListenerSpec,
    pub socket: Socket,
    pub local: LocalEndpoint,
    /// Live TLS configuration, shared with the accept loop for rotation.
    pub tls: Option<RustlsConfig>,
}

impl BoundSocket {
    /// Close the socket without ever accepting on it.
    pub fn close(self) {
        let BoundSocket { spec, socket, local, .. } = self;
        drop(socket);
        remove_socket_file(&local);
        tracing::info!(listener = %spec.name, address = %local, "Listener closed");
    }
}

/// Remove the filesystem entry of a closed domain socket.
pub fn remove_socket_file(local: &LocalEndpoint) {
    if let LocalEndpoint::Path(path) = local {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove domain socket file");
            }
        }
    }
}

/// Bind one listener from `set`. TLS material is loaded before the socket
/// is opened, so bad material never leaves a bound port behind.
pub async fn bind(spec: &ListenerSpec, set: &ListenerSet) -> Result<BoundSocket, BindError> {
    match &spec.kind {
        ListenerKind::Tcp { host, port } => {
            let listener = bind_tcp(spec, set, host, *port).await?;
            let local = listener
                .local_addr()
                .map_err(|e| BindError::from_io(spec, set, e))?;
            Ok(BoundSocket {
                spec: spec.clone(),
                socket: Socket::Tcp(listener),
                local: LocalEndpoint::Inet(local),
                tls: None,
            })
        }
        ListenerKind::Tls { host, port, material, .. } => {
            let tls = material.load().await.map_err(|source| BindError::Tls {
                listener: spec.name.to_string(),
                source,
            })?;
            let listener = bind_tcp(spec, set, host, *port).await?;
            let local = listener
                .local_addr()
                .map_err(|e| BindError::from_io(spec, set, e))?;
            Ok(BoundSocket {
                spec: spec.clone(),
                socket: Socket::Tcp(listener),
                local: LocalEndpoint::Inet(local),
                tls: Some(tls),
            })
        }
        #[cfg(unix)]
        ListenerKind::UnixSocket { path } => {
            remove_stale_socket(path).await;
            let listener = UnixListener::bind(path).map_err(|e| BindError::from_io(spec, set, e))?;
            Ok(BoundSocket {
                spec: spec.clone(),
                socket: Socket::Unix(listener),
                local: LocalEndpoint::Path(path.clone()),
                tls: None,
            })
        }
        #[cfg(not(unix))]
        ListenerKind::UnixSocket { .. } => Err(BindError::Io {
            listener: spec.name.to_string(),
            endpoint: spec.endpoint(),
            source: io::Error::new(io::ErrorKind::Unsupported, "domain sockets are not supported on this platform"),
        }),
    }
}

/// Remove a socket file left behind by a process that is gone. A socket
/// something still listens on is left alone and fails the bind.
#[cfg(unix)]
async fn remove_stale_socket(path: &Path) {
    use std::os::unix::fs::FileTypeExt;

    let is_socket = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta.file_type().is_socket(),
        Err(_) => return,
    };
    if !is_socket {
        return;
    }
    match tokio::net::UnixStream::connect(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
            tracing::warn!(path = %path.display(), "Removing stale domain socket file");
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(path = %path.display(), error = %e, "Failed to remove stale domain socket file");
            }
        }
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Domain socket probe failed"),
    }
}

async fn bind_tcp(spec: &ListenerSpec, set: &ListenerSet, host: &str, port: u16) -> Result<TcpListener, BindError> {
    let addr = tokio::net::lookup_host((host, port))
        .await
        .and_then(|mut addrs| {
            addrs
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address"))
        })
        .map_err(|source| BindError::Resolve {
            listener: spec.name.to_string(),
            endpoint: spec.endpoint(),
            source,
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| BindError::from_io(spec, set, e))?;

    socket
        .set_reuseaddr(spec.options.reuse_address)
        .map_err(|e| BindError::from_io(spec, set, e))?;
    socket.bind(addr).map_err(|e| BindError::from_io(spec, set, e))?;
    socket
        .listen(spec.options.backlog)
        .map_err(|e| BindError::from_io(spec, set, e))
}
