//! Per-listener accept loop and connection serving.
//!
//! # Responsibilities
//! - Accept connections on a bound socket until shutdown
//! - Apply admission control before any byte is read
//! - Terminate TLS with the listener's live configuration
//! - Serve HTTP/1.1 and HTTP/2 on each connection via hyper
//! - Drain in-flight connections on shutdown, optionally bounded
//!
//! # Design Decisions
//! - Over-limit connections are dropped right after `accept`
//! - The TLS acceptor is rebuilt from the live config for every connection,
//!   so rotated certificates apply to the next handshake
//! - Admission is re-checked after the handshake; a connection that
//!   finished its handshake after `stop()` began is never served

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{body::Body, http::Request, middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use hyper::body::Incoming;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::http::middleware::{forwarded_middleware, ForwardingState};
use crate::lifecycle::shutdown::ShutdownSignal;
use crate::net::listener::{remove_socket_file, BoundSocket, LocalEndpoint, Socket};
use crate::net::{AdmissionPermit, ConnectionAdmission, ConnectionContext, PeerAddress};
use crate::observability::metrics;

/// Upper bound on a TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Wrap an application router with the layers every listener applies.
pub fn build_service(router: Router, forwarding: &ForwardingState, max_body_size: Option<usize>) -> Router {
    let router = match max_body_size {
        Some(limit) => router.layer(RequestBodyLimitLayer::new(limit)),
        None => router,
    };
    router
        .layer(middleware::from_fn_with_state(forwarding.clone(), forwarded_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Shared state of one listener's accept loop.
#[derive(Debug, Clone)]
pub struct ListenerServer {
    pub app: Router,
    pub admission: Arc<ConnectionAdmission>,
    pub drain_timeout: Option<Duration>,
}

enum Accepted {
    Tcp(TcpStream, std::net::SocketAddr),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream, PeerAddress),
}

async fn accept(socket: &Socket) -> io::Result<Accepted> {
    match socket {
        Socket::Tcp(listener) => {
            let (stream, peer) = listener.accept().await?;
            Ok(Accepted::Tcp(stream, peer))
        }
        #[cfg(unix)]
        Socket::Unix(listener) => {
            let (stream, addr) = listener.accept().await?;
            let peer = PeerAddress::DomainSocket(addr.as_pathname().map(Path::to_path_buf));
            Ok(Accepted::Unix(stream, peer))
        }
    }
}

impl ListenerServer {
    /// Run the accept loop until `shutdown` fires, then close the socket and
    /// drain the connections it accepted.
    pub async fn run(self, bound: BoundSocket, mut shutdown: ShutdownSignal) {
        let BoundSocket { spec, socket, local, tls } = bound;
        let name = spec.name.clone();
        let transport = spec.transport();
        let counted = spec.is_capacity_bearing();
        let nodelay = spec.options.tcp_nodelay;

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = accept(&socket) => {
                    let accepted = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!(listener = %name, error = %e, "Accept failed");
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    };

                    let permit = match self.admit(counted) {
                        Some(permit) => permit,
                        None => {
                            tracing::debug!(listener = %name, "Connection rejected");
                            continue;
                        }
                    };
                    metrics::record_connection_accepted(&name);

                    let connection = Connection {
                        app: self.app.clone(),
                        admission: self.admission.clone(),
                        shutdown: shutdown.clone(),
                        _permit: permit,
                    };

                    match accepted {
                        Accepted::Tcp(stream, peer) => {
                            if nodelay {
                                let _ = stream.set_nodelay(true);
                            }
                            let local_addr = stream.local_addr().ok();
                            let ctx = ConnectionContext::new(name.clone(), transport, PeerAddress::Ip(peer), local_addr);
                            match &tls {
                                Some(config) => {
                                    connections.spawn(connection.serve_tls(stream, config.clone(), ctx));
                                }
                                None => {
                                    connections.spawn(connection.serve(stream, ctx));
                                }
                            }
                        }
                        #[cfg(unix)]
                        Accepted::Unix(stream, peer) => {
                            let ctx = ConnectionContext::new(name.clone(), transport, peer, None);
                            connections.spawn(connection.serve(stream, ctx));
                        }
                    }
                }
            }
        }

        drop(socket);
        remove_socket_file(&local);
        tracing::info!(listener = %name, address = %local, "Listener closed");

        self.drain(&name, &local, connections).await;
    }

    /// Domain socket connections skip the counter but still honor `closed`.
    fn admit(&self, counted: bool) -> Option<Option<AdmissionPermit>> {
        if counted {
            self.admission.try_admit().ok().map(Some)
        } else if self.admission.is_closed() {
            None
        } else {
            Some(None)
        }
    }

    async fn drain(&self, name: &str, local: &LocalEndpoint, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        tracing::debug!(listener = %name, remaining = connections.len(), "Draining connections");

        let wait_all = async {
            while connections.join_next().await.is_some() {}
        };
        match self.drain_timeout {
            None => wait_all.await,
            Some(limit) => {
                if tokio::time::timeout(limit, wait_all).await.is_err() {
                    tracing::warn!(
                        listener = %name,
                        address = %local,
                        aborted = connections.len(),
                        "Drain timeout elapsed, aborting remaining connections"
                    );
                    connections.abort_all();
                    while connections.join_next().await.is_some() {}
                }
            }
        }
    }
}

/// One admitted connection; the permit is returned when this is dropped.
struct Connection {
    app: Router,
    admission: Arc<ConnectionAdmission>,
    shutdown: ShutdownSignal,
    _permit: Option<AdmissionPermit>,
}

impl Connection {
    async fn serve_tls(self, stream: TcpStream, config: RustlsConfig, ctx: ConnectionContext) {
        let acceptor = TlsAcceptor::from(config.get_inner());
        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(connection = %ctx.id, peer = %ctx.peer, error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                tracing::debug!(connection = %ctx.id, peer = %ctx.peer, "TLS handshake timed out");
                return;
            }
        };
        self.serve(stream, ctx).await;
    }

    async fn serve<I>(mut self, io: I, ctx: ConnectionContext)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.admission.is_closed() {
            tracing::debug!(connection = %ctx.id, "Shutdown in progress, dropping connection");
            return;
        }

        let ctx = Arc::new(ctx);
        let id = ctx.id;
        let app = self.app.clone();
        let service = hyper::service::service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(ctx.clone());
            app.clone().oneshot(req.map(Body::new))
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        let result = tokio::select! {
            result = conn.as_mut() => result,
            _ = self.shutdown.recv() => {
                conn.as_mut().graceful_shutdown();
                conn.as_mut().await
            }
        };
        if let Err(e) = result {
            tracing::debug!(connection = %id, error = %e, "Connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown::Shutdown;
    use crate::net::listener::bind;
    use crate::net::{ListenerSet, ListenerSpec};
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start(limit: Option<usize>) -> (std::net::SocketAddr, Shutdown, tokio::task::JoinHandle<()>) {
        let set = ListenerSet::new().with(ListenerSpec::tcp("http", "127.0.0.1", 0));
        let bound = bind(set.get("http").unwrap(), &set).await.unwrap();
        let addr = match bound.local {
            LocalEndpoint::Inet(addr) => addr,
            LocalEndpoint::Path(_) => unreachable!(),
        };

        let app = Router::new().route("/", get(|| async { "hello" }));
        let server = ListenerServer {
            app: build_service(app, &ForwardingState::disabled(), None),
            admission: Arc::new(ConnectionAdmission::new(limit)),
            drain_timeout: Some(Duration::from_secs(1)),
        };
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.run(bound, shutdown.subscribe()));
        (addr, shutdown, handle)
    }

    async fn get_root(addr: std::net::SocketAddr) -> io::Result<String> {
        let mut stream = TcpStream::connect(addr).await?;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut out = String::new();
        stream.read_to_string(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn serves_and_stops() {
        let (addr, shutdown, handle) = start(None).await;

        let response = get_root(addr).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));

        shutdown.trigger();
        handle.await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn over_limit_connection_is_closed_without_response() {
        let (addr, shutdown, handle) = start(Some(1)).await;

        // Hold the only slot with an idle keep-alive connection.
        let mut held = TcpStream::connect(addr).await.unwrap();
        held.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").await.unwrap();
        let mut buf = [0u8; 256];
        let n = held.read(&mut buf).await.unwrap();
        assert!(n > 0);

        let mut rejected = TcpStream::connect(addr).await.unwrap();
        let _ = rejected
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await;
        let mut out = Vec::new();
        let read = rejected.read_to_end(&mut out).await;
        assert!(read.is_err() || out.is_empty());

        drop(held);
        shutdown.trigger();
        handle.await.unwrap();
    }
}
