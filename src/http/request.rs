//! Request metadata extraction.
//!
//! # Responsibilities
//! - Describe a request exactly as it arrived (scheme, host, port, remote)
//! - Expose the effective metadata computed by the forwarding middleware
//!
//! # Design Decisions
//! - Host comes from the `Host` header, falling back to the URI authority
//!   (HTTP/2 requests carry it in `:authority`)
//! - The remote address comes from the connection, never from headers

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, Request, StatusCode};

use crate::forwarding::forwarded::split_host_port;
use crate::forwarding::{EffectiveRequestMetadata, RawRequestMetadata, RemoteAddress};
use crate::net::{ConnectionContext, PeerAddress};

/// Host used when a request names none at all (HTTP/1.0 without `Host`).
const FALLBACK_HOST: &str = "localhost";

/// Build the wire view of a request.
pub fn raw_metadata<'a, B>(req: &'a Request<B>, ctx: &ConnectionContext) -> RawRequestMetadata<'a> {
    let scheme = ctx.transport.scheme();

    let authority = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .map(str::trim)
        .filter(|a| !a.is_empty());

    let (host, port) = match authority {
        Some(authority) => {
            let (host, port) = split_host_port(authority);
            (host, port.and_then(|p| p.parse::<u16>().ok()))
        }
        None => (FALLBACK_HOST, ctx.local_addr.map(|addr| addr.port())),
    };

    let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let authority = match port {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let absolute_uri: Arc<str> = Arc::from(format!("{}://{}{}", scheme, authority, path_and_query));

    RawRequestMetadata {
        scheme,
        host,
        port,
        remote: remote_address(&ctx.peer),
        path_and_query,
        absolute_uri,
        headers: req.headers(),
    }
}

/// Remote address as reported by the transport.
pub fn remote_address(peer: &PeerAddress) -> Option<RemoteAddress> {
    match peer {
        PeerAddress::Ip(addr) => Some(RemoteAddress::new(addr.ip().to_canonical().to_string(), Some(addr.port()))),
        PeerAddress::Hostname { name, port } => Some(RemoteAddress::new(name.clone(), Some(*port))),
        PeerAddress::DomainSocket(_) | PeerAddress::Unknown => None,
    }
}

/// Extractor for the effective metadata of the current request.
///
/// Fails with 500 when the forwarding middleware is not installed.
#[derive(Debug, Clone)]
pub struct Effective(pub Arc<EffectiveRequestMetadata>);

impl<S> FromRequestParts<S> for Effective
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Arc<EffectiveRequestMetadata>>()
            .cloned()
            .map(Effective)
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "request metadata unavailable"))
    }
}
