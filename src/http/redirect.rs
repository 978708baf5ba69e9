//! Redirect of plain-text requests to the encrypted listener.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Router,
};

use crate::forwarding::forwarded::split_host_port;

/// Router answering every request with a `301` to `https://host:port/uri`.
pub fn redirect_router(https_port: u16) -> Router {
    Router::new().fallback(redirect_to_https).with_state(https_port)
}

async fn redirect_to_https(State(https_port): State<u16>, req: Request) -> Response {
    match location(&req, https_port) {
        Some(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Redirect target, or `None` when the request names no host.
fn location<B>(req: &axum::http::Request<B>, https_port: u16) -> Option<String> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())?;
    let (host, _) = split_host_port(host);
    let uri = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    Some(format!("https://{}:{}{}", host, https_port, uri))
}
