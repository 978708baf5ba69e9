//! Forwarded header middleware.
//!
//! Computes the effective metadata of every request once, stores it in the
//! request extensions and rewrites the `Host` header to the effective host.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};

use crate::config::schema::ProxyConfig;
use crate::forwarding::{
    compute_effective, EffectiveRequestMetadata, ForwardedMode, ForwardingOptions, ProxyTrustResolver, TrustDecision,
    TrustedProxyRegistry,
};
use crate::http::request::raw_metadata;
use crate::net::{ConnectionContext, PeerAddress, Transport};

/// Everything the middleware needs, shared by all listeners of a generation.
#[derive(Debug, Clone)]
pub struct ForwardingState {
    pub resolver: ProxyTrustResolver,
    pub options: Arc<ForwardingOptions>,
    /// Master switch; when false no request is ever trusted.
    pub enabled: bool,
}

impl ForwardingState {
    /// Forwarded headers are never honored.
    pub fn disabled() -> Self {
        Self {
            resolver: ProxyTrustResolver::with_system_dns(Arc::new(TrustedProxyRegistry::empty())),
            options: Arc::new(ForwardingOptions::default()),
            enabled: false,
        }
    }

    pub fn new(resolver: ProxyTrustResolver, options: ForwardingOptions) -> Self {
        Self {
            resolver,
            options: Arc::new(options),
            enabled: true,
        }
    }

    /// Options from the `[proxy]` section. Header names must already be
    /// validated.
    pub fn options_from_config(config: &ProxyConfig) -> ForwardingOptions {
        let defaults = ForwardingOptions::default();
        ForwardingOptions {
            allow_forwarded: config.allow_forwarded,
            allow_x_forwarded: config.allow_x_forwarded,
            precedence: config.precedence,
            enable_forwarded_host: config.enable_forwarded_host,
            forwarded_host_header: config
                .forwarded_host_header
                .parse()
                .unwrap_or(defaults.forwarded_host_header),
            enable_forwarded_prefix: config.enable_forwarded_prefix,
            forwarded_prefix_header: config
                .forwarded_prefix_header
                .parse()
                .unwrap_or(defaults.forwarded_prefix_header),
        }
    }

    /// Header family that applies to a request with `headers`.
    pub fn mode_for(&self, headers: &HeaderMap) -> Option<ForwardedMode> {
        if self.enabled {
            self.options.select_mode(headers)
        } else {
            None
        }
    }

    /// Trust decision for the connection. Only looked up when there is
    /// something to trust.
    pub async fn decide(&self, ctx: &ConnectionContext, mode: Option<ForwardedMode>) -> TrustDecision {
        match mode {
            Some(_) => ctx.trust_decision(&self.resolver).await,
            None => TrustDecision::denied(),
        }
    }

    pub fn effective<B>(
        &self,
        req: &axum::http::Request<B>,
        ctx: &ConnectionContext,
        decision: TrustDecision,
        mode: Option<ForwardedMode>,
    ) -> EffectiveRequestMetadata {
        let raw = raw_metadata(req, ctx);
        compute_effective(&raw, decision, mode, &self.options)
    }
}

/// Context for requests that did not arrive through a listener.
fn detached_context() -> Arc<ConnectionContext> {
    Arc::new(ConnectionContext::new(
        Arc::from("detached"),
        Transport::Tcp,
        PeerAddress::Unknown,
        None,
    ))
}

/// Attach `Arc<EffectiveRequestMetadata>` to the request.
pub async fn forwarded_middleware(State(state): State<ForwardingState>, mut req: Request, next: Next) -> Response {
    if req.extensions().get::<Arc<EffectiveRequestMetadata>>().is_some() {
        return next.run(req).await;
    }

    let ctx = req
        .extensions()
        .get::<Arc<ConnectionContext>>()
        .cloned()
        .unwrap_or_else(detached_context);
    let mode = state.mode_for(req.headers());
    let decision = state.decide(&ctx, mode).await;
    let effective = state.effective(&req, &ctx, decision, mode);

    if decision.allowed && mode.is_some() {
        let host = effective.host_header();
        let current = req.headers().get(header::HOST).and_then(|v| v.to_str().ok());
        if current != Some(host.as_str()) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                req.headers_mut().insert(header::HOST, value);
            }
        }
    }

    tracing::trace!(uri = %effective.absolute_uri, "Effective request metadata");
    req.extensions_mut().insert(Arc::new(effective));
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Effective;
    use axum::{body::Body, middleware::from_fn_with_state, routing::get, Router};
    use tower::ServiceExt;

    async fn echo(Effective(meta): Effective) -> String {
        format!("{} {}", meta.absolute_uri, meta.remote.as_ref().map(|r| r.to_string()).unwrap_or_default())
    }

    fn app(trusted: &[&str]) -> Router {
        let registry = Arc::new(TrustedProxyRegistry::build(trusted.iter().copied()).unwrap());
        let state = ForwardingState::new(
            ProxyTrustResolver::with_system_dns(registry),
            ForwardingOptions::default(),
        );
        Router::new()
            .route("/path", get(echo))
            .layer(from_fn_with_state(state, forwarded_middleware))
    }

    fn request(peer: PeerAddress) -> Request {
        let mut req = Request::builder()
            .uri("/path")
            .header(header::HOST, "internal:8080")
            .header("x-forwarded-proto", "https")
            .header("x-forwarded-host", "public.example")
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut().insert(Arc::new(ConnectionContext::new(
            Arc::from("http"),
            Transport::Tcp,
            peer,
            Some("127.0.0.1:8080".parse().unwrap()),
        )));
        req
    }

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn trusted_peer_gets_forwarded_view() {
        let peer = PeerAddress::Ip("10.0.0.5:40000".parse().unwrap());
        let response = app(&["10.0.0.0/8"]).oneshot(request(peer)).await.unwrap();
        assert_eq!(body_of(response).await, "https://public.example/path 203.0.113.9:40000");
    }

    #[tokio::test]
    async fn untrusted_peer_keeps_wire_view() {
        let peer = PeerAddress::Ip("192.168.1.5:40000".parse().unwrap());
        let response = app(&["10.0.0.0/8"]).oneshot(request(peer)).await.unwrap();
        assert_eq!(body_of(response).await, "http://internal:8080/path 192.168.1.5:40000");
    }

    #[tokio::test]
    async fn domain_socket_peer_is_never_trusted() {
        let response = app(&["0.0.0.0/0"])
            .oneshot(request(PeerAddress::DomainSocket(None)))
            .await
            .unwrap();
        assert_eq!(body_of(response).await, "http://internal:8080/path ");
    }

    #[tokio::test]
    async fn disabled_state_ignores_headers() {
        let app = Router::new()
            .route("/path", get(echo))
            .layer(from_fn_with_state(ForwardingState::disabled(), forwarded_middleware));
        let peer = PeerAddress::Ip("10.0.0.5:40000".parse().unwrap());
        let response = app.oneshot(request(peer)).await.unwrap();
        assert_eq!(body_of(response).await, "http://internal:8080/path 10.0.0.5:40000");
    }
}
