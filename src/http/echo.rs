//! Demo application served by the binary.
//!
//! Every request is answered with its effective metadata; `POST` bodies are
//! read through a [`BodyReader`] on the blocking pool and echoed back.

use std::io::Read;

use axum::{
    body::Body,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::http::body::{BodyReader, DEFAULT_CAPACITY};
use crate::http::request::Effective;

pub fn router() -> Router {
    Router::new().fallback(echo)
}

/// Management endpoints.
pub fn management_router() -> Router {
    Router::new().route("/health", get(|| async { "UP" }))
}

async fn echo(Effective(meta): Effective, method: Method, body: Body) -> Response {
    let mut text = format!(
        "scheme: {}\nhost: {}\nport: {}\nremote: {}\nuri: {}\n",
        meta.scheme,
        meta.host,
        meta.port(),
        meta.remote.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".to_string()),
        meta.absolute_uri,
    );

    if method == Method::POST {
        let reader = BodyReader::spawn(body, DEFAULT_CAPACITY);
        let read = tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut content = String::new();
            reader.read_to_string(&mut content).map(|_| content)
        })
        .await;

        match read {
            Ok(Ok(content)) => {
                text.push('\n');
                text.push_str(&content);
            }
            Ok(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
            Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }

    text.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{build_service, ForwardingState};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn echoes_metadata_and_body() {
        let app = build_service(router(), &ForwardingState::disabled(), None);
        let req = Request::builder()
            .method(Method::POST)
            .uri("/submit?x=1")
            .header(header::HOST, "example.com")
            .body(Body::from("payload"))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("scheme: http\n"));
        assert!(text.contains("uri: http://example.com/submit?x=1\n"));
        assert!(text.ends_with("\npayload"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let app = build_service(router(), &ForwardingState::disabled(), Some(4));
        let req = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(header::HOST, "example.com")
            .header(header::CONTENT_LENGTH, "7")
            .body(Body::from("payload"))
            .unwrap();

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
