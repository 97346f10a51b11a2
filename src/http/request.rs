//! Per-request instrumentation.
//!
//! # Responsibilities
//! - Assign a request ID (UUID v4) unless the caller sent `x-request-id`
//! - Echo the ID on the response
//! - Open a `request` span so every event logged while handling the
//!   request carries `request_id`, `method` and `path`

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Span opened around each request.
pub fn request_span(request: &Request<Body>) -> tracing::Span {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown");
    tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        version = ?request.version(),
    )
}

/// Wrap `router` with request ID and trace layers.
pub fn instrument(router: Router) -> Router {
    // Outermost layer last: the ID is set before the span is opened.
    router
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use tower::ServiceExt;

    #[tokio::test]
    async fn assigns_and_echoes_request_id() {
        let app = instrument(Router::new().route("/hc", get(|| async { "Healthy" })));

        let response = app
            .clone()
            .oneshot(Request::get("/hc").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let generated = response.headers().get(X_REQUEST_ID).unwrap().to_str().unwrap();
        assert!(uuid::Uuid::parse_str(generated).is_ok());

        let response = app
            .oneshot(
                Request::get("/hc")
                    .header(X_REQUEST_ID, "caller-supplied")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "caller-supplied");
    }
}
