//! Session controller plane: admission, token mint, worker launch.

pub mod admission;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{connect_info::ConnectInfo, DefaultBodyLimit, FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
    routing::{get, post},
    Router,
};
use subtle::ConstantTimeEq;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::ControllerConfig;
use crate::error::ApiError;
use crate::orchestrator::Orchestrator;
use crate::ratelimit::RateLimiter;
use crate::shutdown::ShutdownCoordinator;
use crate::signer::Signer;
use crate::store::SessionStore;

use handlers::*;

/// Shared handles for the controller router. Created once at startup.
#[derive(Clone)]
pub struct ControllerState {
    pub store: Arc<dyn SessionStore>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub signer: Arc<Signer>,
    pub limiter: Arc<RateLimiter>,
    pub config: Arc<ControllerConfig>,
    pub shutdown: ShutdownCoordinator,
}

/// Extract a Bearer token from the Authorization header.
fn extract_bearer(req: &Request) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.to_string())
}

/// Auth middleware for the `/api` routes: the presented key must byte-equal
/// the configured secret, compared in constant time.
pub async fn require_api_key(
    expected: String,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match extract_bearer(&req) {
        Some(presented) => {
            if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
                Ok(next.run(req).await)
            } else {
                Err(ApiError::AuthInvalid)
            }
        }
        None => Err(ApiError::AuthRequired),
    }
}

/// Peer address extractor that tolerates running without connect info
/// (router-level tests drive the service with `oneshot`).
pub(crate) struct CallerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for CallerAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(CallerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Caller identity for rate limiting. The trust boundary is the ingress, so
/// `X-Forwarded-For` (first hop) wins over the socket peer address.
pub(crate) fn caller_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => "unknown".to_string(),
    }
}

/// Builds the controller's HTTP router.
pub fn router(state: ControllerState) -> Router {
    let api_key = state.config.api_key.clone();
    let protected = Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .layer(axum::middleware::from_fn(move |req, next| {
            let key = api_key.clone();
            async move { require_api_key(key, req, next).await }
        }));

    Router::new()
        .merge(protected)
        .route("/.well-known/jwks.json", get(jwks))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use axum::routing::get as route_get;
    use tower::ServiceExt;

    async fn ok_handler() -> &'static str {
        "ok"
    }

    fn test_app(key: &str) -> Router {
        let key = key.to_string();
        Router::new()
            .route("/test", route_get(ok_handler))
            .layer(axum::middleware::from_fn(move |req, next| {
                let key = key.clone();
                async move { require_api_key(key, req, next).await }
            }))
    }

    #[tokio::test]
    async fn valid_key_passes() {
        let app = test_app("secret");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/test")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_key_is_401() {
        let app = test_app("secret");
        let response = app
            .oneshot(HttpRequest::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_key_is_401() {
        let app = test_app("secret");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/test")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn query_key_not_accepted() {
        let app = test_app("secret");
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/test?apiKey=secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn forwarded_for_wins_over_socket() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer = "127.0.0.1:9999".parse::<SocketAddr>().unwrap();
        assert_eq!(caller_identity(&headers, Some(peer)), "203.0.113.7");
    }

    #[test]
    fn socket_addr_used_without_forwarded_for() {
        let headers = HeaderMap::new();
        let peer = "192.0.2.4:1234".parse::<SocketAddr>().unwrap();
        assert_eq!(caller_identity(&headers, Some(peer)), "192.0.2.4");
    }

    #[test]
    fn unknown_when_no_identity_available() {
        assert_eq!(caller_identity(&HeaderMap::new(), None), "unknown");
    }
}
