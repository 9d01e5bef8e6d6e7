//! WebSocket gateway plane: token-gated attach and byte proxying.

mod attach;
pub mod keyset;
pub mod proxy;

use std::sync::Arc;

use axum::{
    http::{HeaderName, HeaderValue},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::error::ApiError;
use crate::shutdown::ShutdownCoordinator;
use crate::store::SessionStore;

pub use keyset::{KeySetCache, KeySetError};
pub use proxy::ProxyEnd;

/// Shared handles for the gateway router. Created once at startup.
#[derive(Clone)]
pub struct GatewayState {
    pub store: Arc<dyn SessionStore>,
    pub keyset: Arc<KeySetCache>,
    pub config: Arc<GatewayConfig>,
    pub shutdown: ShutdownCoordinator,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn healthz(
    axum::extract::State(state): axum::extract::State<GatewayState>,
) -> Result<Json<HealthResponse>, ApiError> {
    tokio::time::timeout(state.config.store_timeout, state.store.ping())
        .await
        .map_err(|_| ApiError::Unavailable("store ping timed out".into()))?
        .map_err(ApiError::from)?;
    Ok(Json(HealthResponse { status: "ok" }))
}

/// Builds the gateway's HTTP router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/{session_id}", get(attach::ws_entry))
        .route("/healthz", get(healthz))
        .with_state(state)
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
