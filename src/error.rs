use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

/// Structured error type for all HTTP handlers on both planes.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly. Once a WebSocket upgrade has begun
/// the gateway reports failures through close codes instead (see
/// `gateway::attach`).
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No credentials provided.
    AuthRequired,
    /// 401 - Credentials provided but invalid.
    AuthInvalid,
    /// 429 - Caller exceeded the admission window budget.
    RateLimited,
    /// 400 - Malformed or invalid request body.
    InvalidRequest(String),
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 500 - Worker submission or endpoint resolution failed.
    OrchestratorFailure(String),
    /// 500 - A store operation failed beyond the retry budget.
    StoreFailure(String),
    /// 503 - A dependency is unreachable; safe to retry.
    Unavailable(String),
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::OrchestratorFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::RateLimited => "rate_limited",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::OrchestratorFailure(_) => "orchestrator_failure",
            ApiError::StoreFailure(_) => "store_failure",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    ///
    /// Internal detail (orchestrator and store errors) is logged but not
    /// echoed to the caller; the caller sees a minimal body.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide an API key via Authorization: Bearer."
                    .to_string()
            }
            ApiError::AuthInvalid => "Invalid API key.".to_string(),
            ApiError::RateLimited => {
                "Too many session requests. Try again shortly.".to_string()
            }
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::OrchestratorFailure(_) => "Failed to launch worker.".to_string(),
            ApiError::StoreFailure(_) => "Storage operation failed.".to_string(),
            ApiError::Unavailable(_) => "Service temporarily unavailable.".to_string(),
            ApiError::InternalError(_) => "Internal error.".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::OrchestratorFailure(detail)
            | ApiError::StoreFailure(detail)
            | ApiError::Unavailable(detail)
            | ApiError::InternalError(detail) => {
                tracing::error!(code = self.code(), detail = %detail, "request failed");
            }
            _ => {}
        }
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(detail) => ApiError::Unavailable(detail),
            other => ApiError::StoreFailure(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::OrchestratorFailure(err.to_string())
    }
}
