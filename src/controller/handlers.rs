use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiError;
use crate::orchestrator::WorkerSpec;
use crate::signer::JwksDocument;
use crate::store::{with_retry, SessionRecord, StoreError, TokenRecord};

use super::admission::{self, CreateSessionRequest};
use super::{caller_identity, CallerAddr, ControllerState};

/// Owner subject stamped into sessions and tokens. The API key identifies
/// a single external principal; a per-caller identity provider is out of
/// scope.
const DEFAULT_OWNER: &str = "api";

#[derive(Debug, Serialize)]
pub(super) struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "wsUrl")]
    ws_url: String,
    token: String,
    #[serde(rename = "terminalUrl")]
    terminal_url: String,
    status: &'static str,
}

#[derive(Debug, Serialize)]
pub(super) struct SessionSummary {
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "workerName")]
    worker_name: String,
    status: &'static str,
    #[serde(rename = "createdAt")]
    created_at: DateTime<Utc>,
    #[serde(rename = "expiresAt")]
    expires_at: DateTime<Utc>,
    #[serde(rename = "wsUrl")]
    ws_url: String,
}

fn session_status(row: &SessionRecord, now: DateTime<Utc>) -> &'static str {
    if now >= row.expires_at {
        "expired"
    } else if row.worker_endpoint.is_some() {
        "ready"
    } else {
        "pending"
    }
}

pub(super) async fn create_session(
    State(state): State<ControllerState>,
    headers: HeaderMap,
    CallerAddr(peer): CallerAddr,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let caller = caller_identity(&headers, peer);
    if !state.limiter.check(&caller) {
        tracing::info!(caller = %caller, "session request over rate budget");
        return Err(ApiError::RateLimited);
    }

    admission::validate(&body)?;

    let session_id = uuid::Uuid::new_v4().to_string();
    let worker_name = format!("hatch-{session_id}");
    let now = Utc::now();
    let session_ttl = state.config.session_ttl;
    let expires_at = now
        + chrono::Duration::from_std(session_ttl)
            .map_err(|e| ApiError::InternalError(e.to_string()))?;

    // Write order matters: the session row lands first so the gateway can
    // resolve it, the token row lands before the token is handed out, and
    // the endpoint is filled last.
    let row = SessionRecord {
        session_id: session_id.clone(),
        owner_id: DEFAULT_OWNER.to_string(),
        worker_name: worker_name.clone(),
        worker_endpoint: None,
        created_at: now,
        expires_at,
    };
    with_retry("put_session", || state.store.put_session(row.clone())).await?;

    let spec = WorkerSpec {
        name: worker_name.clone(),
        session_id: session_id.clone(),
        image: state.config.worker_image.clone(),
        code_url: body.code_url.clone(),
        command: body.command.clone(),
        install_cmd: body.install_cmd.clone(),
        prompt: body.prompt.clone(),
        active_deadline: session_ttl,
        collect_after: Duration::from_secs(300),
    };
    // Submission is not retried: the caller may simply re-POST. The session
    // row left behind is collected by the TTL pruner.
    state.orchestrator.submit(&spec).await?;

    let issued = state
        .signer
        .issue(&session_id, DEFAULT_OWNER, state.config.token_ttl)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;

    let token_row = TokenRecord {
        token_id: issued.token_id.clone(),
        session_id: session_id.clone(),
        expires_at: issued.expires_at,
    };
    if let Err(e) = with_retry("put_jti", || state.store.put_jti(token_row.clone())).await {
        // The worker was already submitted; undo it so an unusable session
        // does not burn cluster resources until its deadline.
        state.orchestrator.best_effort_delete(&worker_name).await;
        return Err(e.into());
    }

    let status = match state
        .orchestrator
        .resolve_endpoint(&worker_name, state.config.resolve_deadline)
        .await
    {
        Ok(Some(endpoint)) => match record_endpoint(&state, &session_id, &endpoint).await {
            Ok(()) => "ready",
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "endpoint write failed");
                "pending"
            }
        },
        Ok(None) => {
            tracing::info!(session = %session_id, "endpoint unresolved at deadline");
            spawn_background_resolver(state.clone(), worker_name.clone(), session_id.clone(), expires_at);
            "pending"
        }
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "endpoint resolution failed");
            spawn_background_resolver(state.clone(), worker_name.clone(), session_id.clone(), expires_at);
            "pending"
        }
    };

    let ws_url = format!("/ws/{session_id}");
    let terminal_url = format!(
        "{}{}?token={}",
        state.config.public_gateway_url.trim_end_matches('/'),
        ws_url,
        issued.token
    );

    tracing::info!(session = %session_id, worker = %worker_name, status, "session created");
    Ok(Json(CreateSessionResponse {
        session_id,
        ws_url,
        token: issued.token,
        terminal_url,
        status,
    }))
}

/// Writes the resolved endpoint, treating a lost race as success: the
/// monotone unset-to-set transition means whoever wrote first wrote the
/// same worker's address.
async fn record_endpoint(
    state: &ControllerState,
    session_id: &str,
    endpoint: &str,
) -> Result<(), StoreError> {
    match with_retry("update_session_endpoint", || {
        state.store.update_session_endpoint(session_id, endpoint)
    })
    .await
    {
        Ok(()) | Err(StoreError::Conflict(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Keeps polling for a late worker endpoint after the inline deadline
/// passed, until the session expires or the process shuts down.
fn spawn_background_resolver(
    state: ControllerState,
    worker_name: String,
    session_id: String,
    until: DateTime<Utc>,
) {
    let cancel = state.shutdown.token();
    tokio::spawn(async move {
        let interval = state.config.resolve_interval;
        loop {
            if Utc::now() >= until || cancel.is_cancelled() {
                return;
            }
            let probe = tokio::select! {
                result = state
                    .orchestrator
                    .resolve_endpoint(&worker_name, interval.max(Duration::from_millis(500))) => result,
                _ = cancel.cancelled() => return,
            };
            match probe {
                Ok(Some(endpoint)) => {
                    if let Err(e) = record_endpoint(&state, &session_id, &endpoint).await {
                        tracing::warn!(session = %session_id, error = %e,
                            "background endpoint write failed");
                    } else {
                        tracing::info!(session = %session_id, endpoint = %endpoint,
                            "endpoint resolved late");
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(session = %session_id, error = %e,
                        "background endpoint probe failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
    });
}

pub(super) async fn get_session(
    State(state): State<ControllerState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let row = state
        .store
        .get_session(&session_id)
        .await?
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;

    let now = Utc::now();
    Ok(Json(SessionSummary {
        status: session_status(&row, now),
        ws_url: format!("/ws/{}", row.session_id),
        session_id: row.session_id,
        worker_name: row.worker_name,
        created_at: row.created_at,
        expires_at: row.expires_at,
    }))
}

pub(super) async fn jwks(State(state): State<ControllerState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json::<JwksDocument>(state.signer.jwks()),
    )
}

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn healthz(
    State(state): State<ControllerState>,
) -> Result<Json<HealthResponse>, ApiError> {
    ping_store(&state).await?;
    Ok(Json(HealthResponse { status: "ok" }))
}

pub(super) async fn readyz(
    State(state): State<ControllerState>,
) -> Result<Json<HealthResponse>, ApiError> {
    ping_store(&state).await?;
    // The signing key is loaded at construction; an empty key set would
    // mean readiness must fail.
    if state.signer.jwks().keys.is_empty() {
        return Err(ApiError::Unavailable("signing key not loaded".into()));
    }
    Ok(Json(HealthResponse { status: "ready" }))
}

async fn ping_store(state: &ControllerState) -> Result<(), ApiError> {
    tokio::time::timeout(state.config.store_timeout, state.store.ping())
        .await
        .map_err(|_| ApiError::Unavailable("store ping timed out".into()))?
        .map_err(ApiError::from)
}
