//! Attach path: token verification, one-shot consumption, endpoint
//! resolution, then handoff to the proxy.
//!
//! A plain GET on `/ws/{sessionId}` serves the terminal page; only an
//! Upgrade request enters the attach state machine. Once the upgrade is
//! accepted, close codes are the sole failure channel: 1008 for anything
//! the client presented (bad, expired, or replayed token; session
//! mismatch), 1011 for anything on our side (store, worker, resolution).

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Path, Query, Request, State,
    },
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::signer::SignerError;
use crate::store::StoreError;

use super::proxy::{self, WorkerStream};
use super::GatewayState;

static TERMINAL_UI: &str = include_str!("../../assets/terminal.html");

/// Path the worker's terminal server accepts WebSocket upgrades on.
const WORKER_WS_PATH: &str = "/ws";

#[derive(Debug, Deserialize)]
pub(super) struct AttachQuery {
    token: Option<String>,
}

/// Check if this request is a WebSocket upgrade.
fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

pub(super) async fn ws_entry(
    Path(session_id): Path<String>,
    Query(query): Query<AttachQuery>,
    State(state): State<GatewayState>,
    req: Request,
) -> Response {
    if !is_ws_upgrade(&req) {
        // The terminal page carries no secrets; the token in the query
        // string only ever reaches the websocket upgrade below.
        return Html(TERMINAL_UI).into_response();
    }

    let Some(token) = query.token else {
        return ApiError::AuthRequired.into_response();
    };

    let (mut parts, _body) = req.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let (guard, cancel) = state.shutdown.register();
    upgrade
        .on_upgrade(move |socket| async move {
            let _guard = guard;
            attach(socket, state, session_id, token, cancel).await;
        })
        .into_response()
}

async fn attach(
    socket: WebSocket,
    state: GatewayState,
    session_id: String,
    token: String,
    cancel: CancellationToken,
) {
    // Received -> Verified
    let keyset = match state.keyset.current().await {
        Ok(keyset) => keyset,
        Err(e) => {
            tracing::error!(session = %session_id, error = %e, "key set unavailable");
            close(socket, 1011, "verification unavailable").await;
            return;
        }
    };
    let claims = match keyset.verify(&token) {
        Ok(claims) => claims,
        Err(SignerError::Expired) => {
            close(socket, 1008, "expired").await;
            return;
        }
        Err(SignerError::Audience) => {
            close(socket, 1008, "audience mismatch").await;
            return;
        }
        Err(e) => {
            tracing::debug!(session = %session_id, error = %e, "token rejected");
            close(socket, 1008, "invalid token").await;
            return;
        }
    };
    if claims.sid != session_id {
        close(socket, 1008, "session mismatch").await;
        return;
    }

    // Verified -> Consumed: the atomic delete is the replay gate. Exactly
    // one of any number of concurrent attaches gets past this point.
    match state.store.consume_jti(&claims.jti).await {
        Ok(owning_session) if owning_session == session_id => {}
        Ok(_) => {
            close(socket, 1008, "session mismatch").await;
            return;
        }
        Err(StoreError::NotFound(_)) => {
            tracing::info!(session = %session_id, "replayed token rejected");
            close(socket, 1008, "replayed").await;
            return;
        }
        Err(e) => {
            tracing::error!(session = %session_id, error = %e, "token consumption failed");
            close(socket, 1011, "store failure").await;
            return;
        }
    }

    // Consumed -> Resolved
    let endpoint = match resolve_endpoint(&state, &session_id).await {
        Ok(endpoint) => endpoint,
        Err(reason) => {
            close(socket, 1011, reason).await;
            return;
        }
    };

    // Resolved -> Proxying
    let worker = match dial_worker(&state, &endpoint).await {
        Ok(worker) => worker,
        Err(e) => {
            tracing::warn!(session = %session_id, endpoint = %endpoint, error = %e,
                "worker unreachable");
            close(socket, 1011, "worker unreachable").await;
            return;
        }
    };

    tracing::info!(session = %session_id, endpoint = %endpoint, "proxy attached");
    let end = proxy::relay(socket, worker, &state.config, cancel).await;
    tracing::info!(session = %session_id, end = ?end, "proxy detached");
}

/// Waits for the session to become routable, up to `resolve_wait`. The
/// controller may still be filling the endpoint when the client attaches.
async fn resolve_endpoint(
    state: &GatewayState,
    session_id: &str,
) -> Result<String, &'static str> {
    let deadline = tokio::time::Instant::now() + state.config.resolve_wait;
    loop {
        let row = match state.store.get_session(session_id).await {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(session = %session_id, error = %e, "session lookup failed");
                return Err("store failure");
            }
        };
        let Some(row) = row else {
            return Err("unknown session");
        };
        if Utc::now() >= row.expires_at {
            return Err("session expired");
        }
        if let Some(endpoint) = row.worker_endpoint {
            return Ok(endpoint);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err("worker not ready");
        }
        tokio::time::sleep(state.config.resolve_interval).await;
    }
}

async fn dial_worker(
    state: &GatewayState,
    endpoint: &str,
) -> Result<WorkerStream, String> {
    let url = format!("ws://{endpoint}{WORKER_WS_PATH}");
    match tokio::time::timeout(
        state.config.worker_connect_timeout,
        tokio_tungstenite::connect_async(&url),
    )
    .await
    {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("connect timed out".to_string()),
    }
}

async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
