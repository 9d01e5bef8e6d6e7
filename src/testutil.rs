//! Shared test support: an in-process orchestrator double and state
//! builders used by unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{ControllerConfig, GatewayConfig};
use crate::controller::ControllerState;
use crate::gateway::{GatewayState, KeySetCache};
use crate::orchestrator::{Orchestrator, OrchestratorError, WorkerSpec};
use crate::ratelimit::RateLimiter;
use crate::shutdown::ShutdownCoordinator;
use crate::signer::Signer;
use crate::store::{MemoryStore, SessionStore};

/// Orchestrator double. Endpoints are scripted by the test; submissions and
/// deletions are recorded for assertions.
#[derive(Default)]
pub struct MockOrchestrator {
    endpoints: Mutex<HashMap<String, String>>,
    auto_endpoint: Mutex<Option<String>>,
    submitted: Mutex<Vec<WorkerSpec>>,
    deleted: Mutex<Vec<String>>,
    fail_submit: AtomicBool,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `resolve_endpoint` immediately return `endpoint` for the
    /// given worker.
    pub fn set_endpoint(&self, worker_name: &str, endpoint: &str) {
        self.endpoints
            .lock()
            .insert(worker_name.to_string(), endpoint.to_string());
    }

    /// Makes every submitted worker resolve to `endpoint` immediately,
    /// regardless of its generated name.
    pub fn endpoint_on_submit(&self, endpoint: &str) {
        *self.auto_endpoint.lock() = Some(endpoint.to_string());
    }

    /// Makes every subsequent `submit` fail.
    pub fn fail_submissions(&self) {
        self.fail_submit.store(true, Ordering::Release);
    }

    pub fn submitted(&self) -> Vec<WorkerSpec> {
        self.submitted.lock().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    async fn submit(&self, spec: &WorkerSpec) -> Result<String, OrchestratorError> {
        if self.fail_submit.load(Ordering::Acquire) {
            return Err(OrchestratorError::Submit("scripted failure".into()));
        }
        self.submitted.lock().push(spec.clone());
        if let Some(endpoint) = self.auto_endpoint.lock().clone() {
            self.endpoints.lock().insert(spec.name.clone(), endpoint);
        }
        Ok(spec.name.clone())
    }

    async fn resolve_endpoint(
        &self,
        worker_name: &str,
        deadline: Duration,
    ) -> Result<Option<String>, OrchestratorError> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(endpoint) = self.endpoints.lock().get(worker_name).cloned() {
                return Ok(Some(endpoint));
            }
            if started.elapsed() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn best_effort_delete(&self, worker_name: &str) {
        self.deleted.lock().push(worker_name.to_string());
    }
}

/// Controller state over a memory store and mock orchestrator, with a
/// short inline resolve deadline so tests do not wait.
pub fn controller_state(
    api_key: &str,
    orchestrator: Arc<MockOrchestrator>,
) -> (ControllerState, Arc<MemoryStore>, Arc<Signer>) {
    let store = Arc::new(MemoryStore::new());
    let signer = Arc::new(Signer::generate());
    let config = ControllerConfig {
        api_key: api_key.to_string(),
        resolve_deadline: Duration::from_millis(50),
        resolve_interval: Duration::from_millis(5),
        ..Default::default()
    }
    .normalized();
    let state = ControllerState {
        store: store.clone() as Arc<dyn SessionStore>,
        orchestrator,
        signer: signer.clone(),
        limiter: Arc::new(RateLimiter::new(config.rate_limit, config.rate_window)),
        config: Arc::new(config),
        shutdown: ShutdownCoordinator::new(),
    };
    (state, store, signer)
}

/// Gateway state verifying against `signer`'s keys over the given store.
pub fn gateway_state(
    signer: &Signer,
    store: Arc<dyn SessionStore>,
    config: GatewayConfig,
) -> GatewayState {
    GatewayState {
        store,
        keyset: Arc::new(KeySetCache::with_static(signer.keyset())),
        config: Arc::new(config),
        shutdown: ShutdownCoordinator::new(),
    }
}
