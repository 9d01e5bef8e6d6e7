//! Durable session and token state shared by the two planes.
//!
//! The controller owns writes to both tables; the gateway reads `sessions`
//! and deletes (`consume`) `jti` rows. Both tables are ephemeral by policy:
//! a background pruner removes rows past `expires_at`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use postgres::{PostgresStore, PostgresStoreOptions};

/// One admitted job request and its lifecycle record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque, globally unique, immutable after creation.
    pub session_id: String,
    /// Opaque external subject the session belongs to.
    pub owner_id: String,
    /// Orchestrator object handle; unique, immutable after creation.
    pub worker_name: String,
    /// `host:port` of the worker's terminal server. Unset until the
    /// orchestrator schedules the worker; set exactly once, never unset.
    pub worker_endpoint: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    /// A session is routable iff its endpoint is known and it has not
    /// expired.
    pub fn is_routable(&self, now: DateTime<Utc>) -> bool {
        self.worker_endpoint.is_some() && now < self.expires_at
    }
}

/// Durable one-shot record backing a capability token's `jti` claim.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRecord {
    pub token_id: String,
    pub session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert hit an existing primary key.
    #[error("duplicate key in {0}")]
    Duplicate(&'static str),

    /// The referenced row does not exist (or was already consumed).
    #[error("not found in {0}")]
    NotFound(&'static str),

    /// A one-shot update found the field already set.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached or timed out; safe to retry.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Storage operations required by the two planes. Every method is atomic
/// with respect to concurrent callers, across replicas for the durable
/// backend.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a session row. Fails with [`StoreError::Duplicate`] if the
    /// `session_id` already exists.
    async fn put_session(&self, row: SessionRecord) -> Result<(), StoreError>;

    /// One-shot endpoint fill: succeeds only while `worker_endpoint` is
    /// unset. A second set fails with [`StoreError::Conflict`] so a stale
    /// resolver can never overwrite a live endpoint.
    async fn update_session_endpoint(
        &self,
        session_id: &str,
        endpoint: &str,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Inserts a token row. Fails with [`StoreError::Duplicate`] if the
    /// `token_id` already exists.
    async fn put_jti(&self, row: TokenRecord) -> Result<(), StoreError>;

    /// Atomically deletes the token row and returns its `session_id`.
    /// Exactly one of any number of concurrent callers succeeds; the rest
    /// get [`StoreError::NotFound`].
    async fn consume_jti(&self, token_id: &str) -> Result<String, StoreError>;

    /// Deletes all rows in both tables with `expires_at < before`. Returns
    /// the number of rows removed. Idempotent; concurrent pruners are safe.
    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Cheap liveness probe (`SELECT 1` equivalent).
    async fn ping(&self) -> Result<(), StoreError>;

    /// Releases backend resources. Idempotent: a second call is a no-op,
    /// never a panic or double-free of the pool.
    async fn close(&self);
}

/// Runs a store write with a bounded retry schedule: at most two retries,
/// and only on transient errors.
pub async fn with_retry<T, F, Fut>(op: &'static str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut last = None;
    for attempt in 0..3 {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < 2 => {
                tracing::warn!(op, attempt, error = %e, "transient store error, retrying");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.expect("loop always records an error before exhausting attempts"))
}
