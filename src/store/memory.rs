//! In-memory store for tests and single-node development.
//!
//! Atomicity falls out of holding the table mutex across each operation.
//! Not shared across replicas; multi-replica deployments use
//! [`PostgresStore`](super::PostgresStore).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{SessionRecord, SessionStore, StoreError, TokenRecord};

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    jti: Mutex<HashMap<String, TokenRecord>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live session rows. Test observability only.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Number of live token rows. Test observability only.
    pub fn jti_count(&self) -> usize {
        self.jti.lock().len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn put_session(&self, row: SessionRecord) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&row.session_id) {
            return Err(StoreError::Duplicate("sessions"));
        }
        sessions.insert(row.session_id.clone(), row);
        Ok(())
    }

    async fn update_session_endpoint(
        &self,
        session_id: &str,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock();
        let row = sessions
            .get_mut(session_id)
            .ok_or(StoreError::NotFound("sessions"))?;
        if row.worker_endpoint.is_some() {
            return Err(StoreError::Conflict(format!(
                "endpoint already set for session {session_id}"
            )));
        }
        row.worker_endpoint = Some(endpoint.to_string());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn put_jti(&self, row: TokenRecord) -> Result<(), StoreError> {
        let mut jti = self.jti.lock();
        if jti.contains_key(&row.token_id) {
            return Err(StoreError::Duplicate("jti"));
        }
        jti.insert(row.token_id.clone(), row);
        Ok(())
    }

    async fn consume_jti(&self, token_id: &str) -> Result<String, StoreError> {
        self.jti
            .lock()
            .remove(token_id)
            .map(|row| row.session_id)
            .ok_or(StoreError::NotFound("jti"))
    }

    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut removed = 0u64;
        {
            let mut sessions = self.sessions.lock();
            let before_len = sessions.len();
            sessions.retain(|_, row| row.expires_at >= before);
            removed += (before_len - sessions.len()) as u64;
        }
        {
            let mut jti = self.jti.lock();
            let before_len = jti.len();
            jti.retain(|_, row| row.expires_at >= before);
            removed += (before_len - jti.len()) as u64;
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("memory store close called twice, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn session(id: &str, ttl_secs: i64) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: id.to_string(),
            owner_id: "owner".to_string(),
            worker_name: format!("worker-{id}"),
            worker_endpoint: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs),
        }
    }

    fn token(id: &str, session_id: &str, ttl_secs: i64) -> TokenRecord {
        TokenRecord {
            token_id: id.to_string(),
            session_id: session_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryStore::new();
        let row = session("s1", 60);
        store.put_session(row.clone()).await.unwrap();
        assert_eq!(store.get_session("s1").await.unwrap(), Some(row));
        assert_eq!(store.get_session("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_session_rejected() {
        let store = MemoryStore::new();
        store.put_session(session("s1", 60)).await.unwrap();
        let err = store.put_session(session("s1", 60)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate("sessions")));
    }

    #[tokio::test]
    async fn endpoint_set_exactly_once() {
        let store = MemoryStore::new();
        store.put_session(session("s1", 60)).await.unwrap();

        store
            .update_session_endpoint("s1", "10.0.0.5:7681")
            .await
            .unwrap();
        let row = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(row.worker_endpoint.as_deref(), Some("10.0.0.5:7681"));

        let err = store
            .update_session_endpoint("s1", "10.9.9.9:7681")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // The original value survives the rejected overwrite.
        let row = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(row.worker_endpoint.as_deref(), Some("10.0.0.5:7681"));
    }

    #[tokio::test]
    async fn endpoint_update_on_missing_session() {
        let store = MemoryStore::new();
        let err = store
            .update_session_endpoint("nope", "10.0.0.5:7681")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound("sessions")));
    }

    #[tokio::test]
    async fn consume_jti_once() {
        let store = MemoryStore::new();
        store.put_jti(token("t1", "s1", 60)).await.unwrap();

        assert_eq!(store.consume_jti("t1").await.unwrap(), "s1");
        let err = store.consume_jti("t1").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound("jti")));
    }

    #[tokio::test]
    async fn consume_unknown_jti_fails() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.consume_jti("ghost").await.unwrap_err(),
            StoreError::NotFound("jti")
        ));
    }

    #[tokio::test]
    async fn concurrent_consumers_exactly_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.put_jti(token("t1", "s1", 60)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.consume_jti("t1").await.is_ok()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one consumption may succeed");
    }

    #[tokio::test]
    async fn duplicate_jti_rejected() {
        let store = MemoryStore::new();
        store.put_jti(token("t1", "s1", 60)).await.unwrap();
        let err = store.put_jti(token("t1", "s2", 60)).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate("jti")));
    }

    #[tokio::test]
    async fn prune_removes_expired_rows_from_both_tables() {
        let store = MemoryStore::new();
        store.put_session(session("live", 60)).await.unwrap();
        store.put_session(session("dead", -10)).await.unwrap();
        store.put_jti(token("t-live", "live", 60)).await.unwrap();
        store.put_jti(token("t-dead", "dead", -10)).await.unwrap();

        let removed = store.prune_expired(Utc::now()).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_session("live").await.unwrap().is_some());
        assert!(store.get_session("dead").await.unwrap().is_none());
        assert!(store.consume_jti("t-live").await.is_ok());
        assert!(store.consume_jti("t-dead").await.is_err());
    }

    #[tokio::test]
    async fn prune_is_idempotent() {
        let store = MemoryStore::new();
        store.put_session(session("dead", -10)).await.unwrap();

        assert_eq!(store.prune_expired(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.prune_expired(Utc::now()).await.unwrap(), 0);
        assert_eq!(store.prune_expired(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_twice_is_safe() {
        let store = MemoryStore::new();
        store.close().await;
        store.close().await;
    }
}
