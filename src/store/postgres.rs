//! Postgres-backed store, the durable backend for multi-replica
//! deployments.
//!
//! Row-level atomicity comes from single statements: the one-shot endpoint
//! fill is an `UPDATE ... WHERE worker_endpoint IS NULL` and token
//! consumption is a `DELETE ... RETURNING`, so concurrent replicas race on
//! the database rather than in process memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{SessionRecord, SessionStore, StoreError, TokenRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id      TEXT PRIMARY KEY,
    owner_id        TEXT NOT NULL,
    worker_name     TEXT NOT NULL UNIQUE,
    worker_endpoint TEXT,
    created_at      TIMESTAMPTZ NOT NULL,
    expires_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS sessions_expires_at_idx ON sessions (expires_at);

CREATE TABLE IF NOT EXISTS jti (
    token_id   TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS jti_expires_at_idx ON jti (expires_at);
"#;

/// Connection pool knobs, bounded per replica.
#[derive(Debug, Clone)]
pub struct PostgresStoreOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PostgresStoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

pub struct PostgresStore {
    pool: PgPool,
    closed: AtomicBool,
}

impl PostgresStore {
    /// Connects a bounded pool to `url` and ensures the schema exists.
    pub async fn connect(url: &str, options: PostgresStoreOptions) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect(url)
            .await
            .map_err(map_error)?;

        let store = Self {
            pool,
            closed: AtomicBool::new(false),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_error)?;
        }
        Ok(())
    }
}

fn map_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            // Unique violation; the caller maps it to the right table.
            StoreError::Duplicate("postgres")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn row_to_session(row: &sqlx::postgres::PgRow) -> SessionRecord {
    SessionRecord {
        session_id: row.get("session_id"),
        owner_id: row.get("owner_id"),
        worker_name: row.get("worker_name"),
        worker_endpoint: row.get("worker_endpoint"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn put_session(&self, row: SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions \
             (session_id, owner_id, worker_name, worker_endpoint, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&row.session_id)
        .bind(&row.owner_id)
        .bind(&row.worker_name)
        .bind(&row.worker_endpoint)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match map_error(e) {
            StoreError::Duplicate(_) => StoreError::Duplicate("sessions"),
            other => other,
        })?;
        Ok(())
    }

    async fn update_session_endpoint(
        &self,
        session_id: &str,
        endpoint: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET worker_endpoint = $2 \
             WHERE session_id = $1 AND worker_endpoint IS NULL",
        )
        .bind(session_id)
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .map_err(map_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Zero rows: either the session is gone or the endpoint is already
        // set. Distinguish so callers can tell a stale resolver from a
        // pruned session.
        match self.get_session(session_id).await? {
            Some(_) => Err(StoreError::Conflict(format!(
                "endpoint already set for session {session_id}"
            ))),
            None => Err(StoreError::NotFound("sessions")),
        }
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, owner_id, worker_name, worker_endpoint, created_at, expires_at \
             FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_error)?;
        Ok(row.as_ref().map(row_to_session))
    }

    async fn put_jti(&self, row: TokenRecord) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO jti (token_id, session_id, expires_at) VALUES ($1, $2, $3)")
            .bind(&row.token_id)
            .bind(&row.session_id)
            .bind(row.expires_at)
            .execute(&self.pool)
            .await
            .map_err(|e| match map_error(e) {
                StoreError::Duplicate(_) => StoreError::Duplicate("jti"),
                other => other,
            })?;
        Ok(())
    }

    async fn consume_jti(&self, token_id: &str) -> Result<String, StoreError> {
        let row = sqlx::query("DELETE FROM jti WHERE token_id = $1 RETURNING session_id")
            .bind(token_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_error)?;
        match row {
            Some(row) => Ok(row.get("session_id")),
            None => Err(StoreError::NotFound("jti")),
        }
    }

    async fn prune_expired(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let sessions = sqlx::query("DELETE FROM sessions WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_error)?
            .rows_affected();
        let tokens = sqlx::query("DELETE FROM jti WHERE expires_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(map_error)?
            .rows_affected();
        Ok(sessions + tokens)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("postgres store close called twice, ignoring");
            return;
        }
        self.pool.close().await;
    }
}
