//! SQLite lease table implementing `DistributedLock`.
//!
//! A row per key holds the owner and an expiry in epoch milliseconds. An
//! expired row is taken over in place by the next `try_lock`.

use std::time::Duration;

use autoflow_core::sync::{DistributedLock, LockError};
use chrono::Utc;

use super::pool::DatabasePool;

#[derive(Clone)]
pub struct SqliteLock {
    pool: DatabasePool,
}

impl SqliteLock {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn backend(e: sqlx::Error) -> LockError {
    LockError::Backend(e.to_string())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

impl DistributedLock for SqliteLock {
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let result = sqlx::query(
            "INSERT INTO distributed_locks (key, owner, expires_at) VALUES (?, ?, ?)
             ON CONFLICT (key) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
             WHERE distributed_locks.expires_at <= ? OR distributed_locks.owner = excluded.owner",
        )
        .bind(key)
        .bind(owner)
        .bind(expiry(ttl))
        .bind(now_ms())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            let holder: Option<(String,)> =
                sqlx::query_as("SELECT owner FROM distributed_locks WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool.writer)
                    .await
                    .map_err(backend)?;
            return Err(LockError::Held {
                key: key.to_string(),
                owner: holder.map(|(o,)| o).unwrap_or_default(),
            });
        }
        tracing::debug!(%key, %owner, "lock acquired");
        Ok(())
    }

    async fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<(), LockError> {
        let result = sqlx::query(
            "UPDATE distributed_locks SET expires_at = ? WHERE key = ? AND owner = ? AND expires_at > ?",
        )
        .bind(expiry(ttl))
        .bind(key)
        .bind(owner)
        .bind(now_ms())
        .execute(&self.pool.writer)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(LockError::NotOwner { key: key.to_string() });
        }
        Ok(())
    }

    async fn unlock(&self, key: &str, owner: &str) -> Result<(), LockError> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE key = ? AND owner = ?")
            .bind(key)
            .bind(owner)
            .execute(&self.pool.writer)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(LockError::NotOwner { key: key.to_string() });
        }
        tracing::debug!(%key, %owner, "lock released");
        Ok(())
    }
}
