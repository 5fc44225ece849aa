//! Durable tier backed by the SQLite `cache_entries` table.
//!
//! Keys are stored as SHA-256 hex digests so credentials embedded in logical
//! keys never reach disk. Expired rows are ignored on read and purged
//! opportunistically.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;

use super::CacheError;

/// SQLite-backed key/value store with TTL.
#[derive(Debug, Clone)]
pub struct DurableTier {
    db: Database,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
}

/// Storage key for a logical cache key.
#[must_use]
pub fn storage_key(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

impl DurableTier {
    /// Wraps an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the live value stored for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Durable`] when the query fails.
    #[instrument(skip(self, key))]
    pub async fn get(&self, key: &str) -> Result<Option<(String, Duration)>, CacheError> {
        let row = sqlx::query("SELECT value, expires_at FROM cache_entries WHERE key = ?")
            .bind(storage_key(key))
            .fetch_optional(self.db.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let value: String = row.try_get("value")?;
        let expires_at: i64 = row.try_get("expires_at")?;
        let remaining = expires_at - now_millis();
        if remaining <= 0 {
            debug!("durable entry expired");
            return Ok(None);
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(Some((value, Duration::from_millis(remaining as u64))))
    }

    /// Stores `value` under `key` for `ttl`, overwriting any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Durable`] when the write fails.
    #[instrument(skip(self, key, value), fields(ttl_secs = ttl.as_secs()))]
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let now = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        sqlx::query(
            "INSERT INTO cache_entries (key, value, expires_at, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at",
        )
        .bind(storage_key(key))
        .bind(value)
        .bind(now.saturating_add(ttl_ms))
        .bind(now)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Durable`] when the delete fails.
    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache_entries WHERE key = ?")
            .bind(storage_key(key))
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes expired rows, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Durable`] when the delete fails.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ?")
            .bind(now_millis())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
