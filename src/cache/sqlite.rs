/// SQLite cache backend, sharing the engine database
use super::CacheStore;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

/// Cache entries stored in the `cache_entry` table
#[derive(Clone)]
pub struct SqliteCache {
    db: SqlitePool,
}

impl SqliteCache {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM cache_entry WHERE key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteCache {
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let result = sqlx::query(
            r#"
            SELECT value, expires_at
            FROM cache_entry
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };

        let expires_at: i64 = row.try_get("expires_at")?;
        if expires_at <= Utc::now().timestamp_millis() {
            // Expired, drop it
            self.delete(key).await?;
            return Ok(None);
        }

        let raw: String = row.try_get("value")?;
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!("Dropping corrupted cache entry {}: {}", key, e);
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> SyncResult<()> {
        let now = Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let json = serde_json::to_string(value)
            .map_err(|e| SyncError::Cache(format!("Cache serialization failed: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO cache_entry (key, value, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&json)
        .bind(now.saturating_add(ttl_ms))
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn invalidate_by_prefix(&self, prefix: &str) -> SyncResult<u64> {
        // substr instead of LIKE: '_' is a LIKE wildcard and appears in every key
        let result = sqlx::query(
            "DELETE FROM cache_entry WHERE substr(key, 1, length(?1)) = ?1",
        )
        .bind(prefix)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        let result = sqlx::query("DELETE FROM cache_entry WHERE expires_at <= ?1")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}
