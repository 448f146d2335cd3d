/// Redis cache backend for deployments with several engine processes
use super::{CacheConfig, CacheStore};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Redis cache client; expiry is delegated to redis key TTLs
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCache {
    /// Connect to the configured redis instance
    pub async fn new(config: CacheConfig) -> SyncResult<Self> {
        info!("Connecting to Redis at {}", config.redis_url);

        let client = Client::open(config.redis_url.as_str()).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            SyncError::Cache(format!("Redis client creation failed: {}", e))
        })?;

        let connection = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to connect to Redis: {}", e);
            SyncError::Cache(format!("Redis connection failed: {}", e))
        })?;

        info!("Redis connection established");

        Ok(Self {
            connection,
            key_prefix: config.key_prefix,
        })
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Ping Redis to check connection
    pub async fn ping(&self) -> SyncResult<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            error!("Redis PING failed: {}", e);
            SyncError::Cache(format!("Cache ping failed: {}", e))
        })?;

        if pong != "PONG" {
            return Err(SyncError::Cache("Unexpected Redis PING response".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>> {
        let cache_key = self.build_key(key);

        let mut conn = self.connection.clone();
        let result: Option<String> = conn.get(&cache_key).await.map_err(|e| {
            warn!("Redis GET failed for {}: {}", cache_key, e);
            SyncError::Cache(format!("Cache get failed: {}", e))
        })?;

        match result {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => {
                    debug!("Cache HIT: {}", cache_key);
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!("Failed to deserialize cached value: {}", e);
                    let _: Result<(), _> = conn.del(&cache_key).await;
                    Ok(None)
                }
            },
            None => {
                debug!("Cache MISS: {}", cache_key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> SyncResult<()> {
        let cache_key = self.build_key(key);
        let mut conn = self.connection.clone();

        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            // PSETEX rejects a zero TTL; an entry that is already expired is just absent
            let _: () = conn.del(&cache_key).await.map_err(|e| {
                SyncError::Cache(format!("Cache delete failed: {}", e))
            })?;
            return Ok(());
        }

        let json = serde_json::to_string(value)
            .map_err(|e| SyncError::Cache(format!("Cache serialization failed: {}", e)))?;

        let _: () = conn.pset_ex(&cache_key, json, millis).await.map_err(|e| {
            warn!("Redis SET failed for {}: {}", cache_key, e);
            SyncError::Cache(format!("Cache set failed: {}", e))
        })?;

        debug!("Cache SET: {} (TTL: {}ms)", cache_key, millis);
        Ok(())
    }

    async fn invalidate_by_prefix(&self, prefix: &str) -> SyncResult<u64> {
        let pattern = format!("{}*", escape_glob(&self.build_key(prefix)));
        let mut conn = self.connection.clone();

        // SCAN rather than KEYS so a large keyspace does not block the server
        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    error!("Redis SCAN failed: {}", e);
                    SyncError::Cache(format!("Cache scan failed: {}", e))
                })?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(0);
        }

        let deleted: u64 = conn.del(&keys).await.map_err(|e| {
            error!("Redis DELETE multiple keys failed: {}", e);
            SyncError::Cache(format!("Cache invalidation failed: {}", e))
        })?;

        debug!("Cache invalidated {} keys matching {}", deleted, pattern);
        Ok(deleted)
    }

    async fn purge_expired(&self) -> SyncResult<u64> {
        // Redis evicts expired keys itself
        Ok(0)
    }
}

/// Escape redis glob metacharacters so the prefix matches literally
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
