/// Caching layer for synced HEMIS data
///
/// Entries are keyed `{category}_{identity}_{scope}` and expire lazily: a reader
/// never sees an entry past its TTL, whether or not it is still physically stored.
/// Whole categories are dropped with `invalidate_by_prefix`, never key by key.
pub mod memory;
pub mod redis;
pub mod sqlite;

pub use memory::MemoryCache;
pub use self::redis::RedisCache;
pub use sqlite::SqliteCache;

use crate::error::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

/// Key/value cache with per-entry TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a live entry; expired entries read as `None`
    async fn get(&self, key: &str) -> SyncResult<Option<serde_json::Value>>;

    /// Store a value for `ttl`
    async fn set(&self, key: &str, value: &serde_json::Value, ttl: Duration) -> SyncResult<()>;

    /// Drop every entry whose key starts with `prefix`, returning how many were removed
    async fn invalidate_by_prefix(&self, prefix: &str) -> SyncResult<u64>;

    /// Physically remove expired entries
    async fn purge_expired(&self) -> SyncResult<u64>;
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Sqlite,
    Redis,
}

/// Cache layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend (default: sqlite, sharing the engine database)
    pub backend: CacheBackend,

    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub redis_url: String,

    /// Namespace for redis keys (default: "hemis:")
    pub key_prefix: String,

    /// Profile TTL in seconds (default: 600 = 10 minutes)
    pub profile_ttl: u64,

    /// Attendance TTL in seconds (default: 1800 = 30 minutes, it changes often)
    pub attendance_ttl: u64,

    /// Subjects/grades TTL in seconds (default: 3600 = 1 hour)
    pub subjects_ttl: u64,

    /// Schedule TTL in seconds (default: 86400 = 1 day)
    pub schedule_ttl: u64,

    /// Semester list TTL in seconds (default: 86400 = 1 day)
    pub semesters_ttl: u64,

    /// Contract TTL in seconds (default: 21600 = 6 hours)
    pub contract_ttl: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Sqlite,
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "hemis:".to_string(),
            profile_ttl: 600,
            attendance_ttl: 1800,
            subjects_ttl: 3600,
            schedule_ttl: 86400,
            semesters_ttl: 86400,
            contract_ttl: 21600,
        }
    }
}

impl CacheConfig {
    /// Load from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ttl = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        Self {
            backend: match std::env::var("CACHE_BACKEND").as_deref() {
                Ok("memory") => CacheBackend::Memory,
                Ok("redis") => CacheBackend::Redis,
                _ => CacheBackend::Sqlite,
            },
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("CACHE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            profile_ttl: ttl("CACHE_PROFILE_TTL", defaults.profile_ttl),
            attendance_ttl: ttl("CACHE_ATTENDANCE_TTL", defaults.attendance_ttl),
            subjects_ttl: ttl("CACHE_SUBJECTS_TTL", defaults.subjects_ttl),
            schedule_ttl: ttl("CACHE_SCHEDULE_TTL", defaults.schedule_ttl),
            semesters_ttl: ttl("CACHE_SEMESTERS_TTL", defaults.semesters_ttl),
            contract_ttl: ttl("CACHE_CONTRACT_TTL", defaults.contract_ttl),
        }
    }

    /// TTL for a category
    pub fn ttl_for(&self, category: Category) -> Duration {
        let secs = match category {
            Category::Profile => self.profile_ttl,
            Category::Attendance => self.attendance_ttl,
            Category::Subjects => self.subjects_ttl,
            Category::Schedule => self.schedule_ttl,
            Category::Semesters => self.semesters_ttl,
            Category::Contract => self.contract_ttl,
        };
        Duration::from_secs(secs)
    }
}

/// Cache categories; each maps to one remote capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Profile,
    Attendance,
    Subjects,
    Schedule,
    Semesters,
    Contract,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Profile,
        Category::Attendance,
        Category::Subjects,
        Category::Schedule,
        Category::Semesters,
        Category::Contract,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Profile => "profile",
            Category::Attendance => "attendance",
            Category::Subjects => "subjects",
            Category::Schedule => "schedule",
            Category::Semesters => "semesters",
            Category::Contract => "contract",
        }
    }

    /// Full key for one identity and scope (semester code or "all")
    pub fn key(&self, identity_id: i64, scope: &str) -> String {
        format!("{}_{}_{}", self.as_str(), identity_id, scope)
    }

    /// Prefix covering every scope of one identity in this category.
    /// The trailing separator keeps identity 1 from matching identity 12.
    pub fn identity_prefix(&self, identity_id: i64) -> String {
        format!("{}_{}_", self.as_str(), identity_id)
    }

    /// Prefix covering the whole category
    pub fn prefix(&self) -> String {
        format!("{}_", self.as_str())
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope segment for semester-scoped keys
pub fn scope(semester: Option<&str>) -> String {
    match semester {
        Some(code) if !code.is_empty() => code.to_string(),
        _ => "all".to_string(),
    }
}

/// Build the configured cache backend
pub async fn connect(config: &CacheConfig, db: &SqlitePool) -> SyncResult<Arc<dyn CacheStore>> {
    let cache: Arc<dyn CacheStore> = match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::Sqlite => Arc::new(SqliteCache::new(db.clone())),
        CacheBackend::Redis => Arc::new(RedisCache::new(config.clone()).await?),
    };
    tracing::info!("Cache backend: {:?}", config.backend);
    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.backend, CacheBackend::Sqlite);
        assert_eq!(config.key_prefix, "hemis:");
        assert_eq!(config.ttl_for(Category::Attendance), Duration::from_secs(1800));
        assert_eq!(config.ttl_for(Category::Schedule), Duration::from_secs(86400));
    }

    #[test]
    fn test_category_keys() {
        assert_eq!(Category::Attendance.key(7, "11"), "attendance_7_11");
        assert_eq!(Category::Subjects.key(7, &scope(None)), "subjects_7_all");
        assert_eq!(Category::Attendance.identity_prefix(7), "attendance_7_");
        assert_eq!(Category::Attendance.prefix(), "attendance_");
    }

    #[test]
    fn test_identity_prefix_does_not_cover_longer_ids() {
        let prefix = Category::Attendance.identity_prefix(1);
        assert!(Category::Attendance.key(1, "all").starts_with(&prefix));
        assert!(!Category::Attendance.key(12, "all").starts_with(&prefix));
    }

    #[test]
    fn test_scope_defaults_to_all() {
        assert_eq!(scope(Some("")), "all");
        assert_eq!(scope(Some("12")), "12");
    }
}
