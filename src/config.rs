/// Configuration management for the HEMIS sync engine
use crate::cache::CacheConfig;
use crate::error::{SyncError, SyncResult};
use crate::score::{AttendancePolicy, GradeScale, RetakePolicy};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub remote: RemoteConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub vault: VaultConfig,
    pub resolver: ResolverConfig,
    pub sync: SyncConfig,
    pub score: ScoreConfig,
    pub logging: LoggingConfig,
}

/// Remote HEMIS API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL used when the login prefix is not in the university directory
    pub default_base_url: String,
    /// Path to the university directory JSON (login prefix -> API URL)
    pub university_directory: Option<PathBuf>,
    pub user_agent: String,
    /// Whole-request timeout in seconds
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Maximum attempts for idempotent calls (login is capped at 2)
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Outgoing request budget shared by every identity
    pub requests_per_second: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            default_base_url: "https://student.hemis.uz/rest/v1".to_string(),
            university_directory: None,
            user_agent: "hemis-sync/0.1".to_string(),
            timeout_secs: 30,
            connect_timeout_secs: 10,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 8_000,
            requests_per_second: 10,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// 32-byte key, base64 or hex encoded
    pub encryption_key: String,
    /// Token lifetime assumed when the remote token carries no `exp` claim
    pub token_lifetime_secs: i64,
    /// Tokens this close to expiry are refreshed proactively
    pub refresh_margin_secs: i64,
}

/// Identifier resolver configuration
///
/// The modifier lists describe qualifiers the remote system appends to group and
/// specialty names. They vary per deployment so they are data, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Shift / schedule qualifiers, e.g. "kunduzgi"
    pub shift_modifiers: Vec<String>,
    /// Language qualifiers, e.g. "o'zbek"
    pub language_modifiers: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            shift_modifiers: ["kunduzgi", "kechki", "sirtqi", "masofaviy"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            language_modifiers: ["o'zbek", "rus", "qoraqalpoq", "ingliz"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ResolverConfig {
    /// All modifier words, shift first
    pub fn modifiers(&self) -> impl Iterator<Item = &str> {
        self.shift_modifiers
            .iter()
            .chain(self.language_modifiers.iter())
            .map(String::as_str)
    }
}

/// Sync coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Identities synced in parallel by `sync_all`
    pub concurrency: usize,
    /// Upper bound for one identity's fetch and diff, including remote retries.
    /// A commit that has started is not cut short.
    pub job_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout_secs: 180,
        }
    }
}

/// Derived score configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub attendance: AttendancePolicy,
    pub grades: GradeScale,
    /// Leave subjects without a score out of the GPA
    pub exclude_in_progress: bool,
    pub retake_policy: RetakePolicy,
    /// Seconds a quiz attempt stays open; 0 disables the deadline
    pub attempt_window_secs: i64,
}

impl Default for ScoreConfig {
    fn default() -> Self {
        Self {
            attendance: AttendancePolicy::default(),
            grades: GradeScale::default(),
            exclude_in_progress: true,
            retake_policy: RetakePolicy::Latest,
            attempt_window_secs: 1800,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> SyncResult<Self> {
        dotenv::dotenv().ok();

        let remote_defaults = RemoteConfig::default();
        let remote = RemoteConfig {
            default_base_url: env::var("HEMIS_BASE_URL")
                .unwrap_or(remote_defaults.default_base_url)
                .trim_end_matches('/')
                .to_string(),
            university_directory: env::var("HEMIS_UNIVERSITY_DIRECTORY").ok().map(PathBuf::from),
            user_agent: env::var("HEMIS_USER_AGENT").unwrap_or(remote_defaults.user_agent),
            timeout_secs: parse_var("HEMIS_TIMEOUT_SECS", remote_defaults.timeout_secs),
            connect_timeout_secs: parse_var(
                "HEMIS_CONNECT_TIMEOUT_SECS",
                remote_defaults.connect_timeout_secs,
            ),
            max_attempts: parse_var("HEMIS_MAX_ATTEMPTS", remote_defaults.max_attempts),
            backoff_base_ms: parse_var("HEMIS_BACKOFF_BASE_MS", remote_defaults.backoff_base_ms),
            backoff_max_ms: parse_var("HEMIS_BACKOFF_MAX_MS", remote_defaults.backoff_max_ms),
            requests_per_second: parse_var(
                "HEMIS_REQUESTS_PER_SECOND",
                remote_defaults.requests_per_second,
            ),
        };

        let data_directory: PathBuf = env::var("SYNC_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let storage = StorageConfig {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("hemis_sync.sqlite")),
            max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10),
        };

        let encryption_key = env::var("VAULT_ENCRYPTION_KEY")
            .map_err(|_| SyncError::Configuration("VAULT_ENCRYPTION_KEY required".to_string()))?;
        let vault = VaultConfig {
            encryption_key,
            token_lifetime_secs: parse_var("VAULT_TOKEN_LIFETIME_SECS", 3600),
            refresh_margin_secs: parse_var("VAULT_REFRESH_MARGIN_SECS", 60),
        };

        let mut resolver = ResolverConfig::default();
        if let Ok(words) = env::var("RESOLVER_SHIFT_MODIFIERS") {
            resolver.shift_modifiers = split_list(&words);
        }
        if let Ok(words) = env::var("RESOLVER_LANGUAGE_MODIFIERS") {
            resolver.language_modifiers = split_list(&words);
        }

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            concurrency: parse_var("SYNC_CONCURRENCY", sync_defaults.concurrency),
            job_timeout_secs: parse_var("SYNC_JOB_TIMEOUT_SECS", sync_defaults.job_timeout_secs),
        };

        let score_defaults = ScoreConfig::default();
        let mut attendance = score_defaults.attendance;
        if let Ok(codes) = env::var("SCORE_EXCUSED_CODES") {
            attendance.excused_codes = split_list(&codes);
        }
        if let Ok(words) = env::var("SCORE_EXCUSED_KEYWORDS") {
            attendance.excused_keywords = split_list(&words);
        }
        let score = ScoreConfig {
            attendance,
            grades: score_defaults.grades,
            exclude_in_progress: parse_var(
                "SCORE_EXCLUDE_IN_PROGRESS",
                score_defaults.exclude_in_progress,
            ),
            retake_policy: match env::var("SCORE_RETAKE_POLICY").as_deref() {
                Ok("best") => RetakePolicy::Best,
                _ => RetakePolicy::Latest,
            },
            attempt_window_secs: parse_var(
                "SCORE_ATTEMPT_WINDOW_SECS",
                score_defaults.attempt_window_secs,
            ),
        };

        let logging = LoggingConfig {
            level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            json: parse_var("LOG_JSON", false),
        };

        Ok(EngineConfig {
            remote,
            storage,
            cache: CacheConfig::from_env(),
            vault,
            resolver,
            sync,
            score,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> SyncResult<()> {
        if self.remote.default_base_url.is_empty() {
            return Err(SyncError::Configuration(
                "HEMIS base URL cannot be empty".to_string(),
            ));
        }

        if self.remote.max_attempts == 0 {
            return Err(SyncError::Configuration(
                "HEMIS_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.remote.requests_per_second == 0 {
            return Err(SyncError::Configuration(
                "HEMIS_REQUESTS_PER_SECOND must be at least 1".to_string(),
            ));
        }

        if self.sync.concurrency == 0 {
            return Err(SyncError::Configuration(
                "SYNC_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        if self.score.attempt_window_secs < 0 {
            return Err(SyncError::Configuration(
                "SCORE_ATTEMPT_WINDOW_SECS cannot be negative".to_string(),
            ));
        }

        if self.vault.token_lifetime_secs <= self.vault.refresh_margin_secs {
            return Err(SyncError::Configuration(
                "Token lifetime must exceed the refresh margin".to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse an environment variable, falling back to a default when missing or malformed
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
