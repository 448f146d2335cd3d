/// Engine context and dependency injection
use crate::{
    cache::{self, CacheStore},
    config::EngineConfig,
    db,
    error::SyncResult,
    identity::IdentifierResolver,
    remote::{HemisClient, RemoteApi, UniversityDirectory},
    score::ScoreEngine,
    store::{BackingStore, SqliteStore},
    sync::SyncCoordinator,
    vault::CredentialVault,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

/// Shared services of one engine instance
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<EngineConfig>,
    pub db: SqlitePool,
    pub store: Arc<SqliteStore>,
    pub cache: Arc<dyn CacheStore>,
    pub directory: Arc<UniversityDirectory>,
    pub remote: Arc<dyn RemoteApi>,
    pub vault: Arc<CredentialVault>,
    pub resolver: Arc<IdentifierResolver>,
    pub scores: Arc<ScoreEngine>,
    pub coordinator: Arc<SyncCoordinator>,
}

impl AppContext {
    /// Create a context against the live HEMIS API
    pub async fn new(config: EngineConfig) -> SyncResult<Self> {
        config.validate()?;

        let remote: Arc<dyn RemoteApi> = Arc::new(HemisClient::new(
            &config.remote,
            chrono::Duration::seconds(config.vault.token_lifetime_secs),
        )?);

        Self::with_remote(config, remote).await
    }

    /// Create a context with a caller-supplied remote, e.g. `FakeRemote`
    pub async fn with_remote(config: EngineConfig, remote: Arc<dyn RemoteApi>) -> SyncResult<Self> {
        config.validate()?;

        // Initialize engine database
        let db = db::create_pool(
            &config.storage.database_path,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..db::DatabaseOptions::default()
            },
        )
        .await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let store = Arc::new(SqliteStore::new(db.clone()));
        let backing: Arc<dyn BackingStore> = store.clone();

        let cache = cache::connect(&config.cache, &db).await?;

        let directory = Arc::new(match &config.remote.university_directory {
            Some(path) => UniversityDirectory::load(&config.remote.default_base_url, path).await?,
            None => UniversityDirectory::empty(&config.remote.default_base_url),
        });
        info!("University directory lists {} deployments", directory.len());

        let vault = Arc::new(CredentialVault::new(
            &config.vault,
            backing.clone(),
            remote.clone(),
            directory.clone(),
        )?);

        let resolver = Arc::new(IdentifierResolver::new(&config.resolver, backing.clone()));
        let scores = Arc::new(ScoreEngine::new(&config.score, store.clone()));

        let coordinator = Arc::new(SyncCoordinator::new(
            config.sync.clone(),
            config.cache.clone(),
            backing,
            cache.clone(),
            vault.clone(),
            remote.clone(),
            directory.clone(),
            resolver.clone(),
            scores.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            db,
            store,
            cache,
            directory,
            remote,
            vault,
            resolver,
            scores,
            coordinator,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{CacheBackend, CacheConfig},
        config::{
            LoggingConfig, RemoteConfig, ResolverConfig, ScoreConfig, StorageConfig, SyncConfig,
            VaultConfig,
        },
        db::models::NewIdentity,
        remote::testing::FakeRemote,
    };

    fn config(dir: &std::path::Path) -> EngineConfig {
        EngineConfig {
            remote: RemoteConfig::default(),
            storage: StorageConfig {
                database_path: dir.join("sync.sqlite"),
                max_connections: 4,
            },
            cache: CacheConfig {
                backend: CacheBackend::Sqlite,
                ..CacheConfig::default()
            },
            vault: VaultConfig {
                encryption_key: "02".repeat(32),
                token_lifetime_secs: 3600,
                refresh_margin_secs: 60,
            },
            resolver: ResolverConfig::default(),
            sync: SyncConfig::default(),
            score: ScoreConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }

    #[tokio::test]
    async fn test_context_wires_sqlite_backed_engine() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::with_remote(config(dir.path()), Arc::new(FakeRemote::new()))
            .await
            .unwrap();

        let identity = ctx
            .store
            .upsert_identity(&NewIdentity {
                university_id: None,
                login: "395251101411".to_string(),
                full_name: None,
            })
            .await
            .unwrap();
        ctx.vault.store(identity.id, "395251101411", "parol123").await.unwrap();

        let outcome = ctx.coordinator.sync(identity.id).await.unwrap();
        assert!(outcome.changed);
        assert!(ctx.coordinator.profile(identity.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.sync.concurrency = 0;

        assert!(AppContext::with_remote(config, Arc::new(FakeRemote::new()))
            .await
            .is_err());
        assert!(!dir.path().join("sync.sqlite").exists());
    }
}
