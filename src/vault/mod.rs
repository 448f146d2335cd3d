/// Credential vault
///
/// Owns the encrypted remote credential and token of every identity. Plaintext
/// passwords and token secrets exist only transiently inside this module and the
/// request that carries them.
pub mod crypto;
pub mod token;

pub use crypto::CredentialCipher;
pub use token::RemoteToken;

use crate::{
    config::VaultConfig,
    db::models::Identity,
    error::{SyncError, SyncResult},
    remote::{RemoteApi, UniversityDirectory},
    store::BackingStore,
    sync::locks::KeyedLocks,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Encrypted credential and token lifecycle
pub struct CredentialVault {
    store: Arc<dyn BackingStore>,
    remote: Arc<dyn RemoteApi>,
    directory: Arc<UniversityDirectory>,
    cipher: CredentialCipher,
    refresh_margin: Duration,
    refresh_locks: KeyedLocks<i64>,
}

impl CredentialVault {
    pub fn new(
        config: &VaultConfig,
        store: Arc<dyn BackingStore>,
        remote: Arc<dyn RemoteApi>,
        directory: Arc<UniversityDirectory>,
    ) -> SyncResult<Self> {
        Ok(Self {
            store,
            remote,
            directory,
            cipher: CredentialCipher::from_encoded(&config.encryption_key)?,
            refresh_margin: Duration::seconds(config.refresh_margin_secs),
            refresh_locks: KeyedLocks::new(),
        })
    }

    /// Encrypt and persist a credential, dropping any cached token
    pub async fn store(&self, identity_id: i64, login: &str, password: &str) -> SyncResult<()> {
        let login = login.trim();
        if login.is_empty() || password.is_empty() {
            return Err(SyncError::Validation(
                "Login and password are required".to_string(),
            ));
        }

        let encrypted = self.cipher.encrypt(identity_id, password)?;
        self.store
            .store_credential(identity_id, login, &encrypted)
            .await?;

        info!("Stored credential for identity {}", identity_id);
        Ok(())
    }

    /// Valid token for the identity, re-authenticating when needed
    pub async fn get_token(&self, identity_id: i64) -> SyncResult<RemoteToken> {
        let identity = self.store.get_identity(identity_id).await?;
        if let Some(token) = self.usable_token(&identity) {
            return Ok(token);
        }

        let _guard = self.refresh_locks.lock(identity_id).await;

        // A concurrent refresh may have finished while we waited
        let identity = self.store.get_identity(identity_id).await?;
        if let Some(token) = self.usable_token(&identity) {
            debug!("Token for identity {} refreshed concurrently", identity_id);
            return Ok(token);
        }

        let encrypted = identity.credential_enc.as_deref().ok_or_else(|| {
            SyncError::CredentialInvalid(format!("No credential stored for identity {}", identity_id))
        })?;
        let password = self.cipher.decrypt(identity_id, encrypted)?;

        let tenant = self.directory.tenant_for(&identity.login);
        let token = match self.remote.login(&tenant, &identity.login, &password).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Login failed for identity {}: {}", identity_id, e);
                return Err(e);
            }
        };

        let token_enc = self.cipher.encrypt(identity_id, token.expose())?;
        self.store
            .store_token(identity_id, &token_enc, Utc::now(), token.expires_at())
            .await?;

        info!(
            "Refreshed token {} for identity {} (expires {})",
            token.fingerprint(),
            identity_id,
            token.expires_at()
        );
        Ok(token)
    }

    /// Drop the stored token, e.g. after the remote rejected it
    pub async fn invalidate_token(&self, identity_id: i64) -> SyncResult<()> {
        self.store.clear_token(identity_id).await?;
        debug!("Invalidated token for identity {}", identity_id);
        Ok(())
    }

    fn usable_token(&self, identity: &Identity) -> Option<RemoteToken> {
        let (encrypted, expires_at) = match (&identity.token_enc, identity.token_expires_at) {
            (Some(encrypted), Some(expires_at)) => (encrypted, expires_at),
            _ => return None,
        };

        if expires_at <= Utc::now() + self.refresh_margin {
            return None;
        }

        match self.cipher.decrypt(identity.id, encrypted) {
            Ok(secret) => Some(RemoteToken::new(secret, expires_at)),
            Err(e) => {
                warn!("Discarding unreadable token for identity {}: {}", identity.id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{self, models::NewIdentity},
        remote::testing::FakeRemote,
        store::SqliteStore,
    };
    use std::sync::atomic::Ordering;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    async fn setup() -> (CredentialVault, Arc<FakeRemote>, Arc<SqliteStore>, i64) {
        let store = Arc::new(SqliteStore::new(db::create_memory_pool().await.unwrap()));
        let identity = store
            .upsert_identity(&NewIdentity {
                university_id: None,
                login: "395251101411".to_string(),
                full_name: None,
            })
            .await
            .unwrap();

        let remote = Arc::new(FakeRemote::new());
        let config = VaultConfig {
            encryption_key: KEY.to_string(),
            token_lifetime_secs: 3600,
            refresh_margin_secs: 60,
        };
        let vault = CredentialVault::new(
            &config,
            store.clone(),
            remote.clone(),
            Arc::new(UniversityDirectory::empty("https://hemis.example/rest/v1")),
        )
        .unwrap();

        (vault, remote, store, identity.id)
    }

    #[tokio::test]
    async fn test_credential_stored_encrypted() {
        let (vault, _remote, store, id) = setup().await;
        vault.store(id, "395251101411", "parol123").await.unwrap();

        let identity = store.get_identity(id).await.unwrap();
        let stored = identity.credential_enc.unwrap();
        assert!(!stored.contains("parol123"));
    }

    #[tokio::test]
    async fn test_get_token_logs_in_once_and_reuses() {
        let (vault, remote, store, id) = setup().await;
        vault.store(id, "395251101411", "parol123").await.unwrap();

        let first = vault.get_token(id).await.unwrap();
        let second = vault.get_token(id).await.unwrap();
        assert_eq!(remote.logins.load(Ordering::SeqCst), 1);
        assert_eq!(first.fingerprint(), second.fingerprint());

        let identity = store.get_identity(id).await.unwrap();
        assert!(!identity.token_enc.unwrap().contains(first.expose()));
        assert_eq!(remote.last_login().as_deref(), Some("395251101411"));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_logs_in_once() {
        let (vault, remote, _store, id) = setup().await;
        vault.store(id, "395251101411", "parol123").await.unwrap();

        let (a, b) = tokio::join!(vault.get_token(id), vault.get_token(id));
        assert_eq!(a.unwrap().fingerprint(), b.unwrap().fingerprint());
        assert_eq!(remote.logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_relogin() {
        let (vault, remote, _store, id) = setup().await;
        vault.store(id, "395251101411", "parol123").await.unwrap();

        vault.get_token(id).await.unwrap();
        vault.invalidate_token(id).await.unwrap();
        vault.get_token(id).await.unwrap();
        assert_eq!(remote.logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_credential_is_invalid() {
        let (vault, remote, _store, id) = setup().await;
        assert!(matches!(
            vault.get_token(id).await,
            Err(SyncError::CredentialInvalid(_))
        ));
        assert_eq!(remote.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_password_is_not_retried() {
        let (vault, remote, _store, id) = setup().await;
        vault.store(id, "395251101411", "wrong").await.unwrap();
        remote.reject_password("wrong");

        assert!(matches!(
            vault.get_token(id).await,
            Err(SyncError::CredentialInvalid(_))
        ));
        assert_eq!(remote.logins.load(Ordering::SeqCst), 1);
    }
}
