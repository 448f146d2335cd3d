/// Unified error types for the HEMIS sync engine
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Stored credential is missing, undecryptable, or rejected by the remote system
    #[error("Credential invalid: {0}")]
    CredentialInvalid(String),

    /// Remote call exceeded its timeout on every attempt
    #[error("Remote request timed out after {attempts} attempt(s): {endpoint}")]
    RemoteTimeout { endpoint: String, attempts: u32 },

    /// Remote system unreachable or answering with server errors
    #[error("Remote system unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote system returned a response shape we do not understand
    #[error("Unexpected response shape from {endpoint}: {detail}")]
    RemoteSchemaMismatch { endpoint: String, detail: String },

    /// Another sync for the same identity is running
    #[error("Sync already in progress for identity {0}")]
    SyncInProgress(i64),

    /// Identifier resolution found more than one candidate
    #[error("Ambiguous name '{raw}' matches {} units", .candidates.len())]
    ResolutionAmbiguous { raw: String, candidates: Vec<i64> },

    /// Attempt already scored
    #[error("Attempt {0} is already finalized")]
    AlreadyFinalized(i64),

    /// Attempt deadline passed before it was scored
    #[error("Attempt {0} has expired")]
    AttemptExpired(i64),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache backend errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Encryption and decryption errors
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the failure may clear up on its own and is worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RemoteTimeout { .. }
                | SyncError::RemoteUnavailable(_)
                | SyncError::SyncInProgress(_)
        )
    }

    /// Short machine-readable code for the boundary consumed by chat/UI collaborators
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::CredentialInvalid(_) => "CredentialInvalid",
            SyncError::RemoteTimeout { .. } => "RemoteTimeout",
            SyncError::RemoteUnavailable(_) => "RemoteUnavailable",
            SyncError::RemoteSchemaMismatch { .. } => "RemoteSchemaMismatch",
            SyncError::SyncInProgress(_) => "SyncInProgress",
            SyncError::ResolutionAmbiguous { .. } => "ResolutionAmbiguous",
            SyncError::AlreadyFinalized(_) => "AlreadyFinalized",
            SyncError::AttemptExpired(_) => "AttemptExpired",
            SyncError::NotFound(_) => "NotFound",
            SyncError::Validation(_) => "InvalidRequest",
            SyncError::Configuration(_) => "Configuration",
            SyncError::Database(_)
            | SyncError::Cache(_)
            | SyncError::Crypto(_)
            | SyncError::Io(_)
            | SyncError::Internal(_) => "InternalError",
        }
    }
}

/// Result type alias for engine operations
pub type SyncResult<T> = Result<T, SyncError>;
