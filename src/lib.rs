/// hemis-sync - synchronization and caching engine for HEMIS university records
///
/// Mirrors each student's profile, attendance, grades, schedule and contract from
/// the HEMIS REST API into a local store. Remote credentials stay encrypted at
/// rest, free-text organizational names are mapped onto canonical units, and
/// derived scores (missed hours, GPA, quiz results) are computed locally.
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod identity;
pub mod remote;
pub mod score;
pub mod store;
pub mod sync;
pub mod vault;

pub use config::EngineConfig;
pub use context::AppContext;
pub use error::{SyncError, SyncResult};
pub use identity::{IdentifierResolver, Resolution};
pub use remote::{HemisClient, RemoteApi};
pub use score::ScoreEngine;
pub use store::{BackingStore, SqliteStore};
pub use sync::{BulkSyncReport, SyncCoordinator, SyncJobState, SyncOutcome};
pub use vault::{CredentialVault, RemoteToken};
