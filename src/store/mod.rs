/// Backing store contract
///
/// The engine writes identities, organizational units and snapshots through
/// `BackingStore`; it does not own the product schema. `SqliteStore` is the
/// reference adapter.
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::{
    cache::Category,
    db::models::{Identity, NewIdentity, OrgUnit, Snapshot, UnitKind},
    error::SyncResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of recording a remote-name variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantInsert {
    /// New mapping recorded
    Inserted,
    /// The variant already pointed at the same unit
    AlreadyMapped,
    /// The variant is mapped to another unit; the existing mapping is kept
    Conflict(i64),
}

/// Synced identity attributes subject to change detection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityField {
    RemoteId,
    FullName,
    UniversityId,
    FacultyRaw,
    FacultyId,
    GroupRaw,
    GroupId,
    SpecialtyRaw,
    SpecialtyId,
    Level,
    SemesterCode,
    SemesterName,
    MissedTotal,
    MissedExcused,
    MissedUnexcused,
    Gpa,
}

impl IdentityField {
    pub const ALL: [IdentityField; 16] = [
        IdentityField::RemoteId,
        IdentityField::FullName,
        IdentityField::UniversityId,
        IdentityField::FacultyRaw,
        IdentityField::FacultyId,
        IdentityField::GroupRaw,
        IdentityField::GroupId,
        IdentityField::SpecialtyRaw,
        IdentityField::SpecialtyId,
        IdentityField::Level,
        IdentityField::SemesterCode,
        IdentityField::SemesterName,
        IdentityField::MissedTotal,
        IdentityField::MissedExcused,
        IdentityField::MissedUnexcused,
        IdentityField::Gpa,
    ];

    /// Canonical id field holding a unit of `kind`
    pub fn unit_id_of(kind: UnitKind) -> IdentityField {
        match kind {
            UnitKind::University => IdentityField::UniversityId,
            UnitKind::Faculty => IdentityField::FacultyId,
            UnitKind::Group => IdentityField::GroupId,
            UnitKind::Specialty => IdentityField::SpecialtyId,
        }
    }

    /// Column name in the `identity` table
    pub fn column(&self) -> &'static str {
        match self {
            IdentityField::RemoteId => "remote_id",
            IdentityField::FullName => "full_name",
            IdentityField::UniversityId => "university_id",
            IdentityField::FacultyRaw => "faculty_raw",
            IdentityField::FacultyId => "faculty_id",
            IdentityField::GroupRaw => "group_raw",
            IdentityField::GroupId => "group_id",
            IdentityField::SpecialtyRaw => "specialty_raw",
            IdentityField::SpecialtyId => "specialty_id",
            IdentityField::Level => "level",
            IdentityField::SemesterCode => "semester_code",
            IdentityField::SemesterName => "semester_name",
            IdentityField::MissedTotal => "missed_total",
            IdentityField::MissedExcused => "missed_excused",
            IdentityField::MissedUnexcused => "missed_unexcused",
            IdentityField::Gpa => "gpa",
        }
    }
}

/// Column value of one `IdentityField`
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(Option<i64>),
    Text(Option<String>),
    Real(Option<f64>),
}

/// Derived identity summary produced by a sync
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncedFields {
    pub remote_id: Option<i64>,
    pub full_name: Option<String>,
    pub university_id: Option<i64>,
    pub faculty_raw: Option<String>,
    pub faculty_id: Option<i64>,
    pub group_raw: Option<String>,
    pub group_id: Option<i64>,
    pub specialty_raw: Option<String>,
    pub specialty_id: Option<i64>,
    pub level: Option<String>,
    pub semester_code: Option<String>,
    pub semester_name: Option<String>,
    pub missed_total: i64,
    pub missed_excused: i64,
    pub missed_unexcused: i64,
    pub gpa: Option<f64>,
}

impl SyncedFields {
    /// Current values stored on an identity
    pub fn of(identity: &Identity) -> Self {
        Self {
            remote_id: identity.remote_id,
            full_name: identity.full_name.clone(),
            university_id: identity.university_id,
            faculty_raw: identity.faculty_raw.clone(),
            faculty_id: identity.faculty_id,
            group_raw: identity.group_raw.clone(),
            group_id: identity.group_id,
            specialty_raw: identity.specialty_raw.clone(),
            specialty_id: identity.specialty_id,
            level: identity.level.clone(),
            semester_code: identity.semester_code.clone(),
            semester_name: identity.semester_name.clone(),
            missed_total: identity.missed_total,
            missed_excused: identity.missed_excused,
            missed_unexcused: identity.missed_unexcused,
            gpa: identity.gpa,
        }
    }

    pub fn set_unit_id(&mut self, kind: UnitKind, id: Option<i64>) {
        match kind {
            UnitKind::University => self.university_id = id,
            UnitKind::Faculty => self.faculty_id = id,
            UnitKind::Group => self.group_id = id,
            UnitKind::Specialty => self.specialty_id = id,
        }
    }

    pub fn value(&self, field: IdentityField) -> FieldValue {
        match field {
            IdentityField::RemoteId => FieldValue::Int(self.remote_id),
            IdentityField::FullName => FieldValue::Text(self.full_name.clone()),
            IdentityField::UniversityId => FieldValue::Int(self.university_id),
            IdentityField::FacultyRaw => FieldValue::Text(self.faculty_raw.clone()),
            IdentityField::FacultyId => FieldValue::Int(self.faculty_id),
            IdentityField::GroupRaw => FieldValue::Text(self.group_raw.clone()),
            IdentityField::GroupId => FieldValue::Int(self.group_id),
            IdentityField::SpecialtyRaw => FieldValue::Text(self.specialty_raw.clone()),
            IdentityField::SpecialtyId => FieldValue::Int(self.specialty_id),
            IdentityField::Level => FieldValue::Text(self.level.clone()),
            IdentityField::SemesterCode => FieldValue::Text(self.semester_code.clone()),
            IdentityField::SemesterName => FieldValue::Text(self.semester_name.clone()),
            IdentityField::MissedTotal => FieldValue::Int(Some(self.missed_total)),
            IdentityField::MissedExcused => FieldValue::Int(Some(self.missed_excused)),
            IdentityField::MissedUnexcused => FieldValue::Int(Some(self.missed_unexcused)),
            IdentityField::Gpa => FieldValue::Real(self.gpa),
        }
    }
}

/// Variant mapping discovered during a sync, written with its commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVariant {
    pub kind: UnitKind,
    pub variant: String,
    pub unit_id: i64,
}

/// Everything one successful sync writes, applied in a single transaction
#[derive(Debug, Clone)]
pub struct SyncCommit {
    pub identity_id: i64,
    pub fields: SyncedFields,
    /// Only these fields are written
    pub changed_fields: Vec<IdentityField>,
    /// Snapshots whose payload changed
    pub snapshots: Vec<Snapshot>,
    pub variants: Vec<PendingVariant>,
    pub synced_at: DateTime<Utc>,
}

/// Persistence contract consumed by the engine
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Get identity by internal id
    async fn get_identity(&self, id: i64) -> SyncResult<Identity>;

    /// Get identity by login within a university scope
    async fn get_identity_by_login(
        &self,
        university_id: Option<i64>,
        login: &str,
    ) -> SyncResult<Option<Identity>>;

    /// Ids of identities that take part in `sync_all`
    async fn list_active_identity_ids(&self) -> SyncResult<Vec<i64>>;

    /// Insert an identity, or return the existing one for the same login scope
    async fn upsert_identity(&self, identity: &NewIdentity) -> SyncResult<Identity>;

    /// Replace the encrypted credential; drops any stored token
    async fn store_credential(&self, id: i64, login: &str, credential_enc: &str) -> SyncResult<()>;

    async fn store_token(
        &self,
        id: i64,
        token_enc: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<()>;

    async fn clear_token(&self, id: i64) -> SyncResult<()>;

    /// Units of one kind with their variants
    async fn list_units(&self, kind: UnitKind) -> SyncResult<Vec<OrgUnit>>;

    /// Insert a canonical unit, or return the existing one with the same normalized name
    async fn insert_unit(
        &self,
        kind: UnitKind,
        name: &str,
        parent_id: Option<i64>,
    ) -> SyncResult<OrgUnit>;

    /// Record a normalized remote name for a unit (append-only)
    async fn add_variant(&self, kind: UnitKind, variant: &str, unit_id: i64)
        -> SyncResult<VariantInsert>;

    async fn get_snapshot(
        &self,
        identity_id: i64,
        category: Category,
        scope: &str,
    ) -> SyncResult<Option<Snapshot>>;

    /// Apply a sync result atomically
    async fn commit_sync(&self, commit: &SyncCommit) -> SyncResult<()>;
}

/// SHA-256 of a payload's canonical JSON form
pub fn payload_hash(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

impl Snapshot {
    pub fn new(
        identity_id: i64,
        category: Category,
        scope: impl Into<String>,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let payload_hash = payload_hash(&payload);
        Self {
            identity_id,
            category,
            scope: scope.into(),
            payload,
            payload_hash,
            fetched_at,
        }
    }
}
