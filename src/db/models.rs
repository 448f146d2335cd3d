/// Database models for identities, organizational units and snapshots
use crate::cache::Category;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Identity record in the database
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub university_id: Option<i64>,
    pub login: String,
    pub remote_id: Option<i64>,
    pub full_name: Option<String>,
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
    /// AES-GCM encrypted password, base64
    #[serde(skip)]
    pub credential_enc: Option<String>,
    /// AES-GCM encrypted remote token, base64
    #[serde(skip)]
    pub token_enc: Option<String>,
    pub token_issued_at: Option<DateTime<Utc>>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to register an identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdentity {
    pub university_id: Option<i64>,
    pub login: String,
    pub full_name: Option<String>,
}

/// Kind of organizational unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    University,
    Faculty,
    Group,
    Specialty,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::University => "university",
            UnitKind::Faculty => "faculty",
            UnitKind::Group => "group",
            UnitKind::Specialty => "specialty",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "university" => Some(UnitKind::University),
            "faculty" => Some(UnitKind::Faculty),
            "group" => Some(UnitKind::Group),
            "specialty" => Some(UnitKind::Specialty),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical organizational unit with its known remote-name variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub id: i64,
    pub kind: UnitKind,
    pub name: String,
    pub parent_id: Option<i64>,
    /// Normalized remote names mapped to this unit
    pub variants: Vec<String>,
}

/// Last known-good remote payload for one identity, category and scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub identity_id: i64,
    pub category: Category,
    pub scope: String,
    pub payload: serde_json::Value,
    /// SHA-256 of the serialized payload, used for change detection
    pub payload_hash: String,
    pub fetched_at: DateTime<Utc>,
}
