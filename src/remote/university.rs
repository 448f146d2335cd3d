/// University directory: login prefix to per-institution API base URL
use super::types::text;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

/// Length of the login prefix identifying the university
const PREFIX_LEN: usize = 3;

/// Remote deployment a request is sent to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// API base, e.g. "https://student.jdpu.uz/rest/v1" (no trailing slash)
    pub base_url: String,
    pub university_code: Option<String>,
    pub university_name: Option<String>,
}

impl Tenant {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            university_code: None,
            university_name: None,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// One directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct University {
    pub code: String,
    pub name: String,
    pub api_url: Option<String>,
}

#[derive(Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Login prefix lookup, loaded once from `uni_urls.json`
#[derive(Debug, Clone)]
pub struct UniversityDirectory {
    default_base_url: String,
    by_code: HashMap<String, University>,
}

impl UniversityDirectory {
    /// Directory that routes every login to the default deployment
    pub fn empty(default_base_url: &str) -> Self {
        Self {
            default_base_url: default_base_url.trim_end_matches('/').to_string(),
            by_code: HashMap::new(),
        }
    }

    pub fn from_json(default_base_url: &str, json: &str) -> SyncResult<Self> {
        let file: DirectoryFile = serde_json::from_str(json)
            .map_err(|e| SyncError::Configuration(format!("Invalid university directory: {}", e)))?;

        let mut directory = Self::empty(default_base_url);
        // Codes appear both as strings and as numbers
        for entry in file.data {
            let Some(code) = text(&entry["code"]) else {
                continue;
            };
            let uni = University {
                code: code.clone(),
                name: text(&entry["name"]).unwrap_or_default(),
                api_url: text(&entry["api_url"]),
            };
            directory.by_code.insert(code, uni);
        }
        Ok(directory)
    }

    /// Load from file; a missing file yields an empty directory
    pub async fn load(default_base_url: &str, path: &Path) -> SyncResult<Self> {
        if !tokio::fs::try_exists(path).await? {
            warn!("University directory not found at {}", path.display());
            return Ok(Self::empty(default_base_url));
        }

        let json = tokio::fs::read_to_string(path).await?;
        let directory = Self::from_json(default_base_url, &json)?;
        info!(
            "Loaded {} universities from {}",
            directory.by_code.len(),
            path.display()
        );
        Ok(directory)
    }

    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// University for a login, by its first three characters
    pub fn university_for(&self, login: &str) -> Option<&University> {
        let login = login.trim();
        let prefix: String = login.chars().take(PREFIX_LEN).collect();
        if prefix.chars().count() < PREFIX_LEN {
            return None;
        }
        self.by_code.get(&prefix)
    }

    /// Tenant a login's requests go to
    pub fn tenant_for(&self, login: &str) -> Tenant {
        match self.university_for(login) {
            Some(uni) => {
                let base = uni
                    .api_url
                    .as_deref()
                    .map(|u| u.trim_end_matches('/'))
                    .filter(|u| !u.is_empty())
                    .unwrap_or(&self.default_base_url);
                Tenant {
                    base_url: base.to_string(),
                    university_code: Some(uni.code.clone()),
                    university_name: Some(uni.name.clone()),
                }
            }
            None => Tenant::new(self.default_base_url.clone()),
        }
    }

    /// Tenant used for unauthenticated calls without a login
    pub fn default_tenant(&self) -> Tenant {
        Tenant::new(self.default_base_url.clone())
    }
}
