/// Identifier resolution: remote free-text names to canonical organizational units
use super::normalize::{normalize, strip_modifiers};
use crate::{
    config::ResolverConfig,
    db::models::{OrgUnit, UnitKind},
    error::{SyncError, SyncResult},
    remote::{Department, RemoteGroup, RemoteSpecialty},
    store::{BackingStore, PendingVariant, VariantInsert},
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of resolving one remote name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "ids", rename_all = "snake_case")]
pub enum Resolution {
    /// Name or a recorded variant matched exactly
    Exact(i64),
    /// Matched after stripping modifiers; the name is now a recorded variant
    Fuzzy(i64),
    Unresolved,
    /// Several units share the stripped prefix; nothing was recorded
    Ambiguous(Vec<i64>),
}

impl Resolution {
    pub fn canonical_id(&self) -> Option<i64> {
        match self {
            Resolution::Exact(id) | Resolution::Fuzzy(id) => Some(*id),
            Resolution::Unresolved | Resolution::Ambiguous(_) => None,
        }
    }

    pub fn matched(&self) -> bool {
        self.canonical_id().is_some()
    }
}

/// Units registered by one directory import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitImport {
    pub faculties: usize,
    pub specialties: usize,
    pub groups: usize,
}

/// Resolver configuration and store access
pub struct IdentifierResolver {
    store: Arc<dyn BackingStore>,
    modifiers: Vec<String>,
}

impl IdentifierResolver {
    pub fn new(config: &ResolverConfig, store: Arc<dyn BackingStore>) -> Self {
        Self {
            store,
            modifiers: config.modifiers().map(normalize).collect(),
        }
    }

    fn strip(&self, normalized: &str) -> String {
        strip_modifiers(normalized, self.modifiers.iter().map(String::as_str))
    }

    /// Resolve a name, recording a fuzzy match as a variant immediately
    pub async fn resolve(&self, raw: &str, kind: UnitKind) -> SyncResult<Resolution> {
        let (resolution, pending) = self.resolve_deferred(raw, kind).await?;
        let Some(pending) = pending else {
            return Ok(resolution);
        };

        match self
            .store
            .add_variant(pending.kind, &pending.variant, pending.unit_id)
            .await?
        {
            VariantInsert::Inserted => {
                info!("Recorded {} variant '{}' -> {}", kind, pending.variant, pending.unit_id);
                Ok(resolution)
            }
            VariantInsert::AlreadyMapped => Ok(resolution),
            VariantInsert::Conflict(owner) => {
                // Someone mapped the variant first; the recorded mapping wins
                warn!(
                    "{} variant '{}' already maps to {}, not {}",
                    kind, pending.variant, owner, pending.unit_id
                );
                Ok(Resolution::Exact(owner))
            }
        }
    }

    /// Resolve a name without writing; a fuzzy match returns the variant to record later
    pub async fn resolve_deferred(
        &self,
        raw: &str,
        kind: UnitKind,
    ) -> SyncResult<(Resolution, Option<PendingVariant>)> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Ok((Resolution::Unresolved, None));
        }

        let units = self.store.list_units(kind).await?;
        if let Some(id) = exact_match(&units, &normalized) {
            debug!("Resolved {} '{}' exactly to {}", kind, raw, id);
            return Ok((Resolution::Exact(id), None));
        }

        let stripped = self.strip(&normalized);
        if stripped.is_empty() {
            return Ok((Resolution::Unresolved, None));
        }

        // Prefixes that end inside a word only ever make a name ambiguous
        let mut whole = BTreeSet::new();
        let mut partial = BTreeSet::new();
        for unit in &units {
            for name in std::iter::once(&unit.name).chain(unit.variants.iter()) {
                match prefix_match(&self.strip(&normalize(name)), &stripped) {
                    Some(true) => {
                        whole.insert(unit.id);
                    }
                    Some(false) => {
                        partial.insert(unit.id);
                    }
                    None => {}
                }
            }
        }
        let candidates: Vec<i64> = whole.union(&partial).copied().collect();

        match candidates.as_slice() {
            [] => {
                debug!("No {} matches '{}'", kind, raw);
                Ok((Resolution::Unresolved, None))
            }
            [id] if whole.contains(id) => {
                debug!("Resolved {} '{}' by prefix to {}", kind, raw, id);
                let pending = PendingVariant {
                    kind,
                    variant: normalized,
                    unit_id: *id,
                };
                Ok((Resolution::Fuzzy(*id), Some(pending)))
            }
            [id] => {
                debug!("{} '{}' only matches {} inside a word", kind, raw, id);
                Ok((Resolution::Unresolved, None))
            }
            _ => {
                warn!("{} name '{}' is ambiguous between {:?}", kind, raw, candidates);
                Ok((Resolution::Ambiguous(candidates), None))
            }
        }
    }

    /// Resolve or fail: ambiguity and misses become errors
    pub async fn resolve_strict(&self, raw: &str, kind: UnitKind) -> SyncResult<i64> {
        match self.resolve(raw, kind).await? {
            Resolution::Exact(id) | Resolution::Fuzzy(id) => Ok(id),
            Resolution::Ambiguous(candidates) => Err(SyncError::ResolutionAmbiguous {
                raw: raw.to_string(),
                candidates,
            }),
            Resolution::Unresolved => Err(SyncError::NotFound(format!("{} '{}'", kind, raw))),
        }
    }

    /// Register a canonical unit
    pub async fn register(&self, kind: UnitKind, name: &str, parent_id: Option<i64>) -> SyncResult<OrgUnit> {
        if normalize(name).is_empty() {
            return Err(SyncError::Validation(format!("Empty {} name", kind)));
        }
        self.store.insert_unit(kind, name, parent_id).await
    }

    /// Register the faculties of a department list; returns how many were listed
    pub async fn import_faculties(&self, university_id: Option<i64>, departments: &[Department]) -> SyncResult<usize> {
        Ok(self.import_units(university_id, departments, &[], &[]).await?.faculties)
    }

    /// Register faculties, then specialties and groups under their faculty's unit
    pub async fn import_units(
        &self,
        university_id: Option<i64>,
        departments: &[Department],
        specialties: &[RemoteSpecialty],
        groups: &[RemoteGroup],
    ) -> SyncResult<UnitImport> {
        let mut import = UnitImport::default();

        // Remote department id to local faculty unit
        let mut faculties = HashMap::new();
        for department in departments.iter().filter(|d| d.is_faculty()) {
            let unit = self
                .register(UnitKind::Faculty, &department.name, university_id)
                .await?;
            faculties.insert(department.id, unit.id);
            import.faculties += 1;
        }
        let parent = |department: Option<i64>| department.and_then(|id| faculties.get(&id).copied());

        for specialty in specialties {
            self.register(UnitKind::Specialty, &specialty.name, parent(specialty.faculty_id))
                .await?;
            import.specialties += 1;
        }
        for group in groups {
            self.register(UnitKind::Group, &group.name, parent(group.faculty_id))
                .await?;
            import.groups += 1;
        }

        info!(
            "Imported {} faculties, {} specialties, {} groups",
            import.faculties, import.specialties, import.groups
        );
        Ok(import)
    }
}

/// Unit whose canonical name or a recorded variant equals the normalized name.
/// A canonical name match wins over a variant of another unit.
fn exact_match(units: &[OrgUnit], normalized: &str) -> Option<i64> {
    units
        .iter()
        .find(|unit| normalize(&unit.name) == normalized)
        .or_else(|| {
            units
                .iter()
                .find(|unit| unit.variants.iter().any(|v| v == normalized))
        })
        .map(|unit| unit.id)
}

/// Whether `candidate` starts with `prefix`, and if so whether the prefix ends on a
/// word boundary of it
fn prefix_match(candidate: &str, prefix: &str) -> Option<bool> {
    let rest = candidate.strip_prefix(prefix)?;
    Some(rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace() || c == '(' || c == ','))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, store::SqliteStore};

    const WITH_SHIFT: &str = "25-23 AXBOROT XIZMATI (KUNDUZGI) (O'ZBEK)";
    const WITHOUT_SHIFT: &str = "25-23 AXBOROT XIZMATI (O'ZBEK)";

    async fn setup() -> (IdentifierResolver, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::new(db::create_memory_pool().await.unwrap()));
        let resolver = IdentifierResolver::new(&ResolverConfig::default(), store.clone());
        (resolver, store)
    }

    #[tokio::test]
    async fn test_exact_match_is_case_and_apostrophe_insensitive() {
        let (resolver, _store) = setup().await;
        let unit = resolver.register(UnitKind::Faculty, "Xorijiy tillar", None).await.unwrap();

        let resolution = resolver.resolve("  XORIJIY   TILLAR ", UnitKind::Faculty).await.unwrap();
        assert_eq!(resolution, Resolution::Exact(unit.id));

        // Kind scopes the lookup
        let other = resolver.resolve("Xorijiy tillar", UnitKind::Group).await.unwrap();
        assert_eq!(other, Resolution::Unresolved);
    }

    #[tokio::test]
    async fn test_modifier_variants_resolve_to_same_unit() {
        let (resolver, store) = setup().await;
        let unit = resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        let first = resolver.resolve(WITH_SHIFT, UnitKind::Group).await.unwrap();
        let second = resolver.resolve(WITHOUT_SHIFT, UnitKind::Group).await.unwrap();
        assert_eq!(first, Resolution::Fuzzy(unit.id));
        assert_eq!(second.canonical_id(), Some(unit.id));

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units[0].variants.len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (resolver, store) = setup().await;
        let unit = resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        let first = resolver.resolve(WITH_SHIFT, UnitKind::Group).await.unwrap();
        let second = resolver.resolve(WITH_SHIFT, UnitKind::Group).await.unwrap();
        assert_eq!(first.canonical_id(), Some(unit.id));
        assert_eq!(second, Resolution::Exact(unit.id));

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units[0].variants, vec![normalize(WITH_SHIFT)]);
    }

    #[tokio::test]
    async fn test_shared_prefix_is_ambiguous_and_records_nothing() {
        let (resolver, store) = setup().await;
        let a = resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();
        let b = resolver.register(UnitKind::Group, "25-24 Axborot xizmati", None).await.unwrap();

        let resolution = resolver.resolve("25-2 (kunduzgi)", UnitKind::Group).await.unwrap();
        assert_eq!(resolution, Resolution::Ambiguous(vec![a.id, b.id]));
        assert!(!resolution.matched());

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert!(units.iter().all(|u| u.variants.is_empty()));

        assert!(matches!(
            resolver.resolve_strict("25-2", UnitKind::Group).await,
            Err(SyncError::ResolutionAmbiguous { candidates, .. }) if candidates.len() == 2
        ));
    }

    #[tokio::test]
    async fn test_prefix_inside_a_word_does_not_resolve() {
        let (resolver, store) = setup().await;
        let unit = resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        for raw in ["2", "25-2", "25-23 axb"] {
            assert_eq!(
                resolver.resolve(raw, UnitKind::Group).await.unwrap(),
                Resolution::Unresolved,
                "{}",
                raw
            );
        }
        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert!(units[0].variants.is_empty());

        // The full leading code ends on a word boundary
        assert_eq!(
            resolver.resolve("25-23 (kunduzgi)", UnitKind::Group).await.unwrap(),
            Resolution::Fuzzy(unit.id)
        );
    }

    #[tokio::test]
    async fn test_unknown_name_is_unresolved() {
        let (resolver, _store) = setup().await;
        resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        assert_eq!(
            resolver.resolve("Matematika 11-22", UnitKind::Group).await.unwrap(),
            Resolution::Unresolved
        );
        assert_eq!(resolver.resolve("   ", UnitKind::Group).await.unwrap(), Resolution::Unresolved);
        assert!(matches!(
            resolver.resolve_strict("Matematika 11-22", UnitKind::Group).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_resolution_writes_nothing() {
        let (resolver, store) = setup().await;
        let unit = resolver.register(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        let (resolution, pending) = resolver.resolve_deferred(WITH_SHIFT, UnitKind::Group).await.unwrap();
        assert_eq!(resolution, Resolution::Fuzzy(unit.id));
        assert_eq!(pending.unwrap().variant, normalize(WITH_SHIFT));

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert!(units[0].variants.is_empty());
    }

    #[tokio::test]
    async fn test_import_faculties_skips_other_departments() {
        let (resolver, store) = setup().await;
        let departments = vec![
            Department {
                id: 1,
                name: "Fizika-matematika".to_string(),
                code: None,
                structure_type: Some("Fakultet".to_string()),
                parent_id: None,
            },
            Department {
                id: 2,
                name: "Oliy matematika kafedrasi".to_string(),
                code: None,
                structure_type: Some("Kafedra".to_string()),
                parent_id: Some(1),
            },
        ];

        assert_eq!(resolver.import_faculties(None, &departments).await.unwrap(), 1);
        // Importing again does not duplicate
        resolver.import_faculties(None, &departments).await.unwrap();
        assert_eq!(store.list_units(UnitKind::Faculty).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_imported_groups_hang_under_their_faculty() {
        let (resolver, store) = setup().await;
        let departments = vec![Department {
            id: 3,
            name: "Axborot texnologiyalari".to_string(),
            code: None,
            structure_type: Some("Fakultet".to_string()),
            parent_id: None,
        }];
        let specialties = vec![RemoteSpecialty {
            id: 41,
            code: Some("60110100".to_string()),
            name: "Axborot xizmati".to_string(),
            faculty_id: Some(3),
        }];
        let groups = vec![
            RemoteGroup {
                id: 77,
                name: "25-23 Axborot xizmati".to_string(),
                faculty_id: Some(3),
                specialty_id: Some(41),
            },
            RemoteGroup {
                id: 78,
                name: "Sirtqi 25-01".to_string(),
                // Department not in the list
                faculty_id: Some(35),
                specialty_id: None,
            },
        ];

        let import = resolver
            .import_units(None, &departments, &specialties, &groups)
            .await
            .unwrap();
        assert_eq!(
            import,
            UnitImport {
                faculties: 1,
                specialties: 1,
                groups: 2
            }
        );

        let faculty = store.list_units(UnitKind::Faculty).await.unwrap()[0].id;
        let imported = store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(imported[0].parent_id, Some(faculty));
        assert_eq!(imported[1].parent_id, None);
        assert_eq!(store.list_units(UnitKind::Specialty).await.unwrap()[0].parent_id, Some(faculty));

        // The remote form of the group name now resolves
        let resolution = resolver
            .resolve("25-23 AXBOROT XIZMATI (KUNDUZGI) (O'ZBEK)", UnitKind::Group)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::Fuzzy(imported[0].id));
    }
}
