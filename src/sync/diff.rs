/// Change detection between the stored identity and a fresh fetch
use crate::{
    cache::Category,
    db::models::Snapshot,
    identity::Resolution,
    store::{IdentityField, SyncedFields},
};

/// Fields whose value differs
pub fn changed_fields(current: &SyncedFields, next: &SyncedFields) -> Vec<IdentityField> {
    IdentityField::ALL
        .iter()
        .copied()
        .filter(|field| current.value(*field) != next.value(*field))
        .collect()
}

/// Canonical id to store for an organizational attribute.
///
/// A resolved name wins. An unresolved name keeps the stored id only while the raw
/// name is unchanged, so a renamed unit never keeps pointing at the old one.
pub fn resolved_id(
    resolution: &Resolution,
    raw: Option<&str>,
    current_raw: Option<&str>,
    current_id: Option<i64>,
) -> Option<i64> {
    resolution
        .canonical_id()
        .or_else(|| if raw == current_raw { current_id } else { None })
}

/// Cache categories made stale by a commit
pub fn stale_categories(fields: &[IdentityField], snapshots: &[Snapshot]) -> Vec<Category> {
    Category::ALL
        .iter()
        .copied()
        .filter(|category| {
            (*category == Category::Profile && !fields.is_empty())
                || snapshots.iter().any(|s| s.category == *category)
        })
        .collect()
}
