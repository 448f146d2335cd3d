/// SQLite implementation of the backing store using runtime queries
use super::{BackingStore, FieldValue, IdentityField, SyncCommit, VariantInsert};
use crate::{
    cache::Category,
    db::models::{Identity, NewIdentity, OrgUnit, Snapshot, UnitKind},
    error::{SyncError, SyncResult},
    identity::normalize::normalize,
    score::{AnswerRecord, Attempt, AttemptStore, Finalize, ScoreResult},
};
use std::collections::BTreeSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Backing store over the engine's SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    async fn variant_owner(&self, kind: UnitKind, variant: &str) -> SyncResult<Option<i64>> {
        let owner = sqlx::query_scalar(
            "SELECT unit_id FROM org_unit_variant WHERE kind = ?1 AND variant = ?2",
        )
        .bind(kind.as_str())
        .bind(variant)
        .fetch_optional(&self.db)
        .await?;

        Ok(owner)
    }
}

#[async_trait]
impl BackingStore for SqliteStore {
    async fn get_identity(&self, id: i64) -> SyncResult<Identity> {
        sqlx::query_as::<_, Identity>("SELECT * FROM identity WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("Identity {} not found", id)))
    }

    async fn get_identity_by_login(
        &self,
        university_id: Option<i64>,
        login: &str,
    ) -> SyncResult<Option<Identity>> {
        let identity = sqlx::query_as::<_, Identity>(
            "SELECT * FROM identity WHERE IFNULL(university_id, 0) = IFNULL(?1, 0) AND login = ?2",
        )
        .bind(university_id)
        .bind(login)
        .fetch_optional(&self.db)
        .await?;

        Ok(identity)
    }

    async fn list_active_identity_ids(&self) -> SyncResult<Vec<i64>> {
        let ids = sqlx::query_scalar("SELECT id FROM identity WHERE active = 1 ORDER BY id")
            .fetch_all(&self.db)
            .await?;

        Ok(ids)
    }

    async fn upsert_identity(&self, identity: &NewIdentity) -> SyncResult<Identity> {
        if let Some(existing) = self
            .get_identity_by_login(identity.university_id, &identity.login)
            .await?
        {
            return Ok(existing);
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO identity (university_id, login, full_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT DO NOTHING",
        )
        .bind(identity.university_id)
        .bind(&identity.login)
        .bind(&identity.full_name)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            debug!("Identity {} inserted concurrently", identity.login);
        }

        self.get_identity_by_login(identity.university_id, &identity.login)
            .await?
            .ok_or_else(|| SyncError::Internal(format!("Identity {} vanished after insert", identity.login)))
    }

    async fn store_credential(&self, id: i64, login: &str, credential_enc: &str) -> SyncResult<()> {
        let result = sqlx::query(
            "UPDATE identity
             SET login = ?1, credential_enc = ?2, token_enc = NULL,
                 token_issued_at = NULL, token_expires_at = NULL, updated_at = ?3
             WHERE id = ?4",
        )
        .bind(login)
        .bind(credential_enc)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("Identity {} not found", id)));
        }

        Ok(())
    }

    async fn store_token(
        &self,
        id: i64,
        token_enc: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> SyncResult<()> {
        sqlx::query(
            "UPDATE identity SET token_enc = ?1, token_issued_at = ?2, token_expires_at = ?3
             WHERE id = ?4",
        )
        .bind(token_enc)
        .bind(issued_at)
        .bind(expires_at)
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn clear_token(&self, id: i64) -> SyncResult<()> {
        sqlx::query(
            "UPDATE identity SET token_enc = NULL, token_issued_at = NULL, token_expires_at = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_units(&self, kind: UnitKind) -> SyncResult<Vec<OrgUnit>> {
        let rows = sqlx::query("SELECT id, name, parent_id FROM org_unit WHERE kind = ?1 ORDER BY id")
            .bind(kind.as_str())
            .fetch_all(&self.db)
            .await?;

        let variant_rows =
            sqlx::query("SELECT unit_id, variant FROM org_unit_variant WHERE kind = ?1 ORDER BY created_at")
                .bind(kind.as_str())
                .fetch_all(&self.db)
                .await?;

        let mut variants: HashMap<i64, Vec<String>> = HashMap::new();
        for row in variant_rows {
            variants
                .entry(row.try_get("unit_id")?)
                .or_default()
                .push(row.try_get("variant")?);
        }

        rows.into_iter()
            .map(|row| -> SyncResult<OrgUnit> {
                let id: i64 = row.try_get("id")?;
                Ok(OrgUnit {
                    id,
                    kind,
                    name: row.try_get("name")?,
                    parent_id: row.try_get("parent_id")?,
                    variants: variants.remove(&id).unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn insert_unit(
        &self,
        kind: UnitKind,
        name: &str,
        parent_id: Option<i64>,
    ) -> SyncResult<OrgUnit> {
        let normalized = normalize(name);

        sqlx::query(
            "INSERT INTO org_unit (kind, name, normalized_name, parent_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, normalized_name) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(name.trim())
        .bind(&normalized)
        .bind(parent_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        let row = sqlx::query(
            "SELECT id, name, parent_id FROM org_unit WHERE kind = ?1 AND normalized_name = ?2",
        )
        .bind(kind.as_str())
        .bind(&normalized)
        .fetch_one(&self.db)
        .await?;

        Ok(OrgUnit {
            id: row.try_get("id")?,
            kind,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            variants: Vec::new(),
        })
    }

    async fn add_variant(
        &self,
        kind: UnitKind,
        variant: &str,
        unit_id: i64,
    ) -> SyncResult<VariantInsert> {
        let result = sqlx::query(
            "INSERT INTO org_unit_variant (kind, variant, unit_id, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, variant) DO NOTHING",
        )
        .bind(kind.as_str())
        .bind(variant)
        .bind(unit_id)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(VariantInsert::Inserted);
        }

        match self.variant_owner(kind, variant).await? {
            Some(owner) if owner == unit_id => Ok(VariantInsert::AlreadyMapped),
            Some(owner) => Ok(VariantInsert::Conflict(owner)),
            None => Err(SyncError::Internal(format!(
                "Variant '{}' neither inserted nor present",
                variant
            ))),
        }
    }

    async fn get_snapshot(
        &self,
        identity_id: i64,
        category: Category,
        scope: &str,
    ) -> SyncResult<Option<Snapshot>> {
        let row = sqlx::query(
            "SELECT payload, payload_hash, fetched_at FROM sync_snapshot
             WHERE identity_id = ?1 AND category = ?2 AND scope = ?3",
        )
        .bind(identity_id)
        .bind(category.as_str())
        .bind(scope)
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw: String = row.try_get("payload")?;
        let payload = serde_json::from_str(&raw).map_err(|e| {
            SyncError::Internal(format!("Corrupted {} snapshot for {}: {}", category, identity_id, e))
        })?;

        Ok(Some(Snapshot {
            identity_id,
            category,
            scope: scope.to_string(),
            payload,
            payload_hash: row.try_get("payload_hash")?,
            fetched_at: row.try_get("fetched_at")?,
        }))
    }

    async fn commit_sync(&self, commit: &SyncCommit) -> SyncResult<()> {
        let mut tx = self.db.begin().await?;

        // Variants first: a variant someone else already mapped moves the id to its owner
        let mut fields = commit.fields.clone();
        let mut changed_fields = commit.changed_fields.clone();
        for pending in &commit.variants {
            sqlx::query(
                "INSERT INTO org_unit_variant (kind, variant, unit_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(kind, variant) DO NOTHING",
            )
            .bind(pending.kind.as_str())
            .bind(&pending.variant)
            .bind(pending.unit_id)
            .bind(commit.synced_at)
            .execute(&mut *tx)
            .await?;

            let owner: i64 = sqlx::query_scalar(
                "SELECT unit_id FROM org_unit_variant WHERE kind = ?1 AND variant = ?2",
            )
            .bind(pending.kind.as_str())
            .bind(&pending.variant)
            .fetch_one(&mut *tx)
            .await?;

            if owner != pending.unit_id {
                warn!(
                    "Variant '{}' already maps to {} {}, storing that instead of {}",
                    pending.variant, pending.kind, owner, pending.unit_id
                );
                fields.set_unit_id(pending.kind, Some(owner));
                let field = IdentityField::unit_id_of(pending.kind);
                if !changed_fields.contains(&field) {
                    changed_fields.push(field);
                }
            }
        }

        let mut update: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE identity SET last_synced_at = ");
        update.push_bind(commit.synced_at);
        if !changed_fields.is_empty() {
            update.push(", updated_at = ");
            update.push_bind(commit.synced_at);
        }
        for field in &changed_fields {
            update.push(", ");
            update.push(field.column());
            update.push(" = ");
            match fields.value(*field) {
                FieldValue::Int(v) => update.push_bind(v),
                FieldValue::Text(v) => update.push_bind(v),
                FieldValue::Real(v) => update.push_bind(v),
            };
        }
        update.push(" WHERE id = ");
        update.push_bind(commit.identity_id);

        let result = update.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!(
                "Identity {} not found",
                commit.identity_id
            )));
        }

        for snapshot in &commit.snapshots {
            let payload = serde_json::to_string(&snapshot.payload)
                .map_err(|e| SyncError::Internal(format!("Snapshot serialization failed: {}", e)))?;

            sqlx::query(
                "INSERT INTO sync_snapshot (identity_id, category, scope, payload, payload_hash, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identity_id, category, scope) DO UPDATE SET
                    payload = excluded.payload,
                    payload_hash = excluded.payload_hash,
                    fetched_at = excluded.fetched_at",
            )
            .bind(snapshot.identity_id)
            .bind(snapshot.category.as_str())
            .bind(&snapshot.scope)
            .bind(&payload)
            .bind(&snapshot.payload_hash)
            .bind(snapshot.fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}


#[async_trait]
impl AttemptStore for SqliteStore {
    async fn create_attempt(
        &self,
        identity_id: i64,
        quiz_id: i64,
        created_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> SyncResult<Attempt> {
        let result = sqlx::query(
            "INSERT INTO quiz_attempt (identity_id, quiz_id, created_at, deadline) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(identity_id)
        .bind(quiz_id)
        .bind(created_at)
        .bind(deadline)
        .execute(&self.db)
        .await?;

        Ok(Attempt {
            id: result.last_insert_rowid(),
            identity_id,
            quiz_id,
            created_at,
            deadline,
            closed_at: None,
            score: None,
            answers: Vec::new(),
        })
    }

    async fn record_answer(&self, attempt_id: i64, answer: &AnswerRecord) -> SyncResult<()> {
        let submitted = serde_json::to_string(&answer.submitted)
            .map_err(|e| SyncError::Internal(format!("Answer serialization failed: {}", e)))?;

        sqlx::query(
            "INSERT INTO quiz_attempt_item (attempt_id, question_id, submitted) VALUES (?1, ?2, ?3)
             ON CONFLICT(attempt_id, question_id) DO UPDATE SET submitted = excluded.submitted",
        )
        .bind(attempt_id)
        .bind(answer.question_id)
        .bind(&submitted)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_attempt(&self, attempt_id: i64) -> SyncResult<Attempt> {
        let row = sqlx::query(
            "SELECT identity_id, quiz_id, created_at, deadline, closed_at, score
             FROM quiz_attempt WHERE id = ?1",
        )
        .bind(attempt_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| SyncError::NotFound(format!("Attempt {} not found", attempt_id)))?;

        let items = sqlx::query(
            "SELECT question_id, submitted FROM quiz_attempt_item WHERE attempt_id = ?1 ORDER BY question_id",
        )
        .bind(attempt_id)
        .fetch_all(&self.db)
        .await?;

        let answers = items
            .into_iter()
            .map(|item| -> SyncResult<AnswerRecord> {
                let submitted: String = item.try_get("submitted")?;
                let submitted: BTreeSet<i64> = serde_json::from_str(&submitted).map_err(|e| {
                    SyncError::Internal(format!("Corrupted answer in attempt {}: {}", attempt_id, e))
                })?;
                Ok(AnswerRecord {
                    question_id: item.try_get("question_id")?,
                    submitted,
                })
            })
            .collect::<SyncResult<Vec<_>>>()?;

        Ok(Attempt {
            id: attempt_id,
            identity_id: row.try_get("identity_id")?,
            quiz_id: row.try_get("quiz_id")?,
            created_at: row.try_get("created_at")?,
            deadline: row.try_get("deadline")?,
            closed_at: row.try_get("closed_at")?,
            score: row.try_get("score")?,
            answers,
        })
    }

    async fn finalize_attempt(&self, result: &ScoreResult) -> SyncResult<Finalize> {
        let mut tx = self.db.begin().await?;

        let closed = sqlx::query(
            "UPDATE quiz_attempt SET closed_at = ?1, score = ?2 WHERE id = ?3 AND closed_at IS NULL",
        )
        .bind(result.closed_at)
        .bind(result.correct)
        .bind(result.attempt_id)
        .execute(&mut *tx)
        .await?;

        if closed.rows_affected() == 0 {
            return Ok(Finalize::AlreadyFinalized);
        }

        for item in &result.items {
            sqlx::query(
                "INSERT INTO quiz_attempt_item (attempt_id, question_id, submitted, is_correct)
                 VALUES (?1, ?2, '[]', ?3)
                 ON CONFLICT(attempt_id, question_id) DO UPDATE SET is_correct = excluded.is_correct",
            )
            .bind(result.attempt_id)
            .bind(item.question_id)
            .bind(item.is_correct)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Finalized attempt {}", result.attempt_id);
        Ok(Finalize::Finalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::store::{PendingVariant, SyncedFields};
    use serde_json::json;

    async fn create_test_store() -> SqliteStore {
        SqliteStore::new(db::create_memory_pool().await.unwrap())
    }

    async fn create_identity(store: &SqliteStore, login: &str) -> Identity {
        store
            .upsert_identity(&NewIdentity {
                university_id: Some(395),
                login: login.to_string(),
                full_name: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_identity_is_idempotent() {
        let store = create_test_store().await;

        let first = create_identity(&store, "395251101411").await;
        let second = create_identity(&store, "395251101411").await;
        assert_eq!(first.id, second.id);

        // Same login in another university scope is a different identity
        let other = store
            .upsert_identity(&NewIdentity {
                university_id: Some(401),
                login: "395251101411".to_string(),
                full_name: None,
            })
            .await
            .unwrap();
        assert_ne!(first.id, other.id);

        let found = store
            .get_identity_by_login(Some(395), "395251101411")
            .await
            .unwrap();
        assert_eq!(found.map(|i| i.id), Some(first.id));
    }

    #[tokio::test]
    async fn test_get_missing_identity() {
        let store = create_test_store().await;
        assert!(matches!(
            store.get_identity(42).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_store_credential_drops_token() {
        let store = create_test_store().await;
        let identity = create_identity(&store, "395251101411").await;
        let now = Utc::now();

        store.store_token(identity.id, "enc-token", now, now).await.unwrap();
        store
            .store_credential(identity.id, "395251101411", "enc-password")
            .await
            .unwrap();

        let identity = store.get_identity(identity.id).await.unwrap();
        assert_eq!(identity.credential_enc.as_deref(), Some("enc-password"));
        assert!(identity.token_enc.is_none());
        assert!(identity.token_expires_at.is_none());
    }

    #[tokio::test]
    async fn test_add_variant_outcomes() {
        let store = create_test_store().await;
        let a = store.insert_unit(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();
        let b = store.insert_unit(UnitKind::Group, "25-24 Axborot xizmati", None).await.unwrap();

        let variant = "25-23 axborot xizmati (kunduzgi)";
        assert_eq!(
            store.add_variant(UnitKind::Group, variant, a.id).await.unwrap(),
            VariantInsert::Inserted
        );
        assert_eq!(
            store.add_variant(UnitKind::Group, variant, a.id).await.unwrap(),
            VariantInsert::AlreadyMapped
        );
        assert_eq!(
            store.add_variant(UnitKind::Group, variant, b.id).await.unwrap(),
            VariantInsert::Conflict(a.id)
        );

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].variants, vec![variant.to_string()]);
        assert!(units[1].variants.is_empty());
    }

    #[tokio::test]
    async fn test_insert_unit_dedupes_on_normalized_name() {
        let store = create_test_store().await;
        let a = store.insert_unit(UnitKind::Faculty, "Fizika-matematika", None).await.unwrap();
        let b = store.insert_unit(UnitKind::Faculty, "  FIZIKA-MATEMATIKA ", None).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.name, "Fizika-matematika");
    }

    #[tokio::test]
    async fn test_commit_writes_only_changed_fields() {
        let store = create_test_store().await;
        let identity = create_identity(&store, "395251101411").await;
        let unit = store.insert_unit(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();

        let fields = SyncedFields {
            full_name: Some("Aliyev Vali".to_string()),
            group_raw: Some("25-23 AXBOROT XIZMATI (O'ZBEK)".to_string()),
            group_id: Some(unit.id),
            // Not listed as changed, must not be written
            level: Some("2-kurs".to_string()),
            missed_total: 6,
            ..SyncedFields::default()
        };
        let synced_at = Utc::now();
        let snapshot = Snapshot::new(identity.id, Category::Attendance, "12", json!([{"hour": 2}]), synced_at);

        store
            .commit_sync(&SyncCommit {
                identity_id: identity.id,
                fields,
                changed_fields: vec![
                    IdentityField::FullName,
                    IdentityField::GroupRaw,
                    IdentityField::GroupId,
                    IdentityField::MissedTotal,
                ],
                snapshots: vec![snapshot.clone()],
                variants: vec![PendingVariant {
                    kind: UnitKind::Group,
                    variant: "25-23 axborot xizmati (o'zbek)".to_string(),
                    unit_id: unit.id,
                }],
                synced_at,
            })
            .await
            .unwrap();

        let stored = store.get_identity(identity.id).await.unwrap();
        assert_eq!(stored.full_name.as_deref(), Some("Aliyev Vali"));
        assert_eq!(stored.group_id, Some(unit.id));
        assert_eq!(stored.missed_total, 6);
        assert!(stored.level.is_none());
        assert!(stored.last_synced_at.is_some());

        let loaded = store
            .get_snapshot(identity.id, Category::Attendance, "12")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.payload, snapshot.payload);
        assert_eq!(loaded.payload_hash, snapshot.payload_hash);

        let units = store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units[0].variants.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_stores_owner_of_variant_mapped_meanwhile() {
        let store = create_test_store().await;
        let identity = create_identity(&store, "395251101411").await;
        let resolved = store.insert_unit(UnitKind::Group, "25-23 Axborot xizmati", None).await.unwrap();
        let owner = store.insert_unit(UnitKind::Group, "25-23 Axborot", None).await.unwrap();

        let variant = "25-23 axborot xizmati (kunduzgi)";
        store.add_variant(UnitKind::Group, variant, owner.id).await.unwrap();

        store
            .commit_sync(&SyncCommit {
                identity_id: identity.id,
                fields: SyncedFields {
                    group_raw: Some(variant.to_string()),
                    group_id: Some(resolved.id),
                    ..SyncedFields::default()
                },
                changed_fields: vec![IdentityField::GroupRaw],
                snapshots: vec![],
                variants: vec![PendingVariant {
                    kind: UnitKind::Group,
                    variant: variant.to_string(),
                    unit_id: resolved.id,
                }],
                synced_at: Utc::now(),
            })
            .await
            .unwrap();

        let stored = store.get_identity(identity.id).await.unwrap();
        assert_eq!(stored.group_id, Some(owner.id));
        assert_eq!(stored.group_raw.as_deref(), Some(variant));

        let units = store.list_units(UnitKind::Group).await.unwrap();
        let resolved = units.iter().find(|u| u.id == resolved.id).unwrap();
        assert!(resolved.variants.is_empty());
    }

    #[tokio::test]
    async fn test_commit_for_missing_identity_writes_nothing() {
        let store = create_test_store().await;
        let synced_at = Utc::now();

        let result = store
            .commit_sync(&SyncCommit {
                identity_id: 99,
                fields: SyncedFields::default(),
                changed_fields: vec![],
                snapshots: vec![],
                variants: vec![],
                synced_at,
            })
            .await;

        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }
}
