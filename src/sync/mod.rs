/// Sync coordination
///
/// `SyncCoordinator::sync` runs at most one job per identity: it fetches everything
/// the remote system knows about the identity, resolves organizational names,
/// diffs against the stored record and commits the difference in one transaction
/// before invalidating the affected cache categories. Reads go through the cache
/// and fall back to the last committed snapshot.
pub mod diff;
pub mod locks;

pub use locks::{KeyedGates, KeyedGuard, KeyedLocks};

use crate::{
    cache::{self, CacheConfig, CacheStore, Category},
    config::SyncConfig,
    db::models::{Identity, Snapshot, UnitKind},
    error::{SyncError, SyncResult},
    identity::{IdentifierResolver, Resolution, UnitImport},
    remote::{
        AttendanceRecord, ContractRecord, Department, RemoteApi, RemoteGroup, RemoteProfile,
        RemoteSpecialty, ScheduleEntry, Semester, SubjectRecord, Survey, Tenant,
        UniversityDirectory,
    },
    score::{reporting_semester, ScoreEngine},
    store::{BackingStore, IdentityField, SyncCommit, SyncedFields},
    vault::{CredentialVault, RemoteToken},
};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// State of an identity's sync job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncJobState {
    Idle,
    Running,
}

/// Result of one successful sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub identity_id: i64,
    pub job_id: Uuid,
    /// Whether any stored field or snapshot changed
    pub changed: bool,
    pub changed_fields: Vec<IdentityField>,
    /// Cache categories invalidated for the identity
    pub invalidated: Vec<Category>,
    /// Organizational names that could not be mapped to one unit
    pub unresolved: Vec<UnitKind>,
}

/// One identity `sync_all` could not sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub identity_id: i64,
    pub code: String,
    pub message: String,
}

/// Summary of `sync_all`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkSyncReport {
    /// Synced with changes
    pub succeeded: usize,
    /// Synced, nothing differed
    pub unchanged: usize,
    pub failed: usize,
    /// Already being synced by another caller
    pub skipped: usize,
    pub failures: Vec<SyncFailure>,
}

/// Everything fetched for one identity
struct Fetched {
    profile: RemoteProfile,
    semesters: Vec<Semester>,
    /// Semester the scoped categories were fetched for
    semester: Option<String>,
    attendance: Vec<AttendanceRecord>,
    subjects: Vec<SubjectRecord>,
    schedule: Vec<ScheduleEntry>,
    contract: Vec<ContractRecord>,
    gpa: Option<f64>,
}

/// Per-identity sync engine
pub struct SyncCoordinator {
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn CacheStore>,
    vault: Arc<CredentialVault>,
    remote: Arc<dyn RemoteApi>,
    directory: Arc<UniversityDirectory>,
    resolver: Arc<IdentifierResolver>,
    scores: Arc<ScoreEngine>,
    cache_config: CacheConfig,
    config: SyncConfig,
    jobs: KeyedLocks<i64>,
    gates: Arc<KeyedGates<i64>>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        cache_config: CacheConfig,
        store: Arc<dyn BackingStore>,
        cache: Arc<dyn CacheStore>,
        vault: Arc<CredentialVault>,
        remote: Arc<dyn RemoteApi>,
        directory: Arc<UniversityDirectory>,
        resolver: Arc<IdentifierResolver>,
        scores: Arc<ScoreEngine>,
    ) -> Self {
        Self {
            store,
            cache,
            vault,
            remote,
            directory,
            resolver,
            scores,
            cache_config,
            config,
            jobs: KeyedLocks::new(),
            gates: Arc::new(KeyedGates::new()),
        }
    }

    pub fn job_state(&self, identity_id: i64) -> SyncJobState {
        if self.jobs.is_locked(&identity_id) {
            SyncJobState::Running
        } else {
            SyncJobState::Idle
        }
    }

    /// Sync one identity; rejected with `SyncInProgress` while another sync of it runs
    pub async fn sync(&self, identity_id: i64) -> SyncResult<SyncOutcome> {
        let job = self
            .jobs
            .try_lock(identity_id)
            .ok_or(SyncError::SyncInProgress(identity_id))?;

        let job_id = Uuid::new_v4();
        let span = info_span!("sync", identity_id, job_id = %job_id);
        let result = self.run(identity_id, job_id, job).instrument(span).await;

        match &result {
            Ok(outcome) if outcome.changed => info!(
                "Sync {} of identity {} changed {} field(s)",
                job_id,
                identity_id,
                outcome.changed_fields.len()
            ),
            Ok(_) => debug!("Sync {} of identity {}: no changes", job_id, identity_id),
            Err(e) => warn!("Sync {} of identity {} failed: {}", job_id, identity_id, e),
        }
        result
    }

    /// Prepare under the job deadline, then commit; `job` is released by the commit task
    async fn run(&self, identity_id: i64, job_id: Uuid, job: KeyedGuard<i64>) -> SyncResult<SyncOutcome> {
        let limit = Duration::from_secs(self.config.job_timeout_secs);
        let (commit, outcome) = match tokio::time::timeout(limit, self.prepare(identity_id, job_id)).await {
            Ok(prepared) => prepared?,
            Err(_) => {
                return Err(SyncError::RemoteTimeout {
                    endpoint: format!("sync of identity {}", identity_id),
                    attempts: 1,
                })
            }
        };

        // No deadline past this point: a started commit always runs to the end
        self.commit(commit, outcome.invalidated.clone(), job).await?;
        Ok(outcome)
    }

    /// Fetch, resolve and diff; writes nothing
    async fn prepare(&self, identity_id: i64, job_id: Uuid) -> SyncResult<(SyncCommit, SyncOutcome)> {
        let identity = self.store.get_identity(identity_id).await?;
        let tenant = self.directory.tenant_for(&identity.login);

        let fetched = self
            .with_token(identity_id, |token| {
                let tenant = &tenant;
                async move { self.fetch_all(tenant, &token).await }
            })
            .await?;

        // Resolve without writing; variants ride along with the commit
        let current = SyncedFields::of(&identity);
        let profile = &fetched.profile;
        let attributes = [
            // No raw university name is stored, so an unresolved one keeps the current id
            (UnitKind::University, profile.university.as_deref(), profile.university.as_deref(), current.university_id),
            (UnitKind::Faculty, profile.faculty.as_deref(), current.faculty_raw.as_deref(), current.faculty_id),
            (UnitKind::Group, profile.group.as_deref(), current.group_raw.as_deref(), current.group_id),
            (UnitKind::Specialty, profile.specialty.as_deref(), current.specialty_raw.as_deref(), current.specialty_id),
        ];

        let mut variants = Vec::new();
        let mut unresolved = Vec::new();
        let mut ids = [None; 4];
        for (slot, (kind, raw, current_raw, current_id)) in attributes.into_iter().enumerate() {
            let resolution = match raw {
                Some(name) => {
                    let (resolution, pending) = self.resolver.resolve_deferred(name, kind).await?;
                    if !resolution.matched() {
                        unresolved.push(kind);
                    }
                    variants.extend(pending);
                    resolution
                }
                None => Resolution::Unresolved,
            };
            ids[slot] = diff::resolved_id(&resolution, raw, current_raw, current_id);
        }
        let [university_id, faculty_id, group_id, specialty_id] = ids;

        let totals = self.scores.attendance_totals(&fetched.attendance);
        let semester_name = profile.semester_name.clone().or_else(|| {
            fetched
                .semesters
                .iter()
                .find(|s| Some(&s.code) == fetched.semester.as_ref())
                .and_then(|s| s.name.clone())
        });

        let next = SyncedFields {
            remote_id: profile.remote_id.or(current.remote_id),
            full_name: profile.full_name.clone().or_else(|| current.full_name.clone()),
            university_id,
            faculty_raw: profile.faculty.clone(),
            faculty_id,
            group_raw: profile.group.clone(),
            group_id,
            specialty_raw: profile.specialty.clone(),
            specialty_id,
            level: profile.level.clone(),
            semester_code: fetched.semester.clone(),
            semester_name,
            missed_total: totals.total,
            missed_excused: totals.excused,
            missed_unexcused: totals.unexcused,
            gpa: fetched.gpa,
        };
        let changed_fields = diff::changed_fields(&current, &next);

        let synced_at = Utc::now();
        let snapshots = self.changed_snapshots(identity_id, &fetched, synced_at).await?;
        let invalidated = diff::stale_categories(&changed_fields, &snapshots);
        let changed = !changed_fields.is_empty() || !snapshots.is_empty();

        let commit = SyncCommit {
            identity_id,
            fields: next,
            changed_fields: changed_fields.clone(),
            snapshots,
            variants,
            synced_at,
        };
        let outcome = SyncOutcome {
            identity_id,
            job_id,
            changed,
            changed_fields,
            invalidated,
            unresolved,
        };
        Ok((commit, outcome))
    }

    /// Run a remote call with the identity's token; a rejected token is replaced once
    async fn with_token<T, F, Fut>(&self, identity_id: i64, call: F) -> SyncResult<T>
    where
        F: Fn(RemoteToken) -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let token = self.vault.get_token(identity_id).await?;
        match call(token).await {
            Err(SyncError::CredentialInvalid(reason)) => {
                warn!("Remote rejected token of identity {} ({}), logging in again", identity_id, reason);
                self.vault.invalidate_token(identity_id).await?;
                let token = self.vault.get_token(identity_id).await?;
                call(token).await
            }
            other => other,
        }
    }

    async fn tenant_of(&self, identity_id: i64) -> SyncResult<Tenant> {
        let identity = self.store.get_identity(identity_id).await?;
        Ok(self.directory.tenant_for(&identity.login))
    }

    async fn fetch_all(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Fetched> {
        let remote = &self.remote;
        let profile = remote.get_profile(tenant, token).await?;
        let semesters = remote.get_semesters(tenant, token).await?;

        let semester = profile
            .semester_code
            .clone()
            .or_else(|| semesters.first().map(|s| s.code.clone()));
        let code = semester.as_deref();

        let (attendance, subjects, schedule, contract) = tokio::try_join!(
            remote.get_attendance(tenant, token, code),
            remote.get_grades(tenant, token, code),
            remote.get_schedule(tenant, token, code),
            remote.get_contract(tenant, token),
        )?;

        let mut gpa = self.scores.gpa(&subjects).gpa;
        if gpa.map_or(true, |g| g <= 0.0) {
            // Nothing graded yet this semester: report the previous one
            if let Some(previous) = reporting_semester(&semesters, gpa).filter(|s| Some(s.code.as_str()) != code) {
                debug!("No graded credits in semester {:?}, using {}", code, previous.code);
                let earlier = remote.get_grades(tenant, token, Some(&previous.code)).await?;
                gpa = self.scores.gpa(&earlier).gpa;
            }
        }

        Ok(Fetched {
            profile,
            semesters,
            semester,
            attendance,
            subjects,
            schedule,
            contract,
            gpa,
        })
    }

    /// Snapshots whose payload differs from the stored one
    async fn changed_snapshots(
        &self,
        identity_id: i64,
        fetched: &Fetched,
        fetched_at: chrono::DateTime<Utc>,
    ) -> SyncResult<Vec<Snapshot>> {
        let scoped = cache::scope(fetched.semester.as_deref());
        let all = cache::scope(None);

        let candidates = vec![
            (Category::Profile, all.clone(), to_payload(&fetched.profile)?),
            (Category::Semesters, all.clone(), to_payload(&fetched.semesters)?),
            (Category::Attendance, scoped.clone(), to_payload(&fetched.attendance)?),
            (Category::Subjects, scoped.clone(), to_payload(&fetched.subjects)?),
            (Category::Schedule, scoped, to_payload(&fetched.schedule)?),
            (Category::Contract, all, to_payload(&fetched.contract)?),
        ];

        let mut changed = Vec::new();
        for (category, scope, payload) in candidates {
            let snapshot = Snapshot::new(identity_id, category, scope, payload, fetched_at);
            let existing = self
                .store
                .get_snapshot(identity_id, category, &snapshot.scope)
                .await?;
            if existing.map_or(true, |e| e.payload_hash != snapshot.payload_hash) {
                changed.push(snapshot);
            }
        }
        Ok(changed)
    }

    /// Commit and invalidate in a detached task, under the identity's write gate.
    /// The task owns the job lock, so a cancelled caller neither leaves the store and
    /// cache half updated nor lets another sync of the identity start meanwhile.
    async fn commit(&self, commit: SyncCommit, invalidated: Vec<Category>, job: KeyedGuard<i64>) -> SyncResult<()> {
        let task = tokio::spawn(
            apply_commit(
                self.store.clone(),
                self.cache.clone(),
                self.gates.clone(),
                commit,
                invalidated,
                job,
            )
            .in_current_span(),
        );

        task.await
            .map_err(|e| SyncError::Internal(format!("Commit task failed: {}", e)))?
    }

    /// Sync every active identity with bounded concurrency
    pub async fn sync_all(&self) -> SyncResult<BulkSyncReport> {
        let ids = self.store.list_active_identity_ids().await?;
        info!("Syncing {} identities", ids.len());

        let results: Vec<(i64, SyncResult<SyncOutcome>)> = stream::iter(ids)
            .map(|id| async move { (id, self.sync(id).await) })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = BulkSyncReport::default();
        for (identity_id, result) in results {
            match result {
                Ok(outcome) if outcome.changed => report.succeeded += 1,
                Ok(_) => report.unchanged += 1,
                Err(SyncError::SyncInProgress(_)) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    report.failures.push(SyncFailure {
                        identity_id,
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Bulk sync finished: {} changed, {} unchanged, {} failed, {} skipped",
            report.succeeded, report.unchanged, report.failed, report.skipped
        );
        Ok(report)
    }

    /// Import the faculties, specialties and groups of the identity's university as
    /// canonical units
    pub async fn refresh_units(&self, identity_id: i64) -> SyncResult<UnitImport> {
        let identity = self.store.get_identity(identity_id).await?;
        let tenant = self.directory.tenant_for(&identity.login);

        let (departments, specialties, groups) = self
            .with_token(identity_id, |token| {
                let tenant = &tenant;
                async move { self.fetch_units(tenant, &token).await }
            })
            .await?;

        self.resolver
            .import_units(identity.university_id, &departments, &specialties, &groups)
            .await
    }

    async fn fetch_units(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
    ) -> SyncResult<(Vec<Department>, Vec<RemoteSpecialty>, Vec<RemoteGroup>)> {
        tokio::try_join!(
            self.remote.get_department_list(tenant, token),
            self.remote.get_specialty_list(tenant, token),
            self.remote.get_group_list(tenant, token),
        )
    }

    /// Surveys offered to the identity, in every state
    pub async fn surveys(&self, identity_id: i64) -> SyncResult<Vec<Survey>> {
        let tenant = self.tenant_of(identity_id).await?;
        self.with_token(identity_id, |token| {
            let tenant = &tenant;
            async move { self.remote.get_surveys(tenant, &token).await }
        })
        .await
    }

    pub async fn start_survey(&self, identity_id: i64, survey_id: i64) -> SyncResult<Value> {
        let tenant = self.tenant_of(identity_id).await?;
        self.with_token(identity_id, |token| {
            let tenant = &tenant;
            async move { self.remote.start_survey(tenant, &token, survey_id).await }
        })
        .await
    }

    pub async fn answer_survey(
        &self,
        identity_id: i64,
        question_id: i64,
        button_type: &str,
        answer: Value,
    ) -> SyncResult<Value> {
        let tenant = self.tenant_of(identity_id).await?;
        self.with_token(identity_id, |token| {
            let tenant = &tenant;
            let answer = answer.clone();
            async move {
                self.remote
                    .submit_survey_answer(tenant, &token, question_id, button_type, answer)
                    .await
            }
        })
        .await
    }

    pub async fn finish_survey(&self, identity_id: i64, quiz_rule_id: i64) -> SyncResult<Value> {
        let tenant = self.tenant_of(identity_id).await?;
        let result = self
            .with_token(identity_id, |token| {
                let tenant = &tenant;
                async move { self.remote.finish_survey(tenant, &token, quiz_rule_id).await }
            })
            .await;
        if result.is_ok() {
            info!("Identity {} finished survey {}", identity_id, quiz_rule_id);
        }
        result
    }

    /// Physically drop expired cache entries
    pub async fn purge_cache(&self) -> SyncResult<u64> {
        let removed = self.cache.purge_expired().await?;
        if removed > 0 {
            info!("Purged {} expired cache entries", removed);
        }
        Ok(removed)
    }

    pub async fn profile(&self, identity_id: i64) -> SyncResult<Option<RemoteProfile>> {
        self.read(identity_id, Category::Profile, None).await
    }

    pub async fn attendance(&self, identity_id: i64, semester: Option<&str>) -> SyncResult<Option<Vec<AttendanceRecord>>> {
        self.read(identity_id, Category::Attendance, semester).await
    }

    pub async fn subjects(&self, identity_id: i64, semester: Option<&str>) -> SyncResult<Option<Vec<SubjectRecord>>> {
        self.read(identity_id, Category::Subjects, semester).await
    }

    pub async fn schedule(&self, identity_id: i64, semester: Option<&str>) -> SyncResult<Option<Vec<ScheduleEntry>>> {
        self.read(identity_id, Category::Schedule, semester).await
    }

    pub async fn semesters(&self, identity_id: i64) -> SyncResult<Option<Vec<Semester>>> {
        self.read(identity_id, Category::Semesters, None).await
    }

    pub async fn contract(&self, identity_id: i64) -> SyncResult<Option<Vec<ContractRecord>>> {
        self.read(identity_id, Category::Contract, None).await
    }

    /// Read-through: cache, then the committed snapshot (which refills the cache).
    /// `None` means the identity has never been synced for this category and scope.
    async fn read<T: DeserializeOwned>(
        &self,
        identity_id: i64,
        category: Category,
        semester: Option<&str>,
    ) -> SyncResult<Option<T>> {
        let scope = match (category, semester) {
            (Category::Attendance | Category::Subjects | Category::Schedule, Some(code)) => cache::scope(Some(code)),
            (Category::Attendance | Category::Subjects | Category::Schedule, None) => {
                let identity: Identity = self.store.get_identity(identity_id).await?;
                cache::scope(identity.semester_code.as_deref())
            }
            _ => cache::scope(None),
        };
        let key = category.key(identity_id, &scope);

        let _gate = self.gates.read(identity_id).await;

        match self.cache.get(&key).await {
            Ok(Some(value)) => match serde_json::from_value(value) {
                Ok(parsed) => return Ok(Some(parsed)),
                Err(e) => warn!("Ignoring unreadable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }

        let Some(snapshot) = self.store.get_snapshot(identity_id, category, &scope).await? else {
            return Ok(None);
        };

        if let Err(e) = self
            .cache
            .set(&key, &snapshot.payload, self.cache_config.ttl_for(category))
            .await
        {
            warn!("Cache fill failed for {}: {}", key, e);
        }

        serde_json::from_value(snapshot.payload)
            .map(Some)
            .map_err(|e| SyncError::Internal(format!("Unreadable snapshot {}: {}", key, e)))
    }
}

async fn apply_commit(
    store: Arc<dyn BackingStore>,
    cache: Arc<dyn CacheStore>,
    gates: Arc<KeyedGates<i64>>,
    commit: SyncCommit,
    invalidated: Vec<Category>,
    _job: KeyedGuard<i64>,
) -> SyncResult<()> {
    let identity_id = commit.identity_id;
    let _gate = gates.write(identity_id).await;
    store.commit_sync(&commit).await?;

    let mut failure = None;
    for category in &invalidated {
        let prefix = category.identity_prefix(identity_id);
        match cache.invalidate_by_prefix(&prefix).await {
            Ok(removed) => debug!("Invalidated {} entries under {}", removed, prefix),
            Err(e) => {
                // The store is already committed; readers fall back to it once the entry expires
                error!("Failed to invalidate {}: {}", prefix, e);
                failure = Some(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn to_payload<T: Serialize>(value: &T) -> SyncResult<serde_json::Value> {
    serde_json::to_value(value)
        .map_err(|e| SyncError::Internal(format!("Payload serialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemoryCache,
        config::{ResolverConfig, ScoreConfig, VaultConfig},
        db::{self, models::NewIdentity},
        remote::{testing::FakeRemote, Department, SurveyStatus},
        store::SqliteStore,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const KEY: &str = "0101010101010101010101010101010101010101010101010101010101010101";

    struct Harness {
        coordinator: SyncCoordinator,
        remote: Arc<FakeRemote>,
        store: Arc<SqliteStore>,
        cache: Arc<MemoryCache>,
        resolver: Arc<IdentifierResolver>,
        vault: Arc<CredentialVault>,
    }

    async fn harness() -> Harness {
        harness_with(SyncConfig::default()).await
    }

    async fn harness_with(config: SyncConfig) -> Harness {
        let store = Arc::new(SqliteStore::new(db::create_memory_pool().await.unwrap()));
        let cache = Arc::new(MemoryCache::new());
        let remote = Arc::new(FakeRemote::new());
        let directory = Arc::new(UniversityDirectory::empty("https://hemis.example/rest/v1"));
        let vault = Arc::new(
            CredentialVault::new(
                &VaultConfig {
                    encryption_key: KEY.to_string(),
                    token_lifetime_secs: 3600,
                    refresh_margin_secs: 60,
                },
                store.clone(),
                remote.clone(),
                directory.clone(),
            )
            .unwrap(),
        );
        let resolver = Arc::new(IdentifierResolver::new(&ResolverConfig::default(), store.clone()));
        let scores = Arc::new(ScoreEngine::new(&ScoreConfig::default(), store.clone()));

        let coordinator = SyncCoordinator::new(
            config,
            CacheConfig::default(),
            store.clone(),
            cache.clone(),
            vault.clone(),
            remote.clone(),
            directory,
            resolver.clone(),
            scores,
        );

        Harness {
            coordinator,
            remote,
            store,
            cache,
            resolver,
            vault,
        }
    }

    async fn enroll(h: &Harness, login: &str) -> i64 {
        let identity = h
            .store
            .upsert_identity(&NewIdentity {
                university_id: None,
                login: login.to_string(),
                full_name: None,
            })
            .await
            .unwrap();
        h.vault.store(identity.id, login, "parol123").await.unwrap();
        identity.id
    }

    fn absence(hour: i64, explicable: bool) -> AttendanceRecord {
        AttendanceRecord {
            subject: Some("Fizika".to_string()),
            lesson_date: Some(1_727_000_000),
            hour,
            explicable,
            absent_status_code: None,
            absent_status_name: None,
        }
    }

    fn subject(id: &str, credit: f64, score: f64, semester: &str) -> SubjectRecord {
        SubjectRecord {
            subject_id: Some(id.to_string()),
            name: format!("Fan {}", id),
            credit,
            overall_score: score,
            semester_code: Some(semester.to_string()),
            exams: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_first_sync_writes_summary_and_second_is_unchanged() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_attendance(vec![absence(2, true), absence(4, false)]);
        h.remote.set_subjects(vec![subject("1", 6.0, 90.0, "13"), subject("2", 4.0, 75.0, "13")]);

        let outcome = h.coordinator.sync(id).await.unwrap();
        assert!(outcome.changed);
        assert!(outcome.changed_fields.contains(&IdentityField::Gpa));
        assert!(outcome.invalidated.contains(&Category::Profile));
        // No canonical units registered yet
        assert_eq!(outcome.unresolved.len(), 4);

        let identity = h.store.get_identity(id).await.unwrap();
        assert_eq!(identity.full_name.as_deref(), Some("ALIYEV VALI"));
        assert_eq!(identity.semester_code.as_deref(), Some("13"));
        assert_eq!((identity.missed_total, identity.missed_excused, identity.missed_unexcused), (6, 2, 4));
        assert_eq!(identity.gpa, Some(4.6));
        assert!(identity.last_synced_at.is_some());

        let again = h.coordinator.sync(id).await.unwrap();
        assert!(!again.changed);
        assert!(again.changed_fields.is_empty());
        assert!(again.invalidated.is_empty());
        assert_ne!(again.job_id, outcome.job_id);
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_rejected() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_delay(Duration::from_millis(200));

        let (first, second) = tokio::join!(h.coordinator.sync(id), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.coordinator.job_state(id), SyncJobState::Running);
            h.coordinator.sync(id).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::SyncInProgress(i)) if i == id));
        assert_eq!(h.coordinator.job_state(id), SyncJobState::Idle);
        assert_eq!(h.remote.calls("profile"), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_store_and_cache_untouched() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        let key = Category::Attendance.key(id, "13");
        h.cache.set(&key, &json!([]), Duration::from_secs(60)).await.unwrap();
        h.remote.fail_endpoint("contract");

        let err = h.coordinator.sync(id).await.unwrap_err();
        assert!(err.is_transient());

        let identity = h.store.get_identity(id).await.unwrap();
        assert!(identity.last_synced_at.is_none());
        assert!(identity.full_name.is_none());
        assert!(h
            .store
            .get_snapshot(id, Category::Profile, "all")
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.cache.get(&key).await.unwrap(), Some(json!([])));
    }

    #[tokio::test]
    async fn test_store_failure_before_commit_writes_nothing() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_attendance(vec![absence(2, false)]);
        h.coordinator.sync(id).await.unwrap();
        let before = h.store.get_identity(id).await.unwrap();

        let key = Category::Attendance.key(id, "13");
        h.cache.set(&key, &json!([]), Duration::from_secs(60)).await.unwrap();
        let group = h
            .resolver
            .register(UnitKind::Group, "25-23 Axborot xizmati", None)
            .await
            .unwrap();

        // Fetch succeeds, the snapshot diff then fails on a damaged row
        sqlx::query("UPDATE sync_snapshot SET payload = 'not json' WHERE category = 'contract'")
            .execute(h.store.pool())
            .await
            .unwrap();
        h.remote.set_attendance(vec![absence(2, false), absence(4, true)]);

        let err = h.coordinator.sync(id).await.unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
        assert_eq!(h.remote.calls("attendance"), 2);
        assert_eq!(h.coordinator.job_state(id), SyncJobState::Idle);

        let after = h.store.get_identity(id).await.unwrap();
        assert_eq!(after.last_synced_at, before.last_synced_at);
        assert_eq!(after.missed_total, 2);
        assert_eq!(after.group_id, None);
        assert_eq!(h.cache.get(&key).await.unwrap(), Some(json!([])));
        let snapshot = h
            .store
            .get_snapshot(id, Category::Attendance, "13")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.payload.as_array().map(Vec::len), Some(1));

        let units = h.store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units[0].id, group.id);
        assert!(units[0].variants.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_caller_keeps_job_until_commit_ends() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_attendance(vec![absence(2, false)]);

        // A reader holds the gate, so the commit waits for the write side
        let reader = h.coordinator.gates.read(id).await;
        let cancelled = tokio::time::timeout(Duration::from_millis(300), h.coordinator.sync(id)).await;
        assert!(cancelled.is_err());

        assert_eq!(h.coordinator.job_state(id), SyncJobState::Running);
        assert!(matches!(
            h.coordinator.sync(id).await,
            Err(SyncError::SyncInProgress(i)) if i == id
        ));
        assert_eq!(h.remote.calls("profile"), 1);
        assert!(h.store.get_identity(id).await.unwrap().last_synced_at.is_none());

        drop(reader);
        for _ in 0..200 {
            if h.coordinator.job_state(id) == SyncJobState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.coordinator.job_state(id), SyncJobState::Idle);

        let identity = h.store.get_identity(id).await.unwrap();
        assert!(identity.last_synced_at.is_some());
        assert_eq!(identity.missed_total, 2);

        let again = h.coordinator.sync(id).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_job_timeout_does_not_cut_a_started_commit() {
        let h = harness_with(SyncConfig {
            job_timeout_secs: 1,
            ..SyncConfig::default()
        })
        .await;
        let id = enroll(&h, "395251101411").await;

        let reader = h.coordinator.gates.read(id).await;
        let release = async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            drop(reader);
        };
        let (result, ()) = tokio::join!(h.coordinator.sync(id), release);

        assert!(result.unwrap().changed);
        assert!(h.store.get_identity(id).await.unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_rejected_token_triggers_one_relogin() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.coordinator.sync(id).await.unwrap();
        assert_eq!(h.remote.logins.load(Ordering::SeqCst), 1);

        h.remote.expire_tokens(1);
        h.coordinator.sync(id).await.unwrap();
        assert_eq!(h.remote.logins.load(Ordering::SeqCst), 2);

        // Rejected again after the fresh login: surfaced, not looped
        h.remote.expire_tokens(10);
        assert!(matches!(
            h.coordinator.sync(id).await,
            Err(SyncError::CredentialInvalid(_))
        ));
        assert_eq!(h.remote.logins.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sync_invalidates_and_read_returns_fresh_data() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        assert!(h.coordinator.attendance(id, None).await.unwrap().is_none());

        h.remote.set_attendance(vec![absence(2, false)]);
        h.coordinator.sync(id).await.unwrap();

        let first = h.coordinator.attendance(id, None).await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        // The read filled the cache
        let key = Category::Attendance.key(id, "13");
        assert!(h.cache.get(&key).await.unwrap().is_some());

        h.remote.set_attendance(vec![absence(2, false), absence(4, true)]);
        let outcome = h.coordinator.sync(id).await.unwrap();
        assert!(outcome.invalidated.contains(&Category::Attendance));
        assert!(!outcome.invalidated.contains(&Category::Contract));
        assert!(h.cache.get(&key).await.unwrap().is_none());

        let fresh = h.coordinator.attendance(id, Some("13")).await.unwrap().unwrap();
        assert_eq!(fresh.len(), 2);
        let profile = h.coordinator.profile(id).await.unwrap().unwrap();
        assert_eq!(profile.remote_id, Some(4411));
        assert_eq!(h.coordinator.semesters(id).await.unwrap().unwrap()[0].code, "13");
    }

    #[tokio::test]
    async fn test_gpa_falls_back_to_previous_semester() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_subjects(vec![
            subject("1", 6.0, 0.0, "13"),
            subject("2", 4.0, 90.0, "12"),
            subject("3", 4.0, 60.0, "12"),
        ]);

        h.coordinator.sync(id).await.unwrap();
        assert_eq!(h.store.get_identity(id).await.unwrap().gpa, Some(4.0));
        assert_eq!(h.remote.calls("subjects"), 2);
    }

    #[tokio::test]
    async fn test_registered_units_resolve_and_variant_is_recorded_with_commit() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        let group = h
            .resolver
            .register(UnitKind::Group, "25-23 AXBOROT XIZMATI (O'ZBEK)", None)
            .await
            .unwrap();
        h.remote.set_departments(vec![Department {
            id: 3,
            name: "Axborot texnologiyalari".to_string(),
            code: Some("03".to_string()),
            structure_type: Some("Fakultet".to_string()),
            parent_id: None,
        }]);
        assert_eq!(h.coordinator.refresh_units(id).await.unwrap().faculties, 1);

        let outcome = h.coordinator.sync(id).await.unwrap();
        assert!(!outcome.unresolved.contains(&UnitKind::Group));
        assert!(!outcome.unresolved.contains(&UnitKind::Faculty));

        let identity = h.store.get_identity(id).await.unwrap();
        assert_eq!(identity.group_id, Some(group.id));
        assert!(identity.faculty_id.is_some());

        let units = h.store.list_units(UnitKind::Group).await.unwrap();
        assert_eq!(units[0].variants.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_units_imports_groups_and_specialties() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_departments(vec![Department {
            id: 3,
            name: "Axborot texnologiyalari".to_string(),
            code: None,
            structure_type: Some("Fakultet".to_string()),
            parent_id: None,
        }]);
        h.remote.set_specialties(vec![RemoteSpecialty {
            id: 41,
            code: Some("60110100".to_string()),
            name: "Axborot xizmati".to_string(),
            faculty_id: Some(3),
        }]);
        h.remote.set_groups(vec![RemoteGroup {
            id: 77,
            name: "25-23 Axborot xizmati".to_string(),
            faculty_id: Some(3),
            specialty_id: Some(41),
        }]);

        // Token rejected once during the import
        h.coordinator.sync(id).await.unwrap();
        h.remote.expire_tokens(1);
        let import = h.coordinator.refresh_units(id).await.unwrap();
        assert_eq!((import.faculties, import.specialties, import.groups), (1, 1, 1));

        let outcome = h.coordinator.sync(id).await.unwrap();
        assert!(outcome.unresolved.iter().all(|k| *k == UnitKind::University));

        let identity = h.store.get_identity(id).await.unwrap();
        let group = &h.store.list_units(UnitKind::Group).await.unwrap()[0];
        assert_eq!(identity.group_id, Some(group.id));
        assert_eq!(group.parent_id, identity.faculty_id);
        assert!(identity.specialty_id.is_some());
    }

    #[tokio::test]
    async fn test_survey_flow_through_coordinator() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.remote.set_surveys(vec![Survey {
            id: 31,
            title: Some("Ta'lim sifati".to_string()),
            status: SurveyStatus::NotStarted,
        }]);

        let surveys = h.coordinator.surveys(id).await.unwrap();
        assert_eq!(surveys.len(), 1);

        let started = h.coordinator.start_survey(id, 31).await.unwrap();
        assert_eq!(started["quiz_rule_id"], 31);
        assert_eq!(h.remote.survey_status(31), Some(SurveyStatus::InProgress));

        h.remote.expire_tokens(1);
        h.coordinator
            .answer_survey(id, 901, "radio", json!(3))
            .await
            .unwrap();
        let answers = h.remote.survey_answers();
        assert_eq!(answers.len(), 1);
        assert_eq!((answers[0].question_id, answers[0].answer.clone()), (901, json!(3)));

        h.coordinator.finish_survey(id, 31).await.unwrap();
        assert_eq!(h.remote.survey_status(31), Some(SurveyStatus::Finished));
        assert!(matches!(
            h.coordinator.finish_survey(id, 99).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_all_reports_each_identity() {
        let h = harness().await;
        let synced = enroll(&h, "395251101411").await;
        let unchanged = enroll(&h, "395251101412").await;
        let no_credential = h
            .store
            .upsert_identity(&NewIdentity {
                university_id: None,
                login: "395251101413".to_string(),
                full_name: None,
            })
            .await
            .unwrap()
            .id;
        h.coordinator.sync(unchanged).await.unwrap();

        let report = h.coordinator.sync_all().await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.failures[0].identity_id, no_credential);
        assert_eq!(report.failures[0].code, "CredentialInvalid");
        assert!(h.store.get_identity(synced).await.unwrap().last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_unreadable_cache_entry_falls_back_to_snapshot() {
        let h = harness().await;
        let id = enroll(&h, "395251101411").await;
        h.coordinator.sync(id).await.unwrap();

        let key = Category::Contract.key(id, "all");
        h.cache.set(&key, &json!({"not": "a list"}), Duration::from_secs(60)).await.unwrap();
        assert_eq!(h.coordinator.contract(id).await.unwrap(), Some(Vec::new()));
        assert_eq!(h.coordinator.purge_cache().await.unwrap(), 0);
    }
}
