/// Score computation
///
/// Everything here works on data that is already local: quiz attempts scored
/// against their answer key, attendance totals and GPA derived from synced records.
/// Nothing in this module calls the remote system.
pub mod attendance;
pub mod gpa;

pub use attendance::{AttendancePolicy, AttendanceTotals};
pub use gpa::{
    cumulative_gpa, parse_exam_grades, reporting_semester, weighted_gpa, ExamBreakdown,
    GpaResult, GradeScale, RetakePolicy,
};

use crate::{
    config::ScoreConfig,
    error::{SyncError, SyncResult},
    remote::{AttendanceRecord, SubjectRecord},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Answer ids submitted for one question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: i64,
    pub submitted: BTreeSet<i64>,
}

/// One quiz attempt and the answers recorded so far
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: i64,
    pub identity_id: i64,
    pub quiz_id: i64,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub score: Option<i64>,
    pub answers: Vec<AnswerRecord>,
}

impl Attempt {
    pub fn is_finalized(&self) -> bool {
        self.closed_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map_or(false, |deadline| now > deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemResult {
    pub question_id: i64,
    pub is_correct: bool,
}

/// Scored attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub attempt_id: i64,
    /// Questions answered exactly right
    pub correct: i64,
    pub total: usize,
    pub items: Vec<ItemResult>,
    pub closed_at: DateTime<Utc>,
}

/// Outcome of closing an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finalize {
    Finalized,
    /// Another scorer closed it first; nothing was written
    AlreadyFinalized,
}

/// Persistence of quiz attempts
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn create_attempt(
        &self,
        identity_id: i64,
        quiz_id: i64,
        created_at: DateTime<Utc>,
        deadline: Option<DateTime<Utc>>,
    ) -> SyncResult<Attempt>;

    /// Insert or replace the answer to one question
    async fn record_answer(&self, attempt_id: i64, answer: &AnswerRecord) -> SyncResult<()>;

    async fn get_attempt(&self, attempt_id: i64) -> SyncResult<Attempt>;

    /// Write the result only if the attempt is still open
    async fn finalize_attempt(&self, result: &ScoreResult) -> SyncResult<Finalize>;
}

/// Mark every expected question; a question is correct only when the submitted
/// set equals the expected set. Unanswered questions are incorrect and answers to
/// questions outside the key are ignored.
pub fn grade(answers: &[AnswerRecord], expected: &BTreeMap<i64, BTreeSet<i64>>) -> (i64, Vec<ItemResult>) {
    let submitted: BTreeMap<i64, &BTreeSet<i64>> = answers
        .iter()
        .map(|a| (a.question_id, &a.submitted))
        .collect();

    let items: Vec<ItemResult> = expected
        .iter()
        .map(|(question_id, key)| ItemResult {
            question_id: *question_id,
            is_correct: submitted.get(question_id).map_or(false, |s| *s == key),
        })
        .collect();

    let correct = items.iter().filter(|i| i.is_correct).count() as i64;
    (correct, items)
}

/// Derived scores over local data
pub struct ScoreEngine {
    attempts: Arc<dyn AttemptStore>,
    attendance: AttendancePolicy,
    grades: GradeScale,
    exclude_in_progress: bool,
    attempt_window: Option<Duration>,
}

impl ScoreEngine {
    pub fn new(config: &ScoreConfig, attempts: Arc<dyn AttemptStore>) -> Self {
        Self {
            attempts,
            attendance: config.attendance.clone(),
            grades: config.grades,
            exclude_in_progress: config.exclude_in_progress,
            attempt_window: (config.attempt_window_secs > 0)
                .then(|| Duration::seconds(config.attempt_window_secs)),
        }
    }

    pub fn attendance_totals(&self, records: &[AttendanceRecord]) -> AttendanceTotals {
        self.attendance.totals(records)
    }

    pub fn gpa(&self, subjects: &[SubjectRecord]) -> GpaResult {
        weighted_gpa(subjects, &self.grades, self.exclude_in_progress)
    }

    pub fn cumulative_gpa(&self, subjects: &[SubjectRecord], policy: RetakePolicy) -> GpaResult {
        cumulative_gpa(subjects, &self.grades, policy)
    }

    /// Open an attempt; it expires after the configured window, if any
    pub async fn start_attempt(&self, identity_id: i64, quiz_id: i64) -> SyncResult<Attempt> {
        let now = Utc::now();
        let deadline = self.attempt_window.map(|window| now + window);
        let attempt = self
            .attempts
            .create_attempt(identity_id, quiz_id, now, deadline)
            .await?;
        info!("Started attempt {} of quiz {} for identity {}", attempt.id, quiz_id, identity_id);
        Ok(attempt)
    }

    /// Record the answer ids chosen for one question of an open attempt
    pub async fn submit_answer(&self, attempt_id: i64, question_id: i64, submitted: BTreeSet<i64>) -> SyncResult<()> {
        let attempt = self.attempts.get_attempt(attempt_id).await?;
        self.ensure_open(&attempt, Utc::now())?;

        self.attempts
            .record_answer(
                attempt_id,
                &AnswerRecord {
                    question_id,
                    submitted,
                },
            )
            .await
    }

    /// Score an attempt against its answer key and finalize it
    pub async fn score(&self, attempt_id: i64, expected: &BTreeMap<i64, BTreeSet<i64>>) -> SyncResult<ScoreResult> {
        let attempt = self.attempts.get_attempt(attempt_id).await?;
        let now = Utc::now();
        self.ensure_open(&attempt, now)?;

        let (correct, items) = grade(&attempt.answers, expected);
        let result = ScoreResult {
            attempt_id,
            correct,
            total: items.len(),
            items,
            closed_at: now,
        };

        match self.attempts.finalize_attempt(&result).await? {
            Finalize::Finalized => {
                info!(
                    "Attempt {} scored {}/{}",
                    attempt_id, result.correct, result.total
                );
                Ok(result)
            }
            Finalize::AlreadyFinalized => {
                warn!("Attempt {} was finalized concurrently", attempt_id);
                Err(SyncError::AlreadyFinalized(attempt_id))
            }
        }
    }

    fn ensure_open(&self, attempt: &Attempt, now: DateTime<Utc>) -> SyncResult<()> {
        if attempt.is_finalized() {
            return Err(SyncError::AlreadyFinalized(attempt.id));
        }
        if attempt.is_expired_at(now) {
            return Err(SyncError::AttemptExpired(attempt.id));
        }
        Ok(())
    }
}
