/// Remote HEMIS API access
///
/// `RemoteApi` is the seam between the engine and the remote system. `HemisClient`
/// is the HTTP implementation; `testing::FakeRemote` is an in-memory stand-in.
pub mod client;
pub mod normalize;
pub mod testing;
pub mod types;
pub mod university;

pub use client::{AuthStatus, HemisClient};
pub use types::{
    AttendanceRecord, ContractRecord, Department, ExamScore, RemoteGroup, RemoteProfile,
    RemoteSpecialty, ScheduleEntry, Semester, SubjectRecord, Survey, SurveyStatus,
};
pub use university::{Tenant, University, UniversityDirectory};

use crate::{error::SyncResult, vault::RemoteToken};
use async_trait::async_trait;

/// Typed operations against one HEMIS deployment
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Exchange a login and password for a bearer token
    async fn login(&self, tenant: &Tenant, login: &str, password: &str) -> SyncResult<RemoteToken>;

    async fn get_profile(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<RemoteProfile>;

    async fn get_attendance(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<AttendanceRecord>>;

    /// Subjects with grades (`/education/subject-list`)
    async fn get_grades(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<SubjectRecord>>;

    async fn get_contract(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<ContractRecord>>;

    async fn get_schedule(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<ScheduleEntry>>;

    /// Semesters, latest first
    async fn get_semesters(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Semester>>;

    async fn get_department_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Department>>;

    /// Every page of `/data/specialty-list`
    async fn get_specialty_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<RemoteSpecialty>>;

    /// Every page of `/data/group-list`
    async fn get_group_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<RemoteGroup>>;

    /// Total enrolled students from the unauthenticated statistics endpoint
    async fn get_public_student_total(&self, tenant: &Tenant) -> SyncResult<u64>;

    async fn get_surveys(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Survey>>;

    /// Open a survey; the body carries its questions
    async fn start_survey(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        survey_id: i64,
    ) -> SyncResult<serde_json::Value>;

    /// `answer` is a variant id, a list of them, or free text, per `button_type`
    async fn submit_survey_answer(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        question_id: i64,
        button_type: &str,
        answer: serde_json::Value,
    ) -> SyncResult<serde_json::Value>;

    async fn finish_survey(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        quiz_rule_id: i64,
    ) -> SyncResult<serde_json::Value>;
}

/// Order semesters latest first
pub(crate) fn sort_latest_first(semesters: &mut [Semester]) {
    semesters.sort_by(|a, b| b.ordinal().cmp(&a.ordinal()));
}
