/// In-memory `RemoteApi` for tests and local runs
///
/// Serves one configurable student. Failures can be injected per endpoint, and
/// tokens can be made to expire so callers exercise their re-login path.
use super::{
    sort_latest_first, AttendanceRecord, ContractRecord, Department, RemoteApi, RemoteGroup,
    RemoteProfile, RemoteSpecialty, ScheduleEntry, Semester, SubjectRecord, Survey, SurveyStatus,
    Tenant,
};
use crate::{
    error::{SyncError, SyncResult},
    vault::RemoteToken,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Endpoint names accepted by `FakeRemote::fail_endpoint`
pub const ENDPOINTS: [&str; 10] = [
    "profile",
    "attendance",
    "subjects",
    "contract",
    "schedule",
    "semesters",
    "departments",
    "specialties",
    "groups",
    "survey",
];

/// One answer received by `FakeRemote::submit_survey_answer`
#[derive(Debug, Clone, PartialEq)]
pub struct SurveyAnswer {
    pub question_id: i64,
    pub button_type: String,
    pub answer: Value,
}

#[derive(Default)]
struct FakeState {
    last_login: Option<String>,
    rejected_passwords: HashSet<String>,
    profile: RemoteProfile,
    attendance: Vec<AttendanceRecord>,
    subjects: Vec<SubjectRecord>,
    contract: Vec<ContractRecord>,
    schedule: Vec<ScheduleEntry>,
    semesters: Vec<Semester>,
    departments: Vec<Department>,
    specialties: Vec<RemoteSpecialty>,
    groups: Vec<RemoteGroup>,
    surveys: Vec<Survey>,
    survey_answers: Vec<SurveyAnswer>,
    failing: HashSet<&'static str>,
    /// Data calls left to answer with 401
    unauthorized: usize,
    delay: Option<std::time::Duration>,
    calls: HashMap<&'static str, usize>,
}

/// Scripted remote system
pub struct FakeRemote {
    /// Successful and rejected login attempts
    pub logins: AtomicUsize,
    issued: AtomicUsize,
    state: Mutex<FakeState>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    /// Remote serving a second-year student with no absences
    pub fn new() -> Self {
        let state = FakeState {
            profile: RemoteProfile {
                remote_id: Some(4411),
                student_id_number: Some("395251101411".to_string()),
                full_name: Some("ALIYEV VALI".to_string()),
                university: Some("Jizzax davlat pedagogika universiteti".to_string()),
                faculty: Some("Axborot texnologiyalari".to_string()),
                group: Some("25-23 AXBOROT XIZMATI (KUNDUZGI) (O'ZBEK)".to_string()),
                specialty: Some("Axborot xizmati".to_string()),
                level: Some("2-kurs".to_string()),
                semester_code: Some("13".to_string()),
                semester_name: Some("3-semestr".to_string()),
                education_form: Some("Kunduzgi".to_string()),
            },
            semesters: vec![
                Semester {
                    id: Some(12),
                    code: "12".to_string(),
                    name: Some("2-semestr".to_string()),
                    current: false,
                },
                Semester {
                    id: Some(13),
                    code: "13".to_string(),
                    name: Some("3-semestr".to_string()),
                    current: true,
                },
            ],
            ..FakeState::default()
        };

        Self {
            logins: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            state: Mutex::new(state),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Login most recently attempted
    pub fn last_login(&self) -> Option<String> {
        self.with_state(|s| s.last_login.clone())
    }

    /// Logins with this password are answered like a wrong password
    pub fn reject_password(&self, password: &str) {
        self.with_state(|s| s.rejected_passwords.insert(password.to_string()));
    }

    pub fn set_profile(&self, profile: RemoteProfile) {
        self.with_state(|s| s.profile = profile);
    }

    pub fn set_attendance(&self, records: Vec<AttendanceRecord>) {
        self.with_state(|s| s.attendance = records);
    }

    pub fn set_subjects(&self, subjects: Vec<SubjectRecord>) {
        self.with_state(|s| s.subjects = subjects);
    }

    pub fn set_contract(&self, contract: Vec<ContractRecord>) {
        self.with_state(|s| s.contract = contract);
    }

    pub fn set_schedule(&self, schedule: Vec<ScheduleEntry>) {
        self.with_state(|s| s.schedule = schedule);
    }

    pub fn set_semesters(&self, semesters: Vec<Semester>) {
        self.with_state(|s| s.semesters = semesters);
    }

    pub fn set_departments(&self, departments: Vec<Department>) {
        self.with_state(|s| s.departments = departments);
    }

    pub fn set_specialties(&self, specialties: Vec<RemoteSpecialty>) {
        self.with_state(|s| s.specialties = specialties);
    }

    pub fn set_groups(&self, groups: Vec<RemoteGroup>) {
        self.with_state(|s| s.groups = groups);
    }

    pub fn set_surveys(&self, surveys: Vec<Survey>) {
        self.with_state(|s| s.surveys = surveys);
    }

    /// Answers submitted so far, oldest first
    pub fn survey_answers(&self) -> Vec<SurveyAnswer> {
        self.with_state(|s| s.survey_answers.clone())
    }

    /// State of a listed survey
    pub fn survey_status(&self, survey_id: i64) -> Option<SurveyStatus> {
        self.with_state(|s| s.surveys.iter().find(|v| v.id == survey_id).map(|v| v.status))
    }

    fn move_survey(&self, survey_id: i64, from: SurveyStatus, to: SurveyStatus) -> SyncResult<()> {
        self.with_state(|s| {
            let survey = s
                .surveys
                .iter_mut()
                .find(|v| v.id == survey_id)
                .ok_or_else(|| SyncError::NotFound(format!("Survey {}", survey_id)))?;
            if survey.status == from {
                survey.status = to;
            }
            Ok(())
        })
    }

    /// Make an endpoint answer as if the remote were down
    pub fn fail_endpoint(&self, endpoint: &str) {
        if let Some(name) = ENDPOINTS.iter().find(|e| **e == endpoint) {
            self.with_state(|s| s.failing.insert(*name));
        }
    }

    pub fn clear_failures(&self) {
        self.with_state(|s| s.failing.clear());
    }

    /// Answer the next `count` authenticated calls with 401
    pub fn expire_tokens(&self, count: usize) {
        self.with_state(|s| s.unauthorized = count);
    }

    /// Delay every profile fetch, to hold a sync in flight
    pub fn set_delay(&self, delay: std::time::Duration) {
        self.with_state(|s| s.delay = Some(delay));
    }

    /// Number of calls made to an endpoint
    pub fn calls(&self, endpoint: &str) -> usize {
        self.with_state(|s| s.calls.get(endpoint).copied().unwrap_or(0))
    }

    fn enter(&self, endpoint: &'static str) -> SyncResult<()> {
        self.with_state(|s| {
            *s.calls.entry(endpoint).or_insert(0) += 1;

            if s.unauthorized > 0 {
                s.unauthorized -= 1;
                return Err(SyncError::CredentialInvalid(format!(
                    "{} answered 401 Unauthorized",
                    endpoint
                )));
            }
            if s.failing.contains(endpoint) {
                return Err(SyncError::RemoteUnavailable(format!(
                    "{} answered 503 Service Unavailable",
                    endpoint
                )));
            }
            Ok(())
        })
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn login(&self, _tenant: &Tenant, login: &str, password: &str) -> SyncResult<RemoteToken> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        let rejected = self.with_state(|s| {
            s.last_login = Some(login.to_string());
            s.rejected_passwords.contains(password)
        });
        if rejected {
            return Err(SyncError::CredentialInvalid(
                "Login yoki parol noto'g'ri".to_string(),
            ));
        }

        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RemoteToken::new(
            format!("fake-token-{}-{}", login, n),
            Utc::now() + Duration::hours(1),
        ))
    }

    async fn get_profile(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<RemoteProfile> {
        if let Some(delay) = self.with_state(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }
        self.enter("profile")?;
        Ok(self.with_state(|s| s.profile.clone()))
    }

    async fn get_attendance(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        _semester: Option<&str>,
    ) -> SyncResult<Vec<AttendanceRecord>> {
        self.enter("attendance")?;
        Ok(self.with_state(|s| s.attendance.clone()))
    }

    async fn get_grades(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<SubjectRecord>> {
        self.enter("subjects")?;
        Ok(self.with_state(|s| {
            s.subjects
                .iter()
                .filter(|subject| match (semester, subject.semester_code.as_deref()) {
                    (Some(wanted), Some(code)) => wanted == code,
                    _ => true,
                })
                .cloned()
                .collect()
        }))
    }

    async fn get_contract(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<ContractRecord>> {
        self.enter("contract")?;
        Ok(self.with_state(|s| s.contract.clone()))
    }

    async fn get_schedule(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        _semester: Option<&str>,
    ) -> SyncResult<Vec<ScheduleEntry>> {
        self.enter("schedule")?;
        Ok(self.with_state(|s| s.schedule.clone()))
    }

    async fn get_semesters(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<Semester>> {
        self.enter("semesters")?;
        let mut semesters = self.with_state(|s| s.semesters.clone());
        sort_latest_first(&mut semesters);
        Ok(semesters)
    }

    async fn get_department_list(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<Department>> {
        self.enter("departments")?;
        Ok(self.with_state(|s| s.departments.clone()))
    }

    async fn get_public_student_total(&self, _tenant: &Tenant) -> SyncResult<u64> {
        Ok(0)
    }

    async fn get_specialty_list(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<RemoteSpecialty>> {
        self.enter("specialties")?;
        Ok(self.with_state(|s| s.specialties.clone()))
    }

    async fn get_group_list(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<RemoteGroup>> {
        self.enter("groups")?;
        Ok(self.with_state(|s| s.groups.clone()))
    }

    async fn get_surveys(&self, _tenant: &Tenant, _token: &RemoteToken) -> SyncResult<Vec<Survey>> {
        self.enter("survey")?;
        Ok(self.with_state(|s| s.surveys.clone()))
    }

    async fn start_survey(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        survey_id: i64,
    ) -> SyncResult<Value> {
        self.enter("survey")?;
        self.move_survey(survey_id, SurveyStatus::NotStarted, SurveyStatus::InProgress)?;
        Ok(json!({"quiz_rule_id": survey_id, "questions": []}))
    }

    async fn submit_survey_answer(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        question_id: i64,
        button_type: &str,
        answer: Value,
    ) -> SyncResult<Value> {
        self.enter("survey")?;
        self.with_state(|s| {
            s.survey_answers.push(SurveyAnswer {
                question_id,
                button_type: button_type.to_string(),
                answer,
            })
        });
        Ok(json!({"question_id": question_id}))
    }

    async fn finish_survey(
        &self,
        _tenant: &Tenant,
        _token: &RemoteToken,
        quiz_rule_id: i64,
    ) -> SyncResult<Value> {
        self.enter("survey")?;
        self.move_survey(quiz_rule_id, SurveyStatus::InProgress, SurveyStatus::Finished)?;
        Ok(json!({"quiz_rule_id": quiz_rule_id}))
    }
}
