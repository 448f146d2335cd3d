/// HTTP client for the HEMIS REST API
///
/// One `HemisClient` serves every identity and deployment. Requests share a
/// process-wide rate limit, transient failures are retried with capped exponential
/// backoff, and every response goes through `normalize` before it is trusted.
use super::{
    normalize, sort_latest_first, types::FromRemote, AttendanceRecord, ContractRecord, Department,
    RemoteApi, RemoteGroup, RemoteProfile, RemoteSpecialty, ScheduleEntry, Semester,
    SubjectRecord, Survey, Tenant,
};
use crate::{
    config::RemoteConfig,
    error::{SyncError, SyncResult},
    vault::RemoteToken,
};
use async_trait::async_trait;
use chrono::Utc;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Login is retried at most once
const LOGIN_MAX_ATTEMPTS: u32 = 2;

/// Successful auth checks are trusted for this long
const AUTH_MEMO_TTL: Duration = Duration::from_secs(120);

/// Directory lists are requested at this page size (the remote caps it at 200)
const DIRECTORY_PAGE_LIMIT: u32 = 200;

/// Upper bound on pages followed for one directory list
const DIRECTORY_MAX_PAGES: u32 = 100;

/// Result of probing a token against `/account/me`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Ok,
    AuthError,
    NetworkError,
}

/// Why one attempt failed
enum Failure {
    /// Worth another attempt
    Retry(SyncError),
    Fatal(SyncError),
}

/// HEMIS REST client
pub struct HemisClient {
    http: Client,
    config: RemoteConfig,
    /// Lifetime assumed for tokens without an `exp` claim
    token_lifetime: chrono::Duration,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    /// Token fingerprint and base URL to the time of the last successful check
    auth_memo: Mutex<HashMap<String, Instant>>,
}

impl HemisClient {
    pub fn new(config: &RemoteConfig, token_lifetime: chrono::Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| SyncError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let rps = NonZeroU32::new(config.requests_per_second).ok_or_else(|| {
            SyncError::Configuration("Request rate must be at least 1 per second".to_string())
        })?;

        Ok(Self {
            http,
            config: config.clone(),
            token_lifetime,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
            auth_memo: Mutex::new(HashMap::new()),
        })
    }

    /// Delay before the attempt following `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.config.backoff_base_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.config.backoff_max_ms))
    }

    /// Send a request until it succeeds, fails permanently, or runs out of attempts
    async fn execute<F>(&self, endpoint: &str, max_attempts: u32, build: F) -> SyncResult<Value>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.limiter.until_ready().await;

            let outcome = match build().send().await {
                Ok(response) => read_response(endpoint, attempt, response).await,
                Err(e) => Err(transport_failure(endpoint, attempt, e)),
            };

            match outcome {
                Ok(body) => return Ok(body),
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Retry(e)) if attempt >= max_attempts => {
                    warn!("{} failed after {} attempt(s): {}", endpoint, attempt, e);
                    return Err(e);
                }
                Err(Failure::Retry(e)) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        endpoint, attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Authenticated GET
    async fn get(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        path: &str,
        query: &[(&str, String)],
    ) -> SyncResult<Value> {
        let url = tenant.url(path);
        debug!("GET {}", url);
        self.execute(path, self.config.max_attempts, || {
            token.apply(self.http.get(&url).query(query))
        })
        .await
    }

    /// Authenticated GET of every page of a directory list
    async fn get_paged<T: FromRemote>(&self, tenant: &Tenant, token: &RemoteToken, path: &str) -> SyncResult<Vec<T>> {
        let mut records = Vec::new();
        let mut page = 1;
        loop {
            let query = [
                ("limit", DIRECTORY_PAGE_LIMIT.to_string()),
                ("page", page.to_string()),
            ];
            let body = self.get(tenant, token, path, &query).await?;
            records.extend(normalize::records::<T>(path, &body)?);

            let pages = normalize::page_count(&body);
            if page >= pages {
                break;
            }
            if page >= DIRECTORY_MAX_PAGES {
                warn!("{} reports {} pages, stopping at {}", path, pages, page);
                break;
            }
            page += 1;
        }
        debug!("{}: {} records", path, records.len());
        Ok(records)
    }

    /// Authenticated POST, sent once: the survey endpoints are not idempotent
    async fn post_once(&self, tenant: &Tenant, token: &RemoteToken, path: &str, payload: &Value) -> SyncResult<Value> {
        let url = tenant.url(path);
        debug!("POST {}", url);
        let body = self
            .execute(path, 1, || token.apply(self.http.post(&url).json(payload)))
            .await?;
        normalize::object(path, &body).cloned()
    }

    /// Probe whether a token is still accepted
    ///
    /// Only `Ok` results are memoized, so a failing token is re-checked on the next call.
    pub async fn check_auth(&self, tenant: &Tenant, token: &RemoteToken) -> AuthStatus {
        let memo_key = format!("{}-{}", token.fingerprint(), tenant.base_url);
        if let Some(checked_at) = self.memo().get(&memo_key) {
            if checked_at.elapsed() < AUTH_MEMO_TTL {
                return AuthStatus::Ok;
            }
        }

        self.limiter.until_ready().await;
        let status = match token.apply(self.http.get(tenant.url("/account/me"))).send().await {
            Ok(response) => match response.status() {
                s if s.is_success() => AuthStatus::Ok,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AuthStatus::AuthError,
                _ => AuthStatus::NetworkError,
            },
            Err(e) => {
                warn!("Auth check failed: {}", e);
                AuthStatus::NetworkError
            }
        };

        let mut memo = self.memo();
        if status == AuthStatus::Ok {
            memo.insert(memo_key, Instant::now());
        } else {
            memo.remove(&memo_key);
        }
        status
    }

    fn memo(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.auth_memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Classify a transport-level error
fn transport_failure(endpoint: &str, attempt: u32, e: reqwest::Error) -> Failure {
    if e.is_timeout() {
        Failure::Retry(SyncError::RemoteTimeout {
            endpoint: endpoint.to_string(),
            attempts: attempt,
        })
    } else if e.is_connect() || e.is_request() {
        Failure::Retry(SyncError::RemoteUnavailable(format!("{}: {}", endpoint, e)))
    } else {
        Failure::Fatal(SyncError::RemoteUnavailable(format!("{}: {}", endpoint, e)))
    }
}

/// Map a status code and body to a JSON value or a failure
async fn read_response(endpoint: &str, attempt: u32, response: Response) -> Result<Value, Failure> {
    let status = response.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Failure::Fatal(SyncError::CredentialInvalid(format!(
            "{} answered {}",
            endpoint, status
        ))));
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(Failure::Retry(SyncError::RemoteUnavailable(format!(
            "{} answered {}",
            endpoint, status
        ))));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(Failure::Fatal(SyncError::NotFound(endpoint.to_string())));
    }
    if !status.is_success() {
        return Err(Failure::Fatal(SyncError::RemoteUnavailable(format!(
            "{} answered {}",
            endpoint, status
        ))));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| transport_failure(endpoint, attempt, e))?;
    serde_json::from_slice(&bytes).map_err(|e| {
        let preview: String = String::from_utf8_lossy(&bytes).chars().take(200).collect();
        warn!("Non-JSON body from {}: {} ({})", endpoint, e, preview);
        Failure::Fatal(SyncError::RemoteSchemaMismatch {
            endpoint: endpoint.to_string(),
            detail: format!("body is not JSON: {}", e),
        })
    })
}

fn semester_query(semester: Option<&str>) -> Vec<(&'static str, String)> {
    semester
        .filter(|s| !s.is_empty())
        .map(|s| vec![("semester", s.to_string())])
        .unwrap_or_default()
}

#[async_trait]
impl RemoteApi for HemisClient {
    async fn login(&self, tenant: &Tenant, login: &str, password: &str) -> SyncResult<RemoteToken> {
        const ENDPOINT: &str = "/auth/login";
        let url = tenant.url(ENDPOINT);
        // Some deployments reject numeric logins, so it always goes out as a string
        let body = json!({ "login": login.trim(), "password": password });

        info!("Authenticating {} against {}", login, tenant.base_url);
        let response = self
            .execute(ENDPOINT, LOGIN_MAX_ATTEMPTS.min(self.config.max_attempts.max(1)), || {
                self.http.post(&url).json(&body)
            })
            .await
            .map_err(|e| match e {
                SyncError::NotFound(_) => {
                    SyncError::CredentialInvalid(format!("No such user: {}", login))
                }
                other => other,
            })?;

        let secret = normalize::token(ENDPOINT, &response)?;
        Ok(RemoteToken::issued(secret, Utc::now(), self.token_lifetime))
    }

    async fn get_profile(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<RemoteProfile> {
        const ENDPOINT: &str = "/account/me";
        let body = self.get(tenant, token, ENDPOINT, &[]).await?;
        normalize::record(ENDPOINT, &body)
    }

    async fn get_attendance(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<AttendanceRecord>> {
        const ENDPOINT: &str = "/education/attendance";
        let body = self
            .get(tenant, token, ENDPOINT, &semester_query(semester))
            .await?;
        normalize::records(ENDPOINT, &body)
    }

    async fn get_grades(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<SubjectRecord>> {
        const ENDPOINT: &str = "/education/subject-list";
        let body = self
            .get(tenant, token, ENDPOINT, &semester_query(semester))
            .await?;
        normalize::records(ENDPOINT, &body)
    }

    async fn get_contract(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<ContractRecord>> {
        const ENDPOINT: &str = "/student/contract-list";
        let body = self.get(tenant, token, ENDPOINT, &[]).await?;
        normalize::records(ENDPOINT, &body)
    }

    async fn get_schedule(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        semester: Option<&str>,
    ) -> SyncResult<Vec<ScheduleEntry>> {
        const ENDPOINT: &str = "/education/schedule";
        let body = self
            .get(tenant, token, ENDPOINT, &semester_query(semester))
            .await?;
        normalize::records(ENDPOINT, &body)
    }

    async fn get_semesters(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Semester>> {
        const ENDPOINT: &str = "/education/semesters";
        let body = self.get(tenant, token, ENDPOINT, &[]).await?;
        let mut semesters: Vec<Semester> = normalize::records(ENDPOINT, &body)?;
        sort_latest_first(&mut semesters);
        Ok(semesters)
    }

    async fn get_department_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Department>> {
        self.get_paged(tenant, token, "/data/department-list").await
    }

    async fn get_specialty_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<RemoteSpecialty>> {
        self.get_paged(tenant, token, "/data/specialty-list").await
    }

    async fn get_group_list(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<RemoteGroup>> {
        self.get_paged(tenant, token, "/data/group-list").await
    }

    async fn get_public_student_total(&self, tenant: &Tenant) -> SyncResult<u64> {
        const ENDPOINT: &str = "/public/stat-student";
        let url = tenant.url(ENDPOINT);
        let body = self
            .execute(ENDPOINT, self.config.max_attempts, || self.http.get(&url))
            .await?;
        normalize::public_student_total(ENDPOINT, &body)
    }

    async fn get_surveys(&self, tenant: &Tenant, token: &RemoteToken) -> SyncResult<Vec<Survey>> {
        const ENDPOINT: &str = "/student/survey";
        let body = self.get(tenant, token, ENDPOINT, &[]).await?;
        normalize::surveys(ENDPOINT, &body)
    }

    async fn start_survey(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        survey_id: i64,
    ) -> SyncResult<Value> {
        let payload = json!({ "id": survey_id, "lang": "UZ" });
        self.post_once(tenant, token, "/student/survey-start", &payload).await
    }

    async fn submit_survey_answer(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        question_id: i64,
        button_type: &str,
        answer: Value,
    ) -> SyncResult<Value> {
        let payload = json!({
            "question_id": question_id,
            "button_type": button_type,
            "answer": answer,
        });
        self.post_once(tenant, token, "/student/survey-answer", &payload).await
    }

    async fn finish_survey(
        &self,
        tenant: &Tenant,
        token: &RemoteToken,
        quiz_rule_id: i64,
    ) -> SyncResult<Value> {
        let payload = json!({ "quiz_rule_id": quiz_rule_id });
        self.post_once(tenant, token, "/student/survey-finish", &payload).await
    }
}
