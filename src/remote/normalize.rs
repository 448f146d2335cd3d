/// Response envelope normalization
///
/// The remote wraps payloads inconsistently: `{data:{items:[..]}}`, `{data:[..]}`
/// or a bare array for lists, `{data:{..}}` or a bare object for single records.
/// Anything else is a schema mismatch; it is never turned into an empty success.
use super::types::{int, FromRemote, Survey, SurveyStatus};
use crate::error::{SyncError, SyncResult};
use serde_json::Value;
use tracing::warn;

const PREVIEW_LEN: usize = 200;

/// Build a schema mismatch error, logging the endpoint and a preview of the body
pub fn mismatch(endpoint: &str, body: &Value, detail: &str) -> SyncError {
    let preview = shape_preview(body);
    warn!("Schema mismatch from {}: {} ({})", endpoint, detail, preview);
    SyncError::RemoteSchemaMismatch {
        endpoint: endpoint.to_string(),
        detail: format!("{}: {}", detail, preview),
    }
}

/// Truncated rendering of a body for diagnostics
pub fn shape_preview(body: &Value) -> String {
    let rendered = body.to_string();
    if rendered.chars().count() <= PREVIEW_LEN {
        rendered
    } else {
        let cut: String = rendered.chars().take(PREVIEW_LEN).collect();
        format!("{}...", cut)
    }
}

/// Reject `success: false` envelopes
fn check_success(endpoint: &str, body: &Value) -> SyncResult<()> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("success=false");
        return Err(mismatch(endpoint, body, reason));
    }
    Ok(())
}

/// Extract the item list from any known list envelope
pub fn items<'a>(endpoint: &str, body: &'a Value) -> SyncResult<&'a Vec<Value>> {
    check_success(endpoint, body)?;

    match body {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Object(data)) => match data.get("items") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(mismatch(endpoint, body, "data object without items list")),
            },
            _ => Err(mismatch(endpoint, body, "expected data list")),
        },
        _ => Err(mismatch(endpoint, body, "expected list envelope")),
    }
}

/// Parse every item of a list envelope into records
pub fn records<T: FromRemote>(endpoint: &str, body: &Value) -> SyncResult<Vec<T>> {
    items(endpoint, body)?
        .iter()
        .enumerate()
        .map(|(i, item)| {
            T::from_remote(item)
                .ok_or_else(|| mismatch(endpoint, item, &format!("unparseable item {}", i)))
        })
        .collect()
}

/// Page count of a paged list (`data.pagination.pageCount`); 1 when absent
pub fn page_count(body: &Value) -> u32 {
    body.pointer("/data/pagination/pageCount")
        .and_then(int)
        .map_or(1, |n| n.clamp(1, i64::from(u32::MAX)) as u32)
}

/// Surveys grouped by state (`data.{not_started,in_progress,finished}`)
pub fn surveys(endpoint: &str, body: &Value) -> SyncResult<Vec<Survey>> {
    let data = object(endpoint, body)?;

    let mut surveys = Vec::new();
    for status in [SurveyStatus::NotStarted, SurveyStatus::InProgress, SurveyStatus::Finished] {
        let list = match data.get(status.list_key()) {
            None | Some(Value::Null) => continue,
            Some(Value::Array(list)) => list,
            Some(_) => return Err(mismatch(endpoint, body, &format!("{} is not a list", status.list_key()))),
        };
        for (i, item) in list.iter().enumerate() {
            let survey = Survey::parse(item, status).ok_or_else(|| {
                mismatch(endpoint, item, &format!("unparseable {} survey {}", status.list_key(), i))
            })?;
            surveys.push(survey);
        }
    }
    Ok(surveys)
}

/// Extract a single record from `{data:{..}}` or a bare object
pub fn object<'a>(endpoint: &str, body: &'a Value) -> SyncResult<&'a Value> {
    check_success(endpoint, body)?;

    match body.get("data") {
        Some(data @ Value::Object(_)) => Ok(data),
        Some(_) => Err(mismatch(endpoint, body, "data is not an object")),
        None if body.is_object() => Ok(body),
        None => Err(mismatch(endpoint, body, "expected object")),
    }
}

/// Parse a single record envelope
pub fn record<T: FromRemote>(endpoint: &str, body: &Value) -> SyncResult<T> {
    let data = object(endpoint, body)?;
    T::from_remote(data).ok_or_else(|| mismatch(endpoint, body, "unparseable record"))
}

/// Bearer token from a login response (`data.token` or `token`)
pub fn token(endpoint: &str, body: &Value) -> SyncResult<String> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        // The remote reports a wrong login or password this way
        let reason = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Login rejected");
        return Err(SyncError::CredentialInvalid(reason.to_string()));
    }

    body.pointer("/data/token")
        .or_else(|| body.get("token"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or_else(|| mismatch(endpoint, &redact_token_fields(body), "no token in login response"))
}

/// Total students from public statistics (`education_type.Jami.{Erkak,Ayol}`)
pub fn public_student_total(endpoint: &str, body: &Value) -> SyncResult<u64> {
    let stats = object(endpoint, body)?;
    let jami = stats
        .pointer("/education_type/Jami")
        .filter(|v| v.is_object())
        .ok_or_else(|| mismatch(endpoint, body, "missing education_type.Jami"))?;

    let count = |key: &str| jami.get(key).and_then(Value::as_u64).unwrap_or(0);
    Ok(count("Erkak") + count("Ayol"))
}

/// Copy of a login body safe to log
fn redact_token_fields(body: &Value) -> Value {
    let mut copy = body.clone();
    if let Some(map) = copy.as_object_mut() {
        map.remove("token");
        if let Some(data) = map.get_mut("data").and_then(Value::as_object_mut) {
            data.remove("token");
            data.remove("refresh_token");
        }
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::types::Semester;
    use serde_json::json;

    #[test]
    fn test_list_envelopes() {
        let paged = json!({"success": true, "data": {"items": [{"code": "12"}], "pagination": {}}});
        let flat = json!({"data": [{"code": "12"}]});
        let bare = json!([{"code": "12"}]);

        for body in [&paged, &flat, &bare] {
            let semesters: Vec<Semester> = records("/education/semesters", body).unwrap();
            assert_eq!(semesters[0].code, "12");
        }
    }

    #[test]
    fn test_empty_list_is_success() {
        let body = json!({"success": true, "data": []});
        let items = items("/education/attendance", &body).unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn test_unexpected_shapes_are_mismatches() {
        for body in [
            json!({"data": null}),
            json!({"data": {"total": 3}}),
            json!("maintenance"),
            json!({"success": false, "error": "Server busy", "data": []}),
        ] {
            assert!(matches!(
                items("/education/attendance", &body),
                Err(SyncError::RemoteSchemaMismatch { .. })
            ));
        }
    }

    #[test]
    fn test_unparseable_item_is_mismatch() {
        let body = json!({"data": [{"code": "12"}, 7]});
        let result: SyncResult<Vec<Semester>> = records("/education/semesters", &body);
        assert!(matches!(result, Err(SyncError::RemoteSchemaMismatch { .. })));
    }

    #[test]
    fn test_object_envelopes() {
        let wrapped = json!({"data": {"id": 1}});
        let bare = json!({"id": 1});
        assert_eq!(object("/account/me", &wrapped).unwrap()["id"], 1);
        assert_eq!(object("/account/me", &bare).unwrap()["id"], 1);
        assert!(object("/account/me", &json!({"data": [1]})).is_err());
    }

    #[test]
    fn test_token_shapes() {
        assert_eq!(token("/auth/login", &json!({"data": {"token": "abc"}})).unwrap(), "abc");
        assert_eq!(token("/auth/login", &json!({"token": "xyz"})).unwrap(), "xyz");
        assert!(matches!(
            token("/auth/login", &json!({"success": false, "error": "Login yoki parol noto'g'ri"})),
            Err(SyncError::CredentialInvalid(_))
        ));
        assert!(matches!(
            token("/auth/login", &json!({"data": {}})),
            Err(SyncError::RemoteSchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_public_total() {
        let body = json!({"success": true, "data": {"education_type": {"Jami": {"Erkak": 120, "Ayol": 80}}}});
        assert_eq!(public_student_total("/public/stat-student", &body).unwrap(), 200);
        assert!(public_student_total("/public/stat-student", &json!({"data": {}})).is_err());
    }

    #[test]
    fn test_page_count() {
        let paged = json!({"data": {"items": [], "pagination": {"page": 1, "pageCount": 3}}});
        assert_eq!(page_count(&paged), 3);
        assert_eq!(page_count(&json!({"data": []})), 1);
        assert_eq!(page_count(&json!({"data": {"pagination": {"pageCount": 0}}})), 1);
    }

    #[test]
    fn test_surveys_by_state() {
        let body = json!({"success": true, "data": {
            "not_started": [{"id": 1, "quizRuleProjection": {"id": 31, "theme": "Sifat"}}],
            "in_progress": null,
            "finished": [{"id": 2}]
        }});
        let surveys = surveys("/student/survey", &body).unwrap();
        assert_eq!(surveys.len(), 2);
        assert_eq!((surveys[0].id, surveys[0].status), (31, SurveyStatus::NotStarted));
        assert_eq!((surveys[1].id, surveys[1].status), (2, SurveyStatus::Finished));

        let broken = json!({"data": {"finished": {"id": 2}}});
        assert!(matches!(
            super::surveys("/student/survey", &broken),
            Err(SyncError::RemoteSchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_preview_is_truncated() {
        let body = json!({"blob": "x".repeat(1000)});
        assert!(shape_preview(&body).len() < 220);
    }
}
