/// Typed records returned by the remote API
///
/// Parsing is tolerant of the field-level variation seen across HEMIS deployments
/// (a name given as a string or as `{name}`, codes as numbers or strings), but an
/// item that is not an object, or lacks the fields a record cannot exist without,
/// is rejected.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parse one list item into a record
pub trait FromRemote: Sized {
    fn from_remote(item: &Value) -> Option<Self>;
}

/// Student profile (`/account/me`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub remote_id: Option<i64>,
    pub student_id_number: Option<String>,
    pub full_name: Option<String>,
    pub university: Option<String>,
    pub faculty: Option<String>,
    pub group: Option<String>,
    pub specialty: Option<String>,
    pub level: Option<String>,
    pub semester_code: Option<String>,
    pub semester_name: Option<String>,
    pub education_form: Option<String>,
}

impl FromRemote for RemoteProfile {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;

        let full_name = text(&item["full_name"]).or_else(|| {
            let parts: Vec<String> = ["second_name", "first_name", "third_name"]
                .iter()
                .filter_map(|k| text(&item[*k]))
                .collect();
            (!parts.is_empty()).then(|| parts.join(" "))
        });

        let profile = Self {
            remote_id: int(&item["id"]),
            student_id_number: text(&item["student_id_number"]),
            full_name,
            university: name_of(item, "university"),
            faculty: name_of(item, "faculty"),
            group: name_of(item, "group"),
            specialty: name_of(item, "specialty"),
            level: name_of(item, "level"),
            semester_code: code_of(item, "semester"),
            semester_name: name_of(item, "semester"),
            education_form: name_of(item, "educationForm"),
        };

        // An object with none of the identifying fields is not a profile
        if profile.remote_id.is_none() && profile.full_name.is_none() && profile.student_id_number.is_none() {
            return None;
        }
        Some(profile)
    }
}

/// One missed lesson (`/education/attendance`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub subject: Option<String>,
    pub lesson_date: Option<i64>,
    /// Academic hours missed (remote omits it for a standard 2-hour pair)
    pub hour: i64,
    pub explicable: bool,
    pub absent_status_code: Option<String>,
    pub absent_status_name: Option<String>,
}

impl FromRemote for AttendanceRecord {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        Some(Self {
            subject: name_of(item, "subject"),
            lesson_date: int(&item["lesson_date"]),
            hour: int(&item["hour"]).filter(|h| *h > 0).unwrap_or(2),
            explicable: item["explicable"].as_bool().unwrap_or(false)
                || item["is_valid"].as_bool().unwrap_or(false),
            absent_status_code: code_of(item, "absent_status"),
            absent_status_name: name_of(item, "absent_status"),
        })
    }
}

/// One exam result of a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamScore {
    pub exam_type_code: String,
    pub exam_type_name: Option<String>,
    pub grade: f64,
    pub max_ball: f64,
}

/// Subject with its grades (`/education/subject-list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: Option<String>,
    pub name: String,
    pub credit: f64,
    /// Overall score, on the 100-point or 5-point scale depending on the deployment
    pub overall_score: f64,
    pub semester_code: Option<String>,
    pub exams: Vec<ExamScore>,
}

impl FromRemote for SubjectRecord {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;

        let info = [&item["curriculumSubject"], &item["subject"]]
            .into_iter()
            .find(|v| v.is_object())
            .unwrap_or(&Value::Null);

        let name = text(&info["name"])
            .or_else(|| name_of(info, "subject"))
            .or_else(|| text(&item["name"]))?;

        let subject_id = text(&info["id"]).or_else(|| text(&item["subject"]["id"]));

        let credit = number(&item["credit"])
            .or_else(|| number(&info["credit"]))
            .unwrap_or(0.0);

        let overall = &item["overallScore"];
        let overall_score = number(&overall["grade"])
            .or_else(|| number(overall))
            .unwrap_or(0.0);

        let exams = item["gradesByExam"]
            .as_array()
            .map(|exams| {
                exams
                    .iter()
                    .filter_map(|ex| {
                        Some(ExamScore {
                            exam_type_code: code_of(ex, "examType")?,
                            exam_type_name: name_of(ex, "examType"),
                            grade: number(&ex["grade"]).unwrap_or(0.0),
                            max_ball: number(&ex["max_ball"]).unwrap_or(0.0),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            subject_id,
            name,
            credit,
            overall_score,
            semester_code: code_of(item, "semester").or_else(|| text(&item["_semester"])),
            exams,
        })
    }
}

/// Tuition contract (`/student/contract-list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractRecord {
    pub number: Option<String>,
    pub education_year: Option<String>,
    pub amount: f64,
    pub paid: f64,
    pub debt: f64,
}

impl FromRemote for ContractRecord {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;

        let amount = number(&item["summa"])
            .or_else(|| number(&item["contract_sum"]))
            .or_else(|| number(&item["amount"]))
            .unwrap_or(0.0);
        let paid = number(&item["paid"])
            .or_else(|| number(&item["paid_summa"]))
            .unwrap_or(0.0);
        let debt = number(&item["debt"]).unwrap_or((amount - paid).max(0.0));

        Some(Self {
            number: text(&item["contractNumber"]).or_else(|| text(&item["number"])),
            education_year: name_of(item, "educationYear").or_else(|| text(&item["year"])),
            amount,
            paid,
            debt,
        })
    }
}

/// One lesson in the timetable (`/education/schedule`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub subject: Option<String>,
    pub training_type: Option<String>,
    pub lesson_date: Option<i64>,
    pub pair: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub auditorium: Option<String>,
    pub employee: Option<String>,
}

impl FromRemote for ScheduleEntry {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        let pair = &item["lessonPair"];
        Some(Self {
            subject: name_of(item, "subject"),
            training_type: name_of(item, "trainingType"),
            lesson_date: int(&item["lesson_date"]),
            pair: text(&pair["name"]).or_else(|| text(&pair["code"])),
            start_time: text(&pair["start_time"]),
            end_time: text(&pair["end_time"]),
            auditorium: name_of(item, "auditorium"),
            employee: name_of(item, "employee"),
        })
    }
}

/// Semester (`/education/semesters`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Semester {
    pub id: Option<i64>,
    pub code: String,
    pub name: Option<String>,
    pub current: bool,
}

impl Semester {
    /// Numeric ordering key; non-numeric codes sort last
    pub fn ordinal(&self) -> i64 {
        self.code.parse().unwrap_or(0)
    }
}

impl FromRemote for Semester {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        let id = int(&item["id"]);
        let code = text(&item["code"]).or_else(|| id.map(|i| i.to_string()))?;
        Some(Self {
            id,
            code,
            name: text(&item["name"]),
            current: item["current"].as_bool().unwrap_or(false),
        })
    }
}

/// Structural department (`/data/department-list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    pub structure_type: Option<String>,
    pub parent_id: Option<i64>,
}

impl Department {
    pub fn is_faculty(&self) -> bool {
        self.structure_type.as_deref() == Some("Fakultet")
    }
}

impl FromRemote for Department {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        Some(Self {
            id: int(&item["id"])?,
            name: text(&item["name"])?,
            code: text(&item["code"]),
            structure_type: name_of(item, "structureType"),
            parent_id: id_of(item, "parent"),
        })
    }
}

/// Specialty (`/data/specialty-list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSpecialty {
    pub id: i64,
    pub code: Option<String>,
    pub name: String,
    /// Department id of the faculty
    pub faculty_id: Option<i64>,
}

impl FromRemote for RemoteSpecialty {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        Some(Self {
            id: int(&item["id"])?,
            code: text(&item["code"]),
            name: text(&item["name"])?,
            faculty_id: id_of(item, "department"),
        })
    }
}

/// Academic group (`/data/group-list`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteGroup {
    pub id: i64,
    pub name: String,
    pub faculty_id: Option<i64>,
    pub specialty_id: Option<i64>,
}

impl FromRemote for RemoteGroup {
    fn from_remote(item: &Value) -> Option<Self> {
        item.as_object()?;
        Some(Self {
            id: int(&item["id"])?,
            name: text(&item["name"])?,
            faculty_id: id_of(item, "department"),
            specialty_id: id_of(item, "specialty"),
        })
    }
}

/// Where a student stands with a survey
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    NotStarted,
    InProgress,
    Finished,
}

impl SurveyStatus {
    /// Key of the list holding surveys in this state (`/student/survey`)
    pub fn list_key(&self) -> &'static str {
        match self {
            SurveyStatus::NotStarted => "not_started",
            SurveyStatus::InProgress => "in_progress",
            SurveyStatus::Finished => "finished",
        }
    }
}

/// One survey offered to the student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    /// Quiz rule id; also what `survey-start` expects
    pub id: i64,
    pub title: Option<String>,
    pub status: SurveyStatus,
}

impl Survey {
    pub(crate) fn parse(item: &Value, status: SurveyStatus) -> Option<Self> {
        item.as_object()?;
        let rule = &item["quizRuleProjection"];
        Some(Self {
            id: int(&rule["id"]).or_else(|| int(&item["id"]))?,
            title: text(&rule["theme"]).or_else(|| text(&item["status"])),
            status,
        })
    }
}

/// String or number as a non-empty string
pub(crate) fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `item[key]` as a plain string or as `{ "name": ... }`
pub(crate) fn name_of(item: &Value, key: &str) -> Option<String> {
    let field = &item[key];
    text(&field["name"]).or_else(|| match field {
        Value::String(_) => text(field),
        _ => None,
    })
}

/// `item[key].id`, or `item[key]` when the remote sends the bare id
pub(crate) fn id_of(item: &Value, key: &str) -> Option<i64> {
    int(&item[key]["id"]).or_else(|| int(&item[key]))
}

/// `item[key].code`
pub(crate) fn code_of(item: &Value, key: &str) -> Option<String> {
    text(&item[key]["code"])
}
