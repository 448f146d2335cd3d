/// Weighted GPA on the 5-point scale and per-exam grade breakdown
use crate::remote::{Semester, SubjectRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lower bounds of the 100-point bands mapped to 5, 4 and 3 points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradeScale {
    pub excellent: f64,
    pub good: f64,
    pub satisfactory: f64,
}

impl Default for GradeScale {
    fn default() -> Self {
        Self {
            excellent: 86.0,
            good: 71.0,
            satisfactory: 56.0,
        }
    }
}

impl GradeScale {
    /// Grade points for an overall score.
    ///
    /// Scores in (0, 5] are already points; anything else is read as a 100-point score.
    pub fn points(&self, score: f64) -> f64 {
        if score > 0.0 && score <= 5.0 {
            return score;
        }
        if score >= self.excellent {
            5.0
        } else if score >= self.good {
            4.0
        } else if score >= self.satisfactory {
            3.0
        } else {
            2.0
        }
    }
}

/// Which attempt of a retaken subject counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetakePolicy {
    #[default]
    Latest,
    Best,
}

/// Why a subject was left out of the GPA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    NoCredits,
    InProgress,
}

/// One subject's contribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpaLine {
    pub name: String,
    pub credit: f64,
    pub score: f64,
    pub points: f64,
    pub excluded: Option<Exclusion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpaResult {
    /// Rounded to two decimals; `None` when no subject carries credit
    pub gpa: Option<f64>,
    pub total_credits: f64,
    pub total_points: f64,
    pub lines: Vec<GpaLine>,
}

/// Credit-weighted GPA
pub fn weighted_gpa(subjects: &[SubjectRecord], scale: &GradeScale, exclude_in_progress: bool) -> GpaResult {
    let mut total_credits = 0.0;
    let mut total_points = 0.0;

    let lines = subjects
        .iter()
        .map(|subject| {
            let points = scale.points(subject.overall_score);
            let excluded = if subject.credit <= 0.0 {
                Some(Exclusion::NoCredits)
            } else if exclude_in_progress && subject.overall_score == 0.0 {
                Some(Exclusion::InProgress)
            } else {
                None
            };

            if excluded.is_none() {
                total_credits += subject.credit;
                total_points += points * subject.credit;
            }

            GpaLine {
                name: subject.name.clone(),
                credit: subject.credit,
                score: subject.overall_score,
                points,
                excluded,
            }
        })
        .collect();

    let gpa = (total_credits > 0.0).then(|| round2(total_points / total_credits));
    GpaResult {
        gpa,
        total_credits,
        total_points,
        lines,
    }
}

/// GPA across semesters, counting each retaken subject once
pub fn cumulative_gpa(subjects: &[SubjectRecord], scale: &GradeScale, policy: RetakePolicy) -> GpaResult {
    let mut chosen: HashMap<&str, &SubjectRecord> = HashMap::new();

    for subject in subjects {
        let Some(key) = subject.subject_id.as_deref() else {
            continue;
        };
        let replace = match chosen.get(key) {
            None => true,
            Some(current) => match policy {
                RetakePolicy::Latest => semester_ordinal(subject) > semester_ordinal(current),
                RetakePolicy::Best => scale.points(subject.overall_score) > scale.points(current.overall_score),
            },
        };
        if replace {
            chosen.insert(key, subject);
        }
    }

    let mut picked: Vec<SubjectRecord> = chosen.into_values().cloned().collect();
    picked.sort_by(|a, b| a.name.cmp(&b.name));
    weighted_gpa(&picked, scale, true)
}

fn semester_ordinal(subject: &SubjectRecord) -> i64 {
    subject
        .semester_code
        .as_deref()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0)
}

/// Semester whose GPA is reported: the latest one, or the one before it when the
/// latest has no graded credits yet. `semesters` is ordered latest first.
pub fn reporting_semester<'a>(semesters: &'a [Semester], latest_gpa: Option<f64>) -> Option<&'a Semester> {
    match latest_gpa {
        Some(gpa) if gpa > 0.0 => semesters.first(),
        _ => semesters.get(1).or_else(|| semesters.first()),
    }
}

/// Exam grades of one subject, by exam type, converted to the 5-point scale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExamBreakdown {
    /// Current control
    pub jn: Option<ExamGrade>,
    /// Midterm
    pub on: Option<ExamGrade>,
    /// Final
    pub yn: Option<ExamGrade>,
    /// Sum of raw grades of every exam, known type or not
    pub raw_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamGrade {
    pub name: Option<String>,
    pub raw: f64,
    pub max: f64,
    pub five_scale: f64,
}

pub fn parse_exam_grades(subject: &SubjectRecord) -> ExamBreakdown {
    let mut breakdown = ExamBreakdown::default();

    for exam in &subject.exams {
        breakdown.raw_total += exam.grade;

        let grade = ExamGrade {
            name: exam.exam_type_name.clone(),
            raw: exam.grade,
            max: exam.max_ball,
            five_scale: to_five_scale(exam.grade, exam.max_ball),
        };
        match exam.exam_type_code.as_str() {
            "11" | "15" => breakdown.jn = Some(grade),
            "12" => breakdown.on = Some(grade),
            "13" => breakdown.yn = Some(grade),
            _ => {}
        }
    }

    breakdown
}

fn to_five_scale(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        0.0
    } else if max <= 5.0 {
        value.round()
    } else {
        (value / max * 5.0).round()
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
