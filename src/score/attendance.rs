/// Missed-hour totals from attendance records
use crate::remote::AttendanceRecord;
use serde::{Deserialize, Serialize};

/// Which absences count as excused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendancePolicy {
    /// Absence status codes that are excused regardless of the flag
    pub excused_codes: Vec<String>,
    /// Lowercase fragments of status names that mark an excused absence
    pub excused_keywords: Vec<String>,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self {
            excused_codes: vec!["11".to_string(), "13".to_string()],
            excused_keywords: ["sababli", "kasallik", "ruxsat", "xizmat"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Missed hours split by excuse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceTotals {
    pub total: i64,
    pub excused: i64,
    pub unexcused: i64,
}

impl AttendancePolicy {
    pub fn is_excused(&self, record: &AttendanceRecord) -> bool {
        if record.explicable {
            return true;
        }

        let by_code = record
            .absent_status_code
            .as_deref()
            .map_or(false, |code| self.excused_codes.iter().any(|c| c == code));

        let by_name = record.absent_status_name.as_deref().map_or(false, |name| {
            let name = name.to_lowercase();
            self.excused_keywords.iter().any(|k| name.contains(k.as_str()))
        });

        by_code || by_name
    }

    pub fn totals(&self, records: &[AttendanceRecord]) -> AttendanceTotals {
        records
            .iter()
            .fold(AttendanceTotals::default(), |mut totals, record| {
                totals.total += record.hour;
                if self.is_excused(record) {
                    totals.excused += record.hour;
                } else {
                    totals.unexcused += record.hour;
                }
                totals
            })
    }
}
