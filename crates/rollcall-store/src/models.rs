use chrono::NaiveDate;
use rollcall_core::Timestamp;
use serde::{Deserialize, Serialize};

/// Registered subject's display fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectProfile {
    pub subject_id: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub year_level: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl SubjectProfile {
    pub fn new(subject_id: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            middle_name: None,
            course: None,
            year_level: None,
            section: None,
            email: None,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// One line of an attendance report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    pub subject_id: String,
    pub first_name: String,
    pub last_name: String,
    pub date: NaiveDate,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
    /// Free-form status set by an operator (e.g. "excused").
    pub status: Option<String>,
    pub remarks: Option<String>,
}
