use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Descriptor length produced by the face recognition network.
pub const EMBEDDING_DIM: usize = 128;

/// Wall-clock instant carrying the offset it was observed in.
///
/// The offset decides which calendar day an attendance event lands on.
pub type Timestamp = DateTime<FixedOffset>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidEmbedding {
    #[error("expected {expected}-dim embedding, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("embedding element {index} is not a number")]
    NonNumeric { index: usize },
    #[error("embedding element {index} is not finite")]
    NonFinite { index: usize },
    #[error("unparseable embedding: {0}")]
    Unparseable(String),
}

/// Bounding box of a detected face, in source frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Face descriptor of exactly [`EMBEDDING_DIM`] finite values.
///
/// The only way to obtain one is through validation, so every
/// `Embedding` in the core is known to be well-formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Result<Self, InvalidEmbedding> {
        if values.len() != EMBEDDING_DIM {
            return Err(InvalidEmbedding::WrongLength {
                expected: EMBEDDING_DIM,
                got: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(InvalidEmbedding::NonFinite { index });
        }
        Ok(Self { values })
    }

    /// Resolve a stored vector into an `Embedding`.
    ///
    /// Accepts a JSON array of numbers, a string holding such an array,
    /// or a comma-separated string of numbers.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, InvalidEmbedding> {
        match value {
            serde_json::Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    let v = item.as_f64().ok_or(InvalidEmbedding::NonNumeric { index })?;
                    values.push(v as f32);
                }
                Self::new(values)
            }
            serde_json::Value::String(text) => Self::parse_text(text),
            other => Err(InvalidEmbedding::Unparseable(format!(
                "expected array or string, got {}",
                json_kind(other)
            ))),
        }
    }

    fn parse_text(text: &str) -> Result<Self, InvalidEmbedding> {
        let trimmed = text.trim();
        if trimmed.starts_with('[') {
            let value: serde_json::Value = serde_json::from_str(trimmed)
                .map_err(|e| InvalidEmbedding::Unparseable(e.to_string()))?;
            return match value {
                serde_json::Value::Array(_) => Self::from_json(&value),
                _ => Err(InvalidEmbedding::Unparseable("nested string".into())),
            };
        }

        let mut values = Vec::with_capacity(EMBEDDING_DIM);
        for (index, part) in trimmed.split(',').enumerate() {
            let v: f32 = part
                .trim()
                .parse()
                .map_err(|_| InvalidEmbedding::NonNumeric { index })?;
            values.push(v);
        }
        Self::new(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Embedding {
    type Error = InvalidEmbedding;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Embedding> for Vec<f32> {
    fn from(embedding: Embedding) -> Self {
        embedding.values
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Subject record as yielded by a gallery source, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSubject {
    pub id: String,
    pub embedding: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A known individual with a validated reference embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: String,
    pub embedding: Embedding,
    /// Display fields; opaque to the core.
    pub metadata: serde_json::Value,
}

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Nearest subject, present only when the match was accepted.
    pub subject_id: Option<String>,
    /// Euclidean distance to the nearest subject; infinite for an empty gallery.
    pub distance: f32,
    pub accepted: bool,
}

/// Which write-once field of the day's record an event targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[serde(alias = "in")]
    Arrival,
    #[serde(alias = "out")]
    Departure,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Arrival => "arrival",
            EventKind::Departure => "departure",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" | "in" | "time-in" => Ok(EventKind::Arrival),
            "departure" | "out" | "time-out" => Ok(EventKind::Departure),
            other => Err(format!("unknown event kind '{other}' (expected arrival or departure)")),
        }
    }
}

/// Lifecycle of a (subject, date) attendance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    NoRecord,
    TimeInOnly,
    TimeOutOnly,
    Complete,
}

impl RecordState {
    pub fn of(record: Option<&AttendanceRecord>) -> Self {
        match record {
            None => RecordState::NoRecord,
            Some(r) => match (r.time_in.is_some(), r.time_out.is_some()) {
                (true, true) => RecordState::Complete,
                (true, false) => RecordState::TimeInOnly,
                (false, true) => RecordState::TimeOutOnly,
                // A stored row always has one field set; treat a blank row as absent.
                (false, false) => RecordState::NoRecord,
            },
        }
    }

    /// Whether the field targeted by `kind` is still writable in this state.
    pub fn accepts(&self, kind: EventKind) -> bool {
        match (self, kind) {
            (RecordState::NoRecord, _) => true,
            (RecordState::TimeInOnly, EventKind::Departure) => true,
            (RecordState::TimeOutOnly, EventKind::Arrival) => true,
            _ => false,
        }
    }
}

/// One subject's attendance for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub subject_id: String,
    pub date: NaiveDate,
    pub time_in: Option<Timestamp>,
    pub time_out: Option<Timestamp>,
}

impl AttendanceRecord {
    pub fn state(&self) -> RecordState {
        RecordState::of(Some(self))
    }
}

/// Result of a ledger write attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Recorded,
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis(index: usize, value: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[index] = value;
        v
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = Embedding::new(vec![0.0; 127]).unwrap_err();
        assert_eq!(
            err,
            InvalidEmbedding::WrongLength {
                expected: 128,
                got: 127
            }
        );
    }

    #[test]
    fn test_new_rejects_nan() {
        let mut v = vec![0.0; EMBEDDING_DIM];
        v[5] = f32::NAN;
        assert_eq!(Embedding::new(v).unwrap_err(), InvalidEmbedding::NonFinite { index: 5 });
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(axis(0, 3.0)).unwrap();
        let b = Embedding::new(axis(1, 4.0)).unwrap();
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_from_json_array() {
        let value = serde_json::json!(axis(2, 0.25));
        let e = Embedding::from_json(&value).unwrap();
        assert_eq!(e.values()[2], 0.25);
    }

    #[test]
    fn test_from_json_rejects_non_numeric_element() {
        let mut items: Vec<serde_json::Value> =
            axis(0, 1.0).into_iter().map(|v| v.into()).collect();
        items[7] = serde_json::json!("x");
        let err = Embedding::from_json(&serde_json::Value::Array(items)).unwrap_err();
        assert_eq!(err, InvalidEmbedding::NonNumeric { index: 7 });
    }

    #[test]
    fn test_from_json_string_encodings() {
        let values = axis(3, 0.5);
        let as_json_text = serde_json::to_string(&values).unwrap();
        let as_csv = values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(",");

        let a = Embedding::from_json(&serde_json::Value::String(as_json_text)).unwrap();
        let b = Embedding::from_json(&serde_json::Value::String(as_csv)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.values()[3], 0.5);
    }

    #[test]
    fn test_from_json_rejects_object() {
        let err = Embedding::from_json(&serde_json::json!({"a": 1})).unwrap_err();
        assert!(matches!(err, InvalidEmbedding::Unparseable(_)));
    }

    #[test]
    fn test_serde_validates_length() {
        assert!(serde_json::from_str::<Embedding>("[1.0, 2.0]").is_err());
        let ok = serde_json::to_string(&axis(0, 1.0)).unwrap();
        assert!(serde_json::from_str::<Embedding>(&ok).is_ok());
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("in".parse::<EventKind>().unwrap(), EventKind::Arrival);
        assert_eq!("Departure".parse::<EventKind>().unwrap(), EventKind::Departure);
        assert!("lunch".parse::<EventKind>().is_err());
        let k: EventKind = serde_json::from_str("\"out\"").unwrap();
        assert_eq!(k, EventKind::Departure);
    }

    #[test]
    fn test_record_state_transitions() {
        assert!(RecordState::NoRecord.accepts(EventKind::Arrival));
        assert!(RecordState::NoRecord.accepts(EventKind::Departure));
        assert!(!RecordState::TimeInOnly.accepts(EventKind::Arrival));
        assert!(RecordState::TimeInOnly.accepts(EventKind::Departure));
        assert!(RecordState::TimeOutOnly.accepts(EventKind::Arrival));
        assert!(!RecordState::Complete.accepts(EventKind::Arrival));
        assert!(!RecordState::Complete.accepts(EventKind::Departure));
    }
}
