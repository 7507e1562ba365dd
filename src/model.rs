//! Domain types: the transient extraction schema and the persisted rows.
//!
//! The transient side ([`LabReport`], [`Visit`], [`TestRecord`]) mirrors the
//! JSON the extraction service is asked to produce. Deserialisation is
//! deliberately lenient about *types* (numbers where strings were asked for,
//! `null` for empty fields, `null` entries in arrays) because the producer is
//! a language model, but it is strict about *shape*: a `visits` value that is
//! not an array is an error.
//!
//! The persisted side ([`Lab`], [`LabTest`]) mirrors the `labs` and
//! `lab_tests` tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Sentinel used by the extraction schema when no visit date is determinable.
pub const UNKNOWN_DATE: &str = "unknown";

/// Upper bound on the length of a visit's free-text notes, in characters.
pub const MAX_NOTES_CHARS: usize = 150;

/// The structured object produced by extraction and written as the audit artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabReport {
    /// Echo of the subject id. The caller's id replaces it before use.
    #[serde(rename = "petId", default, deserialize_with = "lenient_id")]
    pub pet_id: i64,
    #[serde(default, deserialize_with = "skip_null_entries")]
    pub visits: Vec<Visit>,
}

/// One clinical encounter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visit {
    /// `YYYY-MM-DD` or [`UNKNOWN_DATE`]. Validated at ingestion, not here.
    #[serde(default = "unknown_date", deserialize_with = "visit_date_or_unknown")]
    pub visit_date: String,
    #[serde(default, deserialize_with = "skip_null_entries")]
    pub records: Vec<TestRecord>,
    #[serde(default, deserialize_with = "bounded_notes")]
    pub notes: String,
}

/// A single named measurement.
///
/// `value` is numeric-or-text in the source; numbers and booleans are kept in
/// their JSON textual form so `95` and `"95"` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub test_name: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub value: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub unit: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub reference_range: String,
}

impl TestRecord {
    pub fn new(
        test_name: impl Into<String>,
        value: impl Into<String>,
        unit: impl Into<String>,
        reference_range: impl Into<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            value: value.into(),
            unit: unit.into(),
            reference_range: reference_range.into(),
        }
    }
}

/// A persisted lab: one visit of one subject from one source artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lab {
    pub id: i64,
    pub pet_id: i64,
    /// `None` means the visit date was unknown.
    pub visit_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
    pub source_path: String,
}

/// A persisted measurement row owned by a [`Lab`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabTest {
    pub id: i64,
    pub lab_id: i64,
    pub test_name: String,
    pub value: String,
    pub unit: String,
    pub reference_range: String,
}

/// A lab together with its measurement rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabWithTests {
    #[serde(flatten)]
    pub lab: Lab,
    pub tests: Vec<LabTest>,
}

/// Lab row about to be inserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLab {
    pub pet_id: i64,
    pub visit_date: Option<NaiveDate>,
    pub content_hash: String,
    pub source_path: String,
}

// ── Lenient deserialisers ────────────────────────────────────────────────

fn unknown_date() -> String {
    UNKNOWN_DATE.to_string()
}

fn skip_null_entries<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let items: Option<Vec<Option<T>>> = Option::deserialize(deserializer)?;
    Ok(items.unwrap_or_default().into_iter().flatten().collect())
}

fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

/// Integer, integral float or numeric string; anything else reads as 0.
fn lenient_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let id = match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    };
    Ok(id.unwrap_or_default())
}

fn visit_date_or_unknown<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = scalar_as_string(deserializer)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        Ok(unknown_date())
    } else {
        Ok(trimmed.to_string())
    }
}

fn bounded_notes<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let notes = scalar_as_string(deserializer)?;
    Ok(truncate_chars(notes.trim(), MAX_NOTES_CHARS))
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_become_text() {
        let json = r#"{"test_name":"Glucose","value":95,"unit":"mg/dL","reference_range":null}"#;
        let rec: TestRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.value, "95");
        assert_eq!(rec.reference_range, "");
    }

    #[test]
    fn missing_date_defaults_to_unknown() {
        let visit: Visit = serde_json::from_str(r#"{"records":[]}"#).unwrap();
        assert_eq!(visit.visit_date, UNKNOWN_DATE);

        let visit: Visit = serde_json::from_str(r#"{"visit_date":null}"#).unwrap();
        assert_eq!(visit.visit_date, UNKNOWN_DATE);
    }

    #[test]
    fn null_entries_are_skipped() {
        let json = r#"{"petId":3,"visits":[null,{"visit_date":"2024-02-02","records":[null,{"test_name":"ALT","value":"40","unit":"U/L","reference_range":"10-100"}]}]}"#;
        let report: LabReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.visits.len(), 1);
        assert_eq!(report.visits[0].records.len(), 1);
        assert_eq!(report.visits[0].records[0].test_name, "ALT");
    }

    #[test]
    fn pet_id_is_lenient() {
        for (raw, expected) in [
            ("null", 0),
            ("7", 7),
            ("7.0", 7),
            (r#""7""#, 7),
            (r#"" 12 ""#, 12),
            (r#""unknown""#, 0),
            ("7.5", 0),
            ("{}", 0),
        ] {
            let json = format!(r#"{{"petId":{raw},"visits":[]}}"#);
            let report: LabReport = serde_json::from_str(&json).unwrap();
            assert_eq!(report.pet_id, expected, "petId {raw}");
        }
        let report: LabReport = serde_json::from_str(r#"{"visits":[]}"#).unwrap();
        assert_eq!(report.pet_id, 0);
    }

    #[test]
    fn visits_must_be_an_array() {
        let result: Result<LabReport, _> = serde_json::from_str(r#"{"petId":1,"visits":"none"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn notes_are_bounded() {
        let long = "é".repeat(400);
        let json = format!(r#"{{"visit_date":"2024-01-01","notes":"{long}"}}"#);
        let visit: Visit = serde_json::from_str(&json).unwrap();
        assert_eq!(visit.notes.chars().count(), MAX_NOTES_CHARS);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
