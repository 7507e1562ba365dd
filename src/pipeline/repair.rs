//! Tolerant parsing of model output into a [`LabReport`].
//!
//! ## Why repair at all?
//!
//! Even with "output ONLY JSON" in the prompt, models wrap answers in
//! ```` ```json ```` fences, leave trailing commas, or stop mid-object when
//! they hit the token limit. The parser gives each response two chances:
//!
//! 1. strip one outer code fence, then a strict `serde_json` parse
//! 2. one structural repair pass over the text, then a second strict parse
//!
//! The result is a tagged [`ParseOutcome`] rather than an error so callers
//! decide whether an unparsable answer is fatal.
//!
//! ## Repair rules
//!
//! Applied in a single left-to-right scan that tracks string state and a
//! stack of open brackets:
//!
//! - prose before the first `{` or `[` is dropped
//! - a comma directly before `}` or `]` is removed
//! - content after the first complete top-level value is dropped
//! - at end of input an open string is closed, a dangling key or comma is
//!   removed, and open brackets are closed in reverse order

use crate::error::SchemaError;
use crate::model::LabReport;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Result of parsing one model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(LabReport),
    Unparsable(String),
}

impl ParseOutcome {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }

    pub fn into_result(self) -> Result<LabReport, SchemaError> {
        match self {
            ParseOutcome::Parsed(report) => Ok(report),
            ParseOutcome::Unparsable(reason) => Err(SchemaError::Unparsable { reason }),
        }
    }
}

/// Parse a raw (already sanitised) model response.
pub fn parse_response(raw: &str) -> ParseOutcome {
    let text = strip_code_fence(raw);

    let strict_err = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => return to_report(value),
        Err(e) => e,
    };
    debug!("Strict parse failed ({}); attempting repair", strict_err);

    let Some(repaired) = repair_json(&text) else {
        return ParseOutcome::Unparsable(format!(
            "no JSON object found in response ({strict_err})"
        ));
    };

    match serde_json::from_str::<serde_json::Value>(&repaired) {
        Ok(value) => to_report(value),
        Err(e) => ParseOutcome::Unparsable(format!(
            "strict parse: {strict_err}; after repair: {e}"
        )),
    }
}

fn to_report(value: serde_json::Value) -> ParseOutcome {
    if !value.is_object() {
        return ParseOutcome::Unparsable(format!(
            "expected a JSON object, found {}",
            json_kind(&value)
        ));
    }
    match serde_json::from_value::<LabReport>(value) {
        Ok(report) => ParseOutcome::Parsed(report),
        Err(e) => ParseOutcome::Unparsable(format!("JSON does not match the visit schema: {e}")),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

// ── Fence stripping ──────────────────────────────────────────────────────

static RE_FENCED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_+-]*[ \t]*\n?(.*?)\n?[ \t]*```\s*$").unwrap());

static RE_OPEN_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_+-]*[ \t]*\n?").unwrap());

/// Remove one outer code fence (with optional language tag).
///
/// Only applies when the text starts with a fence marker. An unclosed
/// opening fence (truncated output) is stripped on its own.
pub(crate) fn strip_code_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    if let Some(caps) = RE_FENCED.captures(trimmed) {
        return caps[1].trim().to_string();
    }
    RE_OPEN_FENCE.replace(trimmed, "").trim().to_string()
}

// ── Structural repair ────────────────────────────────────────────────────

/// One structural repair pass. `None` when the text holds no `{` or `[`.
pub(crate) fn repair_json(input: &str) -> Option<String> {
    let start = input.find(['{', '['])?;
    let mut out = String::with_capacity(input.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input[start..].chars() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                stack.push('}');
                out.push(c);
            }
            '[' => {
                stack.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if stack.last() != Some(&c) {
                    // Stray closer; dropping it keeps the rest balanced.
                    continue;
                }
                stack.pop();
                strip_trailing_comma(&mut out);
                out.push(c);
                if stack.is_empty() {
                    // First complete top-level value; the rest is noise.
                    return Some(out);
                }
            }
            _ => out.push(c),
        }
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }

    close_dangling(&mut out);
    while let Some(closer) = stack.pop() {
        strip_trailing_comma(&mut out);
        out.push(closer);
    }
    Some(out)
}

fn strip_trailing_comma(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    }
}

/// Drop a trailing comma, or a key whose value never arrived.
fn close_dangling(out: &mut String) {
    strip_trailing_comma(out);
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if !out.ends_with(':') {
        return;
    }
    out.pop();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    // Remove the key string itself.
    if out.ends_with('"') {
        if let Some(open) = out[..out.len() - 1].rfind('"') {
            out.truncate(open);
        }
    }
    strip_trailing_comma(out);
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = r#"{"petId": 1, "visits": [{"visit_date": "2024-01-05", "records": [{"test_name": "Glucose", "value": "95", "unit": "mg/dL", "reference_range": "70-110"}], "notes": ""}]}"#;

    fn parsed(raw: &str) -> LabReport {
        match parse_response(raw) {
            ParseOutcome::Parsed(r) => r,
            ParseOutcome::Unparsable(reason) => panic!("expected parse, got: {reason}"),
        }
    }

    #[test]
    fn fenced_response_equals_unwrapped() {
        let fenced = format!("```json\n{PAYLOAD}\n```");
        assert_eq!(parsed(&fenced), parsed(PAYLOAD));

        let bare_fence = format!("```\n{PAYLOAD}\n```\n");
        assert_eq!(parsed(&bare_fence), parsed(PAYLOAD));
    }

    #[test]
    fn trailing_comma_is_repaired() {
        let raw = r#"{"petId": 1, "visits": [{"visit_date": "2024-01-05", "records": [], "notes": "ok"},]}"#;
        let report = parsed(raw);
        assert_eq!(report.visits.len(), 1);
        assert_eq!(report.visits[0].notes, "ok");
    }

    #[test]
    fn truncated_response_is_closed() {
        let raw = r#"{"petId": 1, "visits": [{"visit_date": "2024-01-05", "records": [{"test_name": "Glucose", "value": "95", "unit": "mg/d"#;
        let report = parsed(raw);
        assert_eq!(report.visits[0].records[0].unit, "mg/d");
        assert_eq!(report.visits[0].records[0].reference_range, "");
    }

    #[test]
    fn prose_and_trailing_chatter_dropped() {
        let raw = format!("Here is the data you asked for:\n{PAYLOAD}\nLet me know if you need more.");
        assert_eq!(parsed(&raw), parsed(PAYLOAD));
    }

    #[test]
    fn dangling_key_is_removed() {
        let repaired = repair_json(r#"{"petId": 3, "visits": [{"visit_date":"#).unwrap();
        assert_eq!(repaired, r#"{"petId": 3, "visits": [{}]}"#);
    }

    #[test]
    fn no_structure_is_unparsable() {
        let outcome = parse_response("I could not find any lab results in this document.");
        assert!(matches!(outcome, ParseOutcome::Unparsable(_)));
        assert!(matches!(
            outcome.into_result(),
            Err(SchemaError::Unparsable { .. })
        ));
    }

    #[test]
    fn unrecoverable_structure_is_unparsable() {
        let raw = r#"{"petId": 1, "visits": [{"visit_date" "2024-01-05""#;
        assert!(!parse_response(raw).is_parsed());
    }

    #[test]
    fn null_or_textual_pet_id_still_parses() {
        let raw = r#"{"petId": null, "visits": [{"visit_date": "2024-01-05", "records": []}]}"#;
        let report = parsed(raw);
        assert_eq!(report.pet_id, 0);
        assert_eq!(report.visits.len(), 1);

        let raw = r#"```json
{"petId": "12", "visits": []}
```"#;
        assert_eq!(parsed(raw).pet_id, 12);
    }

    #[test]
    fn top_level_array_rejected() {
        let outcome = parse_response(r#"[{"visit_date": "2024-01-05"}]"#);
        match outcome {
            ParseOutcome::Unparsable(reason) => assert!(reason.contains("array"), "{reason}"),
            other => panic!("expected Unparsable, got {other:?}"),
        }
    }

    #[test]
    fn escaped_quotes_survive_repair() {
        let raw = r#"{"petId": 1, "visits": [{"visit_date": "unknown", "notes": "said \"fasting\"",}]}"#;
        let report = parsed(raw);
        assert_eq!(report.visits[0].notes, r#"said "fasting""#);
    }

    #[test]
    fn unclosed_fence_is_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }
}
