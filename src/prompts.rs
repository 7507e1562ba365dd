//! Prompt for structured lab-report extraction.
//!
//! Kept in one place so tests can inspect the exact schema the service is
//! asked to produce. Callers can override the template via
//! [`crate::config::IngestConfig::extraction_prompt`]; it must contain the
//! `{pet_id}` placeholder.

/// Default extraction prompt. `{pet_id}` is replaced with the subject id.
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are an expert medical data extraction assistant.
Analyze the attached lab report text accurately.

Extract all medical tests, values, units, and reference ranges.
Group them by visit date.

Also include a 'notes' field with important warnings (max 150 chars).

Output must be ONLY a single valid JSON object. No markdown fences, no commentary.

Schema:
{
  "petId": {pet_id},
  "visits": [
    {
      "visit_date": "YYYY-MM-DD",
      "records": [
        {
          "test_name": "string",
          "value": "float or string",
          "unit": "string",
          "reference_range": "string"
        }
      ],
      "notes": "Note 1, Note 2, ..."
    }
  ]
}

If the visit date is not found, use "unknown"."#;

/// Render the extraction prompt for `pet_id`, using `template` when given.
pub fn extraction_prompt(template: Option<&str>, pet_id: i64) -> String {
    template
        .unwrap_or(DEFAULT_EXTRACTION_PROMPT)
        .replace("{pet_id}", &pet_id.to_string())
}
