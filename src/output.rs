//! Results returned by the pipeline entry points.

use crate::model::LabReport;
use crate::pipeline::ingest::IngestSummary;
use crate::pipeline::text::ExtractionMethod;
use serde::Serialize;
use std::path::PathBuf;

/// Result of [`crate::Pipeline::process_document`].
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutput {
    /// The parsed report. `pet_id` always equals the submitted subject id.
    pub report: LabReport,
    /// Canonical path of the audit artifact; also each lab's `source_path`.
    pub artifact_path: PathBuf,
    /// Labs written and visits skipped.
    pub summary: IngestSummary,
    pub stats: IngestStats,
}

/// Timing and size figures for one ingestion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub page_count: usize,
    /// `None` when the run started from an existing artifact.
    pub extraction_method: Option<ExtractionMethod>,
    pub text_chars: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Retries spent on the structured-extraction call.
    pub retries: u32,
    pub visits: usize,
    pub text_duration_ms: u64,
    pub llm_duration_ms: u64,
    pub persist_duration_ms: u64,
    pub total_duration_ms: u64,
}
