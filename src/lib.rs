//! # labsift
//!
//! Ingest PDF lab reports into deduplicated clinical records.
//!
//! ## Why this crate?
//!
//! Lab reports arrive as PDFs from dozens of different practice systems:
//! some with a clean text layer, some as phone scans. Hand-written parsers
//! per layout do not scale. Instead this crate pulls whatever text the PDF
//! holds (OCR when there is none), asks a language model to map it onto one
//! fixed visit/record schema, repairs the usual formatting slips in the
//! answer, and stores each visit exactly once, no matter how often the same
//! report is uploaded.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes
//!  │
//!  ├─ 1. Text      pdfium text layer, or render + tesseract per page
//!  ├─ 2. Extract   staged upload + schema prompt → Gemini / OpenAI / …
//!  ├─ 3. Repair    strip fences, strict parse, one repair pass
//!  ├─ 4. Artifact  <content_dir>/<pet>/<file>.json (atomic write)
//!  └─ 5. Ingest    one transaction per document, duplicates skipped
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use labsift::{IngestConfig, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Service picked from GOOGLE_API_KEY, EDGEQUAKE_LLM_PROVIDER or OPENAI_API_KEY
//!     let pipeline = Pipeline::open(IngestConfig::builder().with_env().build()?)?;
//!     let bytes = std::fs::read("report.pdf")?;
//!     let output = pipeline.process_document(&bytes, 1, "report.pdf").await?;
//!     for lab in &output.summary.inserted {
//!         println!("{:?}: {} tests", lab.lab.visit_date, lab.tests.len());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `labsift` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! labsift = { version = "0.3", default-features = false }
//! ```
//!
//! ## External tools
//!
//! - **pdfium** shared library: found via `pdfium_library_path` (filled from
//!   `PDFIUM_DYNAMIC_LIB_PATH` by `with_env`), next to the executable, or
//!   system paths.
//! - **tesseract**: only needed for scanned documents.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{IngestConfig, IngestConfigBuilder};
pub use convert::Pipeline;
pub use error::{DocumentError, ExtractionError, IngestError, PersistenceError, SchemaError};
pub use model::{Lab, LabReport, LabTest, LabWithTests, TestRecord, Visit};
pub use output::{IngestOutput, IngestStats};
pub use pipeline::ingest::{DeduplicatingIngestor, IngestSummary, SkipReason, SkippedVisit};
pub use pipeline::llm::StructuredExtractionClient;
pub use pipeline::repair::{parse_response, ParseOutcome};
pub use pipeline::service::InferenceService;
pub use pipeline::text::{DocumentTextExtractor, ExtractionMethod, TextExtraction};
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback, Stage};
pub use store::{LabStore, SqliteLabStore};
