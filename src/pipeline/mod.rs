//! Pipeline stages for lab-report ingestion.
//!
//! Each submodule implements one step, testable on its own through the
//! traits at its seams ([`text::PdfBackend`], [`text::OcrEngine`],
//! [`service::InferenceService`], [`crate::store::LabStore`]).
//!
//! ## Data Flow
//!
//! ```text
//! text ──▶ llm ──▶ repair ──▶ artifact ──▶ ingest
//! (pdfium/   (service)  (JSON fix)  (audit file)  (dedup + SQLite)
//!  tesseract)
//! ```
//!
//! 1. [`text`]    : native text layer, falling back to [`render`] + [`ocr`]
//! 2. [`llm`]     : staged upload, prompt, timeout/retry, artifact cleanup;
//!    the only stage with network I/O (through [`service`])
//! 3. [`repair`]  : fence stripping, strict parse, one repair pass
//! 4. [`artifact`]: atomic pretty-JSON audit file
//! 5. [`ingest`]  : date normalisation, content hash, one transaction per
//!    document

pub mod artifact;
pub mod ingest;
pub mod llm;
pub mod ocr;
pub mod render;
pub mod repair;
pub mod service;
pub mod text;
