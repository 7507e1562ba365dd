//! Progress-callback trait for pipeline stage events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::IngestConfigBuilder::progress_callback`] to receive
//! events as a document moves through the pipeline. The library knows nothing
//! about how the host reports progress; the CLI drives a spinner with it.
//!
//! # Example
//!
//! ```rust
//! use labsift::{IngestConfig, IngestProgressCallback, Stage};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct OcrCounter {
//!     pages: AtomicUsize,
//! }
//!
//! impl IngestProgressCallback for OcrCounter {
//!     fn on_ocr_page(&self, page_num: usize, total_pages: usize) {
//!         self.pages.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("OCR page {}/{}", page_num, total_pages);
//!     }
//! }
//!
//! let counter = Arc::new(OcrCounter { pages: AtomicUsize::new(0) });
//! let config = IngestConfig::builder()
//!     .progress_callback(counter as Arc<dyn IngestProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::fmt;
use std::sync::Arc;

/// The stages of one ingestion run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    TextExtraction,
    StructuredExtraction,
    Parsing,
    Artifact,
    Persistence,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::TextExtraction => "text extraction",
            Stage::StructuredExtraction => "structured extraction",
            Stage::Parsing => "parsing",
            Stage::Artifact => "audit artifact",
            Stage::Persistence => "persistence",
        };
        f.write_str(name)
    }
}

/// Called by the pipeline as it processes a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Implementations must be `Send + Sync`; OCR events
/// arrive from a blocking worker thread.
pub trait IngestProgressCallback: Send + Sync {
    /// Called when a stage begins.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// Called when a stage finishes successfully.
    ///
    /// # Arguments
    /// * `stage`      : the finished stage
    /// * `duration_ms`: wall-clock time spent in the stage
    fn on_stage_complete(&self, stage: Stage, duration_ms: u64) {
        let _ = (stage, duration_ms);
    }

    /// Called after each page is recognised on the OCR fallback path.
    ///
    /// # Arguments
    /// * `page_num`   : 1-indexed page number
    /// * `total_pages`: pages in the document
    fn on_ocr_page(&self, page_num: usize, total_pages: usize) {
        let _ = (page_num, total_pages);
    }

    /// Called when a visit is skipped because an identical lab already exists.
    fn on_visit_skipped(&self, visit_index: usize, visit_date: &str) {
        let _ = (visit_index, visit_date);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::IngestConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;
