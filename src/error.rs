//! Error types for the labsift library.
//!
//! Each pipeline stage owns one error enum so callers can tell *where* an
//! ingestion failed without string matching:
//!
//! * [`DocumentError`]: the uploaded bytes could not be read as a document
//!   (not a PDF, corrupt, encrypted) or OCR could not run.
//! * [`ExtractionError`]: the structured-extraction service was unreachable
//!   or returned an error. Only [`ExtractionError::is_transient`] failures are
//!   retried.
//! * [`SchemaError`]: the service answered, but the answer could not be
//!   turned into visits (unparseable JSON after repair, bad visit date).
//! * [`PersistenceError`]: the database rejected the write.
//!
//! [`IngestError`] wraps all four and is what the top-level entry points
//! return.

use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors returned by the ingestion entry points.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The structured JSON audit file could not be written.
    #[error("Failed to write audit artifact '{path}': {source}")]
    ArtifactWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal error (task panic, runtime creation).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The document could not be opened, rendered or recognised.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Document is empty (0 bytes)")]
    Empty,

    #[error("Document is {size} bytes, above the {limit}-byte upload limit")]
    TooLarge { size: usize, limit: usize },

    #[error("Document is not a PDF\nFirst bytes: {magic:?}")]
    NotAPdf { magic: Vec<u8> },

    /// Header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF is corrupt: {detail}")]
    Corrupt { detail: String },

    #[error("PDF is encrypted and requires a password")]
    PasswordProtected,

    /// pdfium returned an error for a specific page (1-indexed).
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_DYNAMIC_LIB_PATH=/path/to/libpdfium or pass --pdfium-lib."
    )]
    PdfiumBindingFailed(String),

    /// The OCR executable could not be started or exited with an error.
    #[error("OCR failed on page {page}: {detail}\nCheck that tesseract is installed or pass --tesseract.")]
    Ocr { page: usize, detail: String },

    #[error("I/O error while staging page images: {0}")]
    Io(#[from] std::io::Error),
}

/// The structured-extraction service call failed.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The call did not finish within `api_timeout_secs`.
    #[error("Extraction call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Network-level failure (DNS, connect, reset).
    #[error("Transport error talking to '{service}': {detail}")]
    Transport { service: String, detail: String },

    /// The service answered with a non-success HTTP status.
    #[error("'{service}' returned HTTP {status}: {message}")]
    Http {
        service: String,
        status: u16,
        message: String,
    },

    /// Provider-level error that carries no HTTP status.
    #[error("'{service}' API error: {message}")]
    Api { service: String, message: String },

    /// The service is not configured (missing API key etc.).
    #[error("Extraction service '{service}' is not configured.\n{hint}")]
    NotConfigured { service: String, hint: String },

    /// The extracted text could not be staged for upload.
    #[error("Failed to stage extracted text: {0}")]
    Staging(#[source] std::io::Error),

    /// Every attempt failed; wraps the last failure.
    #[error("Extraction failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ExtractionError>,
    },
}

impl ExtractionError {
    /// Whether another attempt has a reasonable chance of succeeding.
    ///
    /// Timeouts, transport failures, HTTP 429 and 5xx are transient;
    /// authentication, validation and configuration failures are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ExtractionError::Timeout { .. } | ExtractionError::Transport { .. } => true,
            ExtractionError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// The service output could not be mapped to visits.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Both the strict and the repaired parse failed.
    #[error("Response is not parseable JSON after repair: {reason}")]
    Unparsable { reason: String },

    /// JSON parsed, but its shape does not match the visit schema.
    #[error("Response does not match the visit schema: {reason}")]
    Shape { reason: String },

    /// A visit carried a date that is neither `YYYY-MM-DD` nor "unknown".
    #[error("Visit {index} has an unparseable visit_date '{value}' (expected YYYY-MM-DD or \"unknown\")")]
    InvalidVisitDate { index: usize, value: String },

    /// An audit artifact could not be read back for re-ingestion.
    #[error("Failed to read audit artifact '{path}': {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The persistence layer rejected an operation.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to open database '{path}': {detail}")]
    Open { path: PathBuf, detail: String },

    /// A uniqueness violation that could not be resolved by skipping.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Failed to encode records: {0}")]
    Encode(String),
}
