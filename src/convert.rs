//! The ingestion pipeline: document bytes in, deduplicated labs out.
//!
//! ```text
//! bytes ─▶ text ─▶ raw response ─▶ LabReport ─▶ artifact ─▶ labs
//!        (pdfium/OCR)  (LLM)       (repair)     (JSON)    (SQLite)
//! ```
//!
//! Each run is sequential. Blocking stages (pdfium, tesseract, SQLite) run
//! on `spawn_blocking` workers; only the extraction call awaits the network.
//! Transient resources (staged text, page images, remote artifact) are owned
//! by the stage that creates them and released on every exit path, so an
//! error in a later stage never leaks an earlier stage's files.

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::model::{LabReport, LabWithTests};
use crate::output::{IngestOutput, IngestStats};
use crate::pipeline::artifact;
use crate::pipeline::ingest::{DeduplicatingIngestor, IngestSummary};
use crate::pipeline::llm::StructuredExtractionClient;
use crate::pipeline::repair::parse_response;
use crate::pipeline::text::{DocumentTextExtractor, TextExtraction};
use crate::progress::Stage;
use crate::store::{LabStore, SqliteLabStore};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Sequences extraction, parsing, the audit artifact and persistence.
///
/// # Example
/// ```rust,no_run
/// use labsift::{IngestConfig, Pipeline};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = IngestConfig::builder()
///     .gemini_api_key(std::env::var("GOOGLE_API_KEY")?)
///     .build()?;
/// let pipeline = Pipeline::open(config)?;
///
/// let bytes = std::fs::read("bloodwork.pdf")?;
/// let output = pipeline.process_document(&bytes, 42, "bloodwork.pdf").await?;
/// println!("{} labs inserted", output.summary.inserted.len());
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: IngestConfig,
    extractor: DocumentTextExtractor,
    client: OnceCell<StructuredExtractionClient>,
    store: Arc<dyn LabStore>,
}

impl Pipeline {
    /// Open the SQLite store at `config.database_path`.
    ///
    /// The extraction service is resolved on first use, so read-only
    /// operations work without API credentials.
    pub fn open(config: IngestConfig) -> Result<Self, IngestError> {
        let store = SqliteLabStore::open(&config.database_path)?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn new(config: IngestConfig, store: Arc<dyn LabStore>) -> Self {
        Self {
            extractor: DocumentTextExtractor::new(&config),
            client: OnceCell::new(),
            store,
            config,
        }
    }

    /// Replace the text extractor (e.g. custom PDF or OCR backends).
    pub fn with_text_extractor(mut self, extractor: DocumentTextExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Use a pre-built extraction client instead of resolving one from config.
    pub fn with_extraction_client(self, client: StructuredExtractionClient) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(client);
        Self {
            client: cell,
            ..self
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    fn client(&self) -> Result<&StructuredExtractionClient, IngestError> {
        Ok(self
            .client
            .get_or_try_init(|| StructuredExtractionClient::new(&self.config))?)
    }

    fn ingestor(&self) -> DeduplicatingIngestor {
        DeduplicatingIngestor::new(Arc::clone(&self.store))
            .with_progress(self.config.progress_callback.clone())
    }

    /// Run the whole pipeline for one uploaded document.
    ///
    /// # Arguments
    /// * `bytes`     : the uploaded PDF
    /// * `subject_id`: owner of the labs; overrides any `petId` in the response
    /// * `filename`  : originating file name; names the audit artifact
    ///
    /// # Errors
    /// The first failing stage's error. Nothing is persisted unless every
    /// stage before persistence succeeded; an unparsable response leaves no
    /// artifact behind.
    pub async fn process_document(
        &self,
        bytes: &[u8],
        subject_id: i64,
        filename: &str,
    ) -> Result<IngestOutput, IngestError> {
        let total_start = Instant::now();
        info!(
            "Processing {} for pet {} ({} bytes)",
            filename,
            subject_id,
            bytes.len()
        );

        // ── Step 1: Text ─────────────────────────────────────────────────────
        self.stage_start(Stage::TextExtraction);
        let text_start = Instant::now();
        let extraction = self.extractor.extract(bytes).await?;
        let text_duration_ms = text_start.elapsed().as_millis() as u64;
        self.stage_complete(Stage::TextExtraction, text_duration_ms);
        info!(
            "Text extraction took {}ms ({:?}, {} pages, {} chars)",
            text_duration_ms,
            extraction.method,
            extraction.page_count,
            extraction.text.len()
        );

        // ── Step 2: Structured extraction ────────────────────────────────────
        let client = self.client()?;
        self.stage_start(Stage::StructuredExtraction);
        let response = client.extract_structured(&extraction.text, subject_id).await?;
        self.stage_complete(Stage::StructuredExtraction, response.duration_ms);

        // ── Step 3: Parse ────────────────────────────────────────────────────
        self.stage_start(Stage::Parsing);
        let parse_start = Instant::now();
        let mut report = parse_response(&response.raw).into_result()?;
        report.pet_id = subject_id;
        self.stage_complete(Stage::Parsing, parse_start.elapsed().as_millis() as u64);
        debug!("Parsed {} visits", report.visits.len());

        // ── Steps 4–5: Artifact + persistence ────────────────────────────────
        let (artifact_path, summary, persist_duration_ms) =
            self.persist(report.clone(), subject_id, filename).await?;

        let stats = IngestStats {
            page_count: extraction.page_count,
            extraction_method: Some(extraction.method),
            text_chars: extraction.text.chars().count(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            retries: response.retries,
            visits: report.visits.len(),
            text_duration_ms,
            llm_duration_ms: response.duration_ms,
            persist_duration_ms,
            total_duration_ms: total_start.elapsed().as_millis() as u64,
        };

        info!(
            "Ingestion of {} complete: {} inserted, {} skipped, {}ms total",
            filename,
            summary.inserted.len(),
            summary.skipped.len(),
            stats.total_duration_ms
        );

        Ok(IngestOutput {
            report,
            artifact_path,
            summary,
            stats,
        })
    }

    /// Blocking wrapper around [`Pipeline::process_document`].
    ///
    /// Creates a temporary tokio runtime internally.
    pub fn process_document_sync(
        &self,
        bytes: &[u8],
        subject_id: i64,
        filename: &str,
    ) -> Result<IngestOutput, IngestError> {
        tokio::runtime::Runtime::new()
            .map_err(|e| IngestError::Internal(format!("Failed to create tokio runtime: {}", e)))?
            .block_on(self.process_document(bytes, subject_id, filename))
    }

    /// Re-run deduplicating ingestion from an existing audit artifact.
    ///
    /// The artifact's canonical path is the `source_path`, so re-ingesting
    /// an artifact written by [`Pipeline::process_document`] skips every
    /// visit already stored. No extraction service is contacted.
    pub async fn reingest_artifact(
        &self,
        path: impl AsRef<Path>,
        subject_id: i64,
    ) -> Result<IngestOutput, IngestError> {
        let total_start = Instant::now();
        let path = path.as_ref().to_path_buf();

        let (source, mut report) = blocking(move || Ok(artifact::read_artifact(&path)?)).await?;
        report.pet_id = subject_id;
        info!(
            "Re-ingesting {} ({} visits) for pet {}",
            source.display(),
            report.visits.len(),
            subject_id
        );

        self.stage_start(Stage::Persistence);
        let persist_start = Instant::now();
        let summary = self.ingest_blocking(report.clone(), subject_id, &source).await?;
        let persist_duration_ms = persist_start.elapsed().as_millis() as u64;
        self.stage_complete(Stage::Persistence, persist_duration_ms);

        Ok(IngestOutput {
            stats: IngestStats {
                visits: report.visits.len(),
                persist_duration_ms,
                total_duration_ms: total_start.elapsed().as_millis() as u64,
                ..Default::default()
            },
            report,
            artifact_path: source,
            summary,
        })
    }

    /// Extract a document's text without contacting any service.
    pub async fn extract_text(&self, bytes: &[u8]) -> Result<TextExtraction, IngestError> {
        self.extractor.extract(bytes).await
    }

    /// All persisted labs of a subject, unknown dates first.
    pub async fn labs_for_subject(&self, subject_id: i64) -> Result<Vec<LabWithTests>, IngestError> {
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.labs_for_subject(subject_id)?)).await
    }

    /// Remove every lab of a subject. Returns the number of labs removed.
    ///
    /// Audit artifacts are left on disk.
    pub async fn forget_subject(&self, subject_id: i64) -> Result<usize, IngestError> {
        let store = Arc::clone(&self.store);
        blocking(move || Ok(store.delete_subject(subject_id)?)).await
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    async fn persist(
        &self,
        report: LabReport,
        subject_id: i64,
        filename: &str,
    ) -> Result<(PathBuf, IngestSummary, u64), IngestError> {
        self.stage_start(Stage::Artifact);
        let artifact_start = Instant::now();
        let content_dir = self.config.content_dir.clone();
        let name = filename.to_string();
        let to_write = report.clone();
        let artifact_path = blocking(move || {
            artifact::write_artifact(&content_dir, subject_id, &name, &to_write)
        })
        .await?;
        self.stage_complete(Stage::Artifact, artifact_start.elapsed().as_millis() as u64);

        self.stage_start(Stage::Persistence);
        let persist_start = Instant::now();
        let summary = self.ingest_blocking(report, subject_id, &artifact_path).await?;
        let persist_duration_ms = persist_start.elapsed().as_millis() as u64;
        self.stage_complete(Stage::Persistence, persist_duration_ms);

        Ok((artifact_path, summary, persist_duration_ms))
    }

    async fn ingest_blocking(
        &self,
        report: LabReport,
        subject_id: i64,
        source: &Path,
    ) -> Result<IngestSummary, IngestError> {
        let ingestor = self.ingestor();
        let source_path = source.to_string_lossy().to_string();
        blocking(move || ingestor.ingest(&report, subject_id, &source_path)).await
    }

    fn stage_start(&self, stage: Stage) {
        debug!("Stage started: {}", stage);
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_start(stage);
        }
    }

    fn stage_complete(&self, stage: Stage, duration_ms: u64) {
        if let Some(ref cb) = self.config.progress_callback {
            cb.on_stage_complete(stage, duration_ms);
        }
    }
}

/// Run blocking work (filesystem, SQLite) off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, IngestError>
where
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| IngestError::Internal(format!("Blocking task panicked: {}", e)))?
}
