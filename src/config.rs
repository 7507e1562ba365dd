//! Configuration types for lab-report ingestion.
//!
//! Everything the pipeline needs from its environment (tool paths, API keys,
//! timeouts, storage locations) lives in one [`IngestConfig`], built via
//! [`IngestConfigBuilder`] and handed to each component at construction.
//! Environment variables are read in one place only,
//! [`IngestConfigBuilder::with_env`], and nothing reads process-wide state
//! after `build()`. Two pipelines with different keys or OCR binaries can run
//! side by side.

use crate::error::IngestError;
use crate::pipeline::service::InferenceService;
use crate::progress::ProgressCallback;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Default Gemini model used when talking to the Files API directly.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-lite";

/// Default model for edgequake-llm providers.
pub const DEFAULT_PROVIDER_MODEL: &str = "gpt-4.1-nano";

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Configuration for an ingestion pipeline.
///
/// Built via [`IngestConfig::builder()`] or using [`IngestConfig::default()`].
///
/// # Example
/// ```rust
/// use labsift::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .content_dir("/var/lib/labsift/json")
///     .ocr_dpi(300)
///     .api_timeout_secs(90)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Root of the durable audit artifacts. Default: `files/converted_json`.
    ///
    /// Each ingestion writes `<content_dir>/<subject_id>/<filename>.json`.
    pub content_dir: PathBuf,

    /// SQLite database file. Default: `labsift.db`.
    pub database_path: PathBuf,

    /// Explicit path to the pdfium shared library. Default: None (discover).
    pub pdfium_library_path: Option<PathBuf>,

    /// Tesseract executable. Default: `tesseract` (resolved through `PATH`).
    pub tesseract_cmd: PathBuf,

    /// Tesseract page segmentation mode. Default: 3 (fully automatic).
    pub tesseract_psm: u8,

    /// Tesseract language(s), e.g. "eng" or "eng+fra". Default: "eng".
    pub ocr_language: String,

    /// Rasterisation DPI for the OCR fallback. Range: 300–600. Default: 300.
    ///
    /// Tesseract accuracy drops sharply below 300 DPI on the small print of
    /// lab-report tables.
    pub ocr_dpi: u32,

    /// Longest rendered edge in pixels, independent of DPI. Default: 5000.
    pub max_rendered_pixels: u32,

    /// Upload size limit in bytes. Default: 10 MiB.
    pub max_document_bytes: usize,

    /// Model identifier. If None, the service default is used.
    pub model: Option<String>,

    /// edgequake-llm provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Gemini API key. When set, the Gemini Files API service is used and the
    /// extracted text is uploaded as a real remote file.
    pub gemini_api_key: Option<String>,

    /// Base URL of the Gemini REST API.
    pub gemini_base_url: String,

    /// Pre-constructed inference service. Takes precedence over everything else.
    pub service: Option<Arc<dyn InferenceService>>,

    /// Sampling temperature. Default: 0.0 (extraction, not generation).
    pub temperature: f32,

    /// Maximum output tokens for the structured response. Default: 8192.
    pub max_tokens: usize,

    /// Per-attempt timeout for the extraction call in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Retries on transient transport failures. Range: 0–10. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per attempt. Default: 500.
    pub retry_backoff_ms: u64,

    /// Custom extraction prompt template. Must contain `{pet_id}`.
    pub extraction_prompt: Option<String>,

    /// Receives stage events while a document is processed.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            content_dir: PathBuf::from("files/converted_json"),
            database_path: PathBuf::from("labsift.db"),
            pdfium_library_path: None,
            tesseract_cmd: PathBuf::from("tesseract"),
            tesseract_psm: 3,
            ocr_language: "eng".to_string(),
            ocr_dpi: 300,
            max_rendered_pixels: 5000,
            max_document_bytes: 10 * 1024 * 1024,
            model: None,
            provider_name: None,
            gemini_api_key: None,
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            service: None,
            temperature: 0.0,
            max_tokens: 8192,
            api_timeout_secs: 120,
            max_retries: 2,
            retry_backoff_ms: 500,
            extraction_prompt: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("content_dir", &self.content_dir)
            .field("database_path", &self.database_path)
            .field("pdfium_library_path", &self.pdfium_library_path)
            .field("tesseract_cmd", &self.tesseract_cmd)
            .field("tesseract_psm", &self.tesseract_psm)
            .field("ocr_language", &self.ocr_language)
            .field("ocr_dpi", &self.ocr_dpi)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "<redacted>"))
            .field("service", &self.service.as_ref().map(|_| "<dyn InferenceService>"))
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`IngestConfig`].
#[derive(Debug)]
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl IngestConfigBuilder {
    pub fn content_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.content_dir = dir.into();
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    pub fn pdfium_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_library_path = Some(path.into());
        self
    }

    pub fn tesseract_cmd(mut self, cmd: impl Into<PathBuf>) -> Self {
        self.config.tesseract_cmd = cmd.into();
        self
    }

    pub fn tesseract_psm(mut self, psm: u8) -> Self {
        self.config.tesseract_psm = psm.min(13);
        self
    }

    pub fn ocr_language(mut self, lang: impl Into<String>) -> Self {
        self.config.ocr_language = lang.into();
        self
    }

    pub fn ocr_dpi(mut self, dpi: u32) -> Self {
        self.config.ocr_dpi = dpi.clamp(300, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(500);
        self
    }

    pub fn max_document_bytes(mut self, bytes: usize) -> Self {
        self.config.max_document_bytes = bytes;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn gemini_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.gemini_api_key = Some(key.into());
        self
    }

    pub fn gemini_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.gemini_base_url = url.into();
        self
    }

    pub fn service(mut self, service: Arc<dyn InferenceService>) -> Self {
        self.config.service = Some(service);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(MAX_RETRIES_LIMIT);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn extraction_prompt(mut self, template: impl Into<String>) -> Self {
        self.config.extraction_prompt = Some(template.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Fill unset fields from the process environment.
    ///
    /// - `PDFIUM_DYNAMIC_LIB_PATH` sets the pdfium library path.
    /// - When no service, provider or Gemini key was given, the first match
    ///   of `GOOGLE_API_KEY`, `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`,
    ///   or `OPENAI_API_KEY` (provider `openai`) selects the service.
    ///
    /// Explicit builder calls always win, whichever order they come in.
    pub fn with_env(self) -> Self {
        self.with_env_from(|name| std::env::var(name).ok())
    }

    /// [`with_env`](Self::with_env) over an arbitrary variable lookup.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let c = &mut self.config;

        if c.pdfium_library_path.is_none() {
            c.pdfium_library_path = var("PDFIUM_DYNAMIC_LIB_PATH").map(PathBuf::from);
        }

        let explicit = c.service.is_some()
            || c.provider_name.is_some()
            || c.gemini_api_key.as_deref().is_some_and(|k| !k.is_empty());
        if explicit {
            return self;
        }

        if let Some(key) = var("GOOGLE_API_KEY") {
            c.gemini_api_key = Some(key);
        } else if let (Some(provider), Some(model)) =
            (var("EDGEQUAKE_LLM_PROVIDER"), var("EDGEQUAKE_MODEL"))
        {
            c.provider_name = Some(provider);
            if c.model.is_none() {
                c.model = Some(model);
            }
        } else if var("OPENAI_API_KEY").is_some() {
            c.provider_name = Some("openai".to_string());
        }
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.ocr_dpi < 300 || c.ocr_dpi > 600 {
            return Err(IngestError::InvalidConfig(format!(
                "OCR DPI must be 300–600, got {}",
                c.ocr_dpi
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "API timeout must be at least 1 second".into(),
            ));
        }
        if c.max_document_bytes == 0 {
            return Err(IngestError::InvalidConfig(
                "Document size limit must be > 0".into(),
            ));
        }
        if c.ocr_language.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "OCR language must not be empty".into(),
            ));
        }
        if let Some(ref template) = c.extraction_prompt {
            if !template.contains("{pet_id}") {
                return Err(IngestError::InvalidConfig(
                    "Custom extraction prompt must contain the {pet_id} placeholder".into(),
                ));
            }
        }
        Ok(self.config)
    }
}
