//! Structured extraction: document text + prompt → raw model response.
//!
//! ## Retry Strategy
//!
//! HTTP 429 / 5xx and dropped connections are transient and frequent on
//! shared inference endpoints. Each attempt is bounded by
//! `api_timeout_secs`; transient failures back off exponentially
//! (`retry_backoff_ms * 2^(attempt-1)`), so with a 500 ms base and 2 retries
//! the waits are 500 ms → 1 s. Authentication, validation and parse failures
//! are returned at once.
//!
//! ## Staged text
//!
//! The text is written to a uniquely named `labtext-*.md` temp file before
//! upload. Concurrent ingestions never share the path, and the file is
//! removed when the call returns whether it succeeded or not.

use crate::config::IngestConfig;
use crate::error::ExtractionError;
use crate::pipeline::service::{
    resolve_service, Generation, GenerationOptions, InferenceService, RemoteArtifact,
};
use crate::prompts::extraction_prompt;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, warn};

/// The sanitised response and what it cost.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredResponse {
    pub raw: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// Retries spent on the generation call (0 = first attempt succeeded).
    pub retries: u32,
    pub duration_ms: u64,
}

/// Sends document text to an [`InferenceService`] with the extraction prompt.
#[derive(Clone)]
pub struct StructuredExtractionClient {
    service: Arc<dyn InferenceService>,
    options: GenerationOptions,
    timeout_secs: u64,
    max_retries: u32,
    retry_backoff_ms: u64,
    prompt_template: Option<String>,
}

impl StructuredExtractionClient {
    /// Resolve the service from `config` (see [`resolve_service`]).
    pub fn new(config: &IngestConfig) -> Result<Self, ExtractionError> {
        Ok(Self::with_service(resolve_service(config)?, config))
    }

    pub fn with_service(service: Arc<dyn InferenceService>, config: &IngestConfig) -> Self {
        Self {
            service,
            options: GenerationOptions::from_config(config),
            timeout_secs: config.api_timeout_secs,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            prompt_template: config.extraction_prompt.clone(),
        }
    }

    pub fn service_name(&self) -> &str {
        self.service.name()
    }

    /// Run structured extraction for `text` on behalf of `subject_id`.
    ///
    /// The uploaded artifact is deleted before returning on every path;
    /// deletion failures are logged and never change the result.
    pub async fn extract_structured(
        &self,
        text: &str,
        subject_id: i64,
    ) -> Result<StructuredResponse, ExtractionError> {
        let start = Instant::now();
        let prompt = extraction_prompt(self.prompt_template.as_deref(), subject_id);

        let mut staged = tempfile::Builder::new()
            .prefix("labtext-")
            .suffix(".md")
            .tempfile()
            .map_err(ExtractionError::Staging)?;
        staged
            .write_all(text.as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(ExtractionError::Staging)?;

        let display_name = staged
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "labtext.md".to_string());

        let result = self
            .upload_and_generate(&prompt, staged.path(), &display_name)
            .await;

        if let Err(e) = staged.close() {
            warn!("Failed to remove staged text {}: {}", display_name, e);
        }

        let (generation, retries) = result?;
        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Structured extraction via {} took {}ms ({} in / {} out tokens)",
            self.service.name(),
            duration_ms,
            generation.input_tokens,
            generation.output_tokens
        );

        Ok(StructuredResponse {
            raw: sanitize_response(&generation.text),
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            retries,
            duration_ms,
        })
    }

    async fn upload_and_generate(
        &self,
        prompt: &str,
        path: &std::path::Path,
        display_name: &str,
    ) -> Result<(Generation, u32), ExtractionError> {
        let (artifact, _) = self
            .with_retry("upload", || self.service.upload(path, display_name))
            .await?;
        debug!("Staged artifact {} ({})", artifact.name, artifact.uri);

        let generated = self
            .with_retry("generate", || {
                self.service.generate(prompt, &artifact, &self.options)
            })
            .await;

        self.delete_best_effort(&artifact).await;
        generated
    }

    async fn delete_best_effort(&self, artifact: &RemoteArtifact) {
        match timeout(
            Duration::from_secs(self.timeout_secs),
            self.service.delete(artifact),
        )
        .await
        {
            Ok(Ok(())) => debug!("Deleted remote artifact {}", artifact.name),
            Ok(Err(e)) => warn!("Failed to delete remote artifact {}: {}", artifact.name, e),
            Err(_) => warn!(
                "Deleting remote artifact {} timed out after {}s",
                artifact.name, self.timeout_secs
            ),
        }
    }

    /// Run `op` with a per-attempt timeout, retrying transient failures.
    ///
    /// Returns the value and the number of retries spent.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<(T, u32), ExtractionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExtractionError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if attempt > 0 {
                let backoff = backoff_delay_ms(self.retry_backoff_ms, attempt);
                warn!(
                    "{} {}: retry {}/{} after {}ms",
                    self.service.name(),
                    what,
                    attempt,
                    self.max_retries,
                    backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }

            let outcome = match timeout(Duration::from_secs(self.timeout_secs), op()).await {
                Ok(result) => result,
                Err(_) => Err(ExtractionError::Timeout {
                    secs: self.timeout_secs,
                }),
            };

            match outcome {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.max_retries => {
                    return Err(ExtractionError::RetriesExhausted {
                        attempts: attempt + 1,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    warn!(
                        "{} {}: attempt {} failed: {}",
                        self.service.name(),
                        what,
                        attempt + 1,
                        e
                    );
                    attempt += 1;
                }
            }
        }
    }
}

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`.
///
/// Saturates instead of overflowing for large attempt counts.
pub(crate) fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    base_ms.saturating_mul(factor)
}

/// Trim, normalise line endings and drop invisible Unicode.
pub fn sanitize_response(raw: &str) -> String {
    raw.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace(
            [
                '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
            ],
            "",
        )
        .trim()
        .to_string()
}
