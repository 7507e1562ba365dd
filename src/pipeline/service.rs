//! Structured-extraction services: where the prompt and the document text go.
//!
//! The extraction client speaks to an [`InferenceService`] in three steps:
//! upload the staged text as an artifact, generate against prompt + artifact,
//! delete the artifact. Two implementations ship:
//!
//! * [`GeminiFilesService`] uploads to the Gemini Files API, so the artifact
//!   really lives remotely and deletion matters.
//! * [`EdgequakeService`] adapts any `edgequake-llm` provider (OpenAI,
//!   Anthropic, Ollama, …). Chat APIs have no file store, so "upload" reads
//!   the text locally and generation attaches it as a document message;
//!   deletion is a no-op.

use crate::config::{IngestConfig, DEFAULT_GEMINI_MODEL, DEFAULT_PROVIDER_MODEL};
use crate::error::ExtractionError;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// MIME type of the staged extraction text.
pub const TEXT_MIME_TYPE: &str = "text/markdown";

/// Handle to an uploaded document artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteArtifact {
    /// Service-side identifier used for deletion (e.g. `files/abc123`).
    pub name: String,
    /// URI referenced from generation requests.
    pub uri: String,
    pub mime_type: String,
    /// Content carried inline by services without a file store.
    pub inline_text: Option<String>,
}

/// Sampling options for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl GenerationOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }
}

/// Text returned by a generation call plus token accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

/// An external service that turns prompt + document into structured text.
#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;

    /// Upload the file at `path` and return a handle to it.
    async fn upload(&self, path: &Path, display_name: &str)
        -> Result<RemoteArtifact, ExtractionError>;

    /// Generate a response for `prompt` with `artifact` attached.
    async fn generate(
        &self,
        prompt: &str,
        artifact: &RemoteArtifact,
        options: &GenerationOptions,
    ) -> Result<Generation, ExtractionError>;

    /// Delete a previously uploaded artifact.
    async fn delete(&self, artifact: &RemoteArtifact) -> Result<(), ExtractionError>;
}

// ── Gemini Files API ─────────────────────────────────────────────────────

/// Google Gemini via its public REST API (`generativelanguage.googleapis.com`).
pub struct GeminiFilesService {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiFilesService {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into().trim_start_matches("models/").to_string(),
        }
    }

    fn transport(&self, e: reqwest::Error) -> ExtractionError {
        ExtractionError::Transport {
            service: "gemini".to_string(),
            detail: e.to_string(),
        }
    }

    async fn http_error(&self, response: reqwest::Response) -> ExtractionError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        ExtractionError::Http {
            service: "gemini".to_string(),
            status,
            message: truncate_body(&body),
        }
    }
}

#[derive(Deserialize)]
struct UploadResponse {
    file: GeminiFile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFile {
    name: String,
    uri: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: usize,
    #[serde(default)]
    candidates_token_count: usize,
}

#[async_trait]
impl InferenceService for GeminiFilesService {
    fn name(&self) -> &str {
        "gemini"
    }

    /// Resumable upload: a start request returns the session URL, a second
    /// request sends the bytes and finalises.
    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<RemoteArtifact, ExtractionError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(ExtractionError::Staging)?;

        let start = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", TEXT_MIME_TYPE)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !start.status().is_success() {
            return Err(self.http_error(start).await);
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ExtractionError::Api {
                service: "gemini".to_string(),
                message: "upload session response carried no x-goog-upload-url".to_string(),
            })?;

        let response = self
            .client
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(bytes)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.http_error(response).await);
        }

        let uploaded: UploadResponse = response.json().await.map_err(|e| ExtractionError::Api {
            service: "gemini".to_string(),
            message: format!("Failed to parse upload response: {e}"),
        })?;

        debug!("Uploaded {} as {}", display_name, uploaded.file.name);
        Ok(RemoteArtifact {
            name: uploaded.file.name,
            uri: uploaded.file.uri,
            mime_type: uploaded
                .file
                .mime_type
                .unwrap_or_else(|| TEXT_MIME_TYPE.to_string()),
            inline_text: None,
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        artifact: &RemoteArtifact,
        options: &GenerationOptions,
    ) -> Result<Generation, ExtractionError> {
        let request = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": prompt },
                    { "file_data": { "mime_type": artifact.mime_type, "file_uri": artifact.uri } }
                ]
            }],
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            }
        });

        let response = self
            .client
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.http_error(response).await);
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| ExtractionError::Api {
            service: "gemini".to_string(),
            message: format!("Failed to parse generation response: {e}"),
        })?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .ok_or_else(|| ExtractionError::Api {
                service: "gemini".to_string(),
                message: "No candidates in Gemini response".to_string(),
            })?;

        let (input_tokens, output_tokens) = parsed
            .usage_metadata
            .map(|u| (u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_default();

        Ok(Generation {
            text,
            input_tokens,
            output_tokens,
        })
    }

    async fn delete(&self, artifact: &RemoteArtifact) -> Result<(), ExtractionError> {
        let response = self
            .client
            .delete(format!("{}/v1beta/{}", self.base_url, artifact.name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        if !response.status().is_success() {
            return Err(self.http_error(response).await);
        }
        Ok(())
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Any edgequake-llm chat provider.
pub struct EdgequakeService {
    provider: Arc<dyn LLMProvider>,
    label: String,
}

impl EdgequakeService {
    pub fn new(provider: Arc<dyn LLMProvider>, label: impl Into<String>) -> Self {
        Self {
            provider,
            label: label.into(),
        }
    }
}

#[async_trait]
impl InferenceService for EdgequakeService {
    fn name(&self) -> &str {
        &self.label
    }

    async fn upload(
        &self,
        path: &Path,
        display_name: &str,
    ) -> Result<RemoteArtifact, ExtractionError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(ExtractionError::Staging)?;
        Ok(RemoteArtifact {
            name: display_name.to_string(),
            uri: format!("inline://{display_name}"),
            mime_type: TEXT_MIME_TYPE.to_string(),
            inline_text: Some(text),
        })
    }

    async fn generate(
        &self,
        prompt: &str,
        artifact: &RemoteArtifact,
        options: &GenerationOptions,
    ) -> Result<Generation, ExtractionError> {
        let document = artifact.inline_text.as_deref().unwrap_or_default();
        let messages = vec![
            ChatMessage::system(prompt),
            ChatMessage::user(format!(
                "Attached document `{}`:\n\n{}",
                artifact.name, document
            )),
        ];
        let completion = CompletionOptions {
            temperature: Some(options.temperature),
            max_tokens: Some(options.max_tokens),
            ..Default::default()
        };

        let response = self
            .provider
            .chat(&messages, Some(&completion))
            .await
            .map_err(|e| classify_provider_error(&self.label, &e.to_string()))?;

        Ok(Generation {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }

    async fn delete(&self, _artifact: &RemoteArtifact) -> Result<(), ExtractionError> {
        Ok(())
    }
}

/// An HTTP status worth retrying, as it appears in provider error text:
/// after "status", "HTTP" or "code", or followed by its reason phrase.
static RE_TRANSIENT_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:status|http|code)\b\D{0,16}?\b(429|50[0-4])\b|\b(429|50[0-4])\s+(?:too many requests|internal server error|bad gateway|service unavailable|gateway time-?out)",
    )
    .unwrap()
});

/// Map a provider error message onto transient vs. permanent failures.
///
/// edgequake-llm reports HTTP and network failures as text, so the status
/// and a handful of network phrases are recovered from the message.
fn classify_provider_error(service: &str, message: &str) -> ExtractionError {
    let status = RE_TRANSIENT_STATUS
        .captures(message)
        .and_then(|caps| caps.get(1).or_else(|| caps.get(2)))
        .and_then(|m| m.as_str().parse::<u16>().ok());

    if let Some(status) = status {
        return ExtractionError::Http {
            service: service.to_string(),
            status,
            message: message.to_string(),
        };
    }
    let lower = message.to_lowercase();
    if ["timed out", "timeout", "connection", "rate limit", "overloaded"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return ExtractionError::Transport {
            service: service.to_string(),
            detail: message.to_string(),
        };
    }
    ExtractionError::Api {
        service: service.to_string(),
        message: message.to_string(),
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 512;
    crate::model::truncate_chars(body.trim(), MAX)
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Which service a config selects, before anything is constructed.
#[derive(Clone)]
enum ServiceChoice<'a> {
    Prebuilt(&'a Arc<dyn InferenceService>),
    Provider { name: &'a str, model: &'a str },
    Gemini { api_key: &'a str, model: &'a str },
}

impl ServiceChoice<'_> {
    fn label(&self) -> String {
        match self {
            ServiceChoice::Prebuilt(service) => service.name().to_string(),
            ServiceChoice::Provider { name, model } => format!("{name}/{model}"),
            ServiceChoice::Gemini { .. } => "gemini".to_string(),
        }
    }
}

/// Most specific first: pre-built service, named provider, Gemini key.
fn choose_service(config: &IngestConfig) -> Option<ServiceChoice<'_>> {
    if let Some(ref service) = config.service {
        return Some(ServiceChoice::Prebuilt(service));
    }
    if let Some(ref name) = config.provider_name {
        return Some(ServiceChoice::Provider {
            name,
            model: config.model.as_deref().unwrap_or(DEFAULT_PROVIDER_MODEL),
        });
    }
    match config.gemini_api_key.as_deref() {
        Some(key) if !key.is_empty() => Some(ServiceChoice::Gemini {
            api_key: key,
            model: config.model.as_deref().unwrap_or(DEFAULT_GEMINI_MODEL),
        }),
        _ => None,
    }
}

/// Build the extraction service selected by `config`.
///
/// Only the config is consulted. To pick up `GOOGLE_API_KEY`,
/// `EDGEQUAKE_LLM_PROVIDER`/`EDGEQUAKE_MODEL` or `OPENAI_API_KEY`, build the
/// config with [`IngestConfigBuilder::with_env`](crate::config::IngestConfigBuilder::with_env).
pub fn resolve_service(config: &IngestConfig) -> Result<Arc<dyn InferenceService>, ExtractionError> {
    let choice = choose_service(config).ok_or_else(|| ExtractionError::NotConfigured {
        service: "none".to_string(),
        hint: "No extraction service configured.\n\
               Set GOOGLE_API_KEY (Gemini), OPENAI_API_KEY, or pass --provider/--model."
            .to_string(),
    })?;
    debug!("Extraction service: {}", choice.label());

    match choice {
        ServiceChoice::Prebuilt(service) => Ok(Arc::clone(service)),
        ServiceChoice::Provider { name, model } => {
            let provider = ProviderFactory::create_llm_provider(name, model).map_err(|e| {
                ExtractionError::NotConfigured {
                    service: name.to_string(),
                    hint: format!("{e}"),
                }
            })?;
            Ok(Arc::new(EdgequakeService::new(
                provider,
                format!("{name}/{model}"),
            )))
        }
        ServiceChoice::Gemini { api_key, model } => Ok(Arc::new(GeminiFilesService::new(
            api_key,
            config.gemini_base_url.clone(),
            model,
        ))),
    }
}
