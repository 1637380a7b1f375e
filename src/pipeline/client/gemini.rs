//! Document-upload client for the Gemini file API.
//!
//! The whole document travels to the provider instead of page images:
//! stage to a temp file, raw-protocol upload, poll the returned handle
//! until it leaves `PROCESSING` (bounded by a hard ceiling), run
//! `generateContent` against the file reference, then delete the remote
//! file. Deletion runs whether generation succeeded or failed, and stale
//! uploads left by a crashed prior run are purged at the same point.
//! Cleanup failures are logged, never surfaced as run errors.
//!
//! The file API has no structured-output decoding constraint compatible
//! with our schema dialect, so the schema always rides the system
//! instruction as a textual block plus `response_mime_type: application/json`.

use std::io::Write;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, info_span, warn};

use super::{ClientError, DocumentModelClient, DocumentPrompt, ModelOutput, TokenUsage};
use crate::config::{UPLOAD_POLL_CEILING_SECS, UPLOAD_POLL_INTERVAL_SECS, UPLOAD_TIMEOUT_SECS};
use crate::pipeline::prompt::with_schema_block;
use crate::pipeline::schema::SchemaConstraint;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiFileClient {
    base_url: String,
    api_key: String,
    client: reqwest::blocking::Client,
    poll_interval: Duration,
    poll_ceiling: Duration,
}

impl GeminiFileClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            poll_interval: Duration::from_secs(UPLOAD_POLL_INTERVAL_SECS),
            poll_ceiling: Duration::from_secs(UPLOAD_POLL_CEILING_SECS),
        }
    }

    #[cfg(test)]
    fn with_poll_limits(mut self, interval: Duration, ceiling: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_ceiling = ceiling;
        self
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_connect() {
            ClientError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            ClientError::Timeout {
                secs: UPLOAD_TIMEOUT_SECS,
            }
        } else {
            ClientError::Connection(e.to_string())
        }
    }

    /// Stage the document to a scoped temp file and upload it. The temp
    /// file is deleted on drop regardless of outcome.
    fn upload_document(&self, document: &[u8]) -> Result<RemoteFile, ClientError> {
        let mut staged = tempfile::NamedTempFile::new()?;
        staged.write_all(document)?;
        staged.flush()?;
        let file = std::fs::File::open(staged.path())?;

        let url = format!("{}/upload/v1beta/files?key={}", self.base_url, self.api_key);
        let response = self
            .client
            .post(&url)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", "application/pdf")
            .body(reqwest::blocking::Body::from(file))
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ClientError::Upload(format!("HTTP {status}: {body}")));
        }

        let envelope: UploadEnvelope = response
            .json()
            .map_err(|e| ClientError::ResponseParsing(e.to_string()))?;
        debug!(name = %envelope.file.name, state = ?envelope.file.state, "Uploaded document");
        Ok(envelope.file)
    }

    /// Poll the remote handle until it is `ACTIVE`. Bounded by the poll
    /// ceiling — this loop never runs unbounded.
    fn wait_until_active(&self, mut file: RemoteFile) -> Result<RemoteFile, ClientError> {
        let deadline = Instant::now() + self.poll_ceiling;
        loop {
            match file.state {
                FileState::Active => return Ok(file),
                FileState::Failed => {
                    return Err(ClientError::UploadFailed(file.name));
                }
                FileState::Processing | FileState::Unknown => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::UploadTimeout {
                            secs: self.poll_ceiling.as_secs(),
                        });
                    }
                    std::thread::sleep(self.poll_interval);
                    file = self.get_file(&file.name)?;
                }
            }
        }
    }

    fn get_file(&self, name: &str) -> Result<RemoteFile, ClientError> {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, name, self.api_key);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_send_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ClientError::Upload(format!("HTTP {status}: {body}")));
        }
        response
            .json()
            .map_err(|e| ClientError::ResponseParsing(e.to_string()))
    }

    fn generate_content(
        &self,
        model: &str,
        system_prompt: &str,
        user_text: &str,
        file: &RemoteFile,
        schema: Option<&SchemaConstraint>,
    ) -> Result<ModelOutput, ClientError> {
        let system_text = match schema {
            Some(schema) => with_schema_block(system_prompt, schema),
            None => system_prompt.to_string(),
        };

        let mut generation_config = json!({"temperature": 0});
        if schema.is_some() {
            generation_config["response_mime_type"] = json!("application/json");
        }

        let body = json!({
            "system_instruction": {"parts": [{"text": system_text}]},
            "contents": [{
                "parts": [
                    {"text": user_text},
                    {"file_data": {"mime_type": "application/pdf", "file_uri": file.uri}},
                ],
            }],
            "generationConfig": generation_config,
        });

        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| ClientError::ResponseParsing(e.to_string()))?;
        let text = extract_candidate_text(&parsed)?;
        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage::from_counts(model, u.prompt_token_count, u.candidates_token_count));

        Ok(ModelOutput { text, usage })
    }

    /// Delete one remote file; failure is a warning, never an error —
    /// already-produced results are unaffected.
    fn delete_file(&self, name: &str) {
        let url = format!("{}/v1beta/{}?key={}", self.base_url, name, self.api_key);
        match self.client.delete(&url).send() {
            Ok(response) if response.status().is_success() => {
                debug!(name = %name, "Deleted remote document");
            }
            Ok(response) => {
                warn!(name = %name, status = %response.status(), "Remote document deletion failed");
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Remote document deletion failed");
            }
        }
    }

    /// Best-effort purge of residual uploads from earlier crashed runs.
    /// Returns how many files were deleted.
    pub fn purge_stale_uploads(&self) -> usize {
        let url = format!("{}/v1beta/files?key={}", self.base_url, self.api_key);
        let listing: FileListing = match self.client.get(&url).send().and_then(|r| r.json()) {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "Could not list remote files for purge");
                return 0;
            }
        };

        let count = listing.files.len();
        for file in &listing.files {
            self.delete_file(&file.name);
        }
        if count > 0 {
            info!(purged = count, "Purged stale remote uploads");
        }
        count
    }
}

impl DocumentModelClient for GeminiFileClient {
    fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        user_text: &str,
        document: &[u8],
        schema: Option<&SchemaConstraint>,
    ) -> Result<ModelOutput, ClientError> {
        let prompts = [DocumentPrompt {
            system_prompt,
            user_text,
            schema,
        }];
        let mut outputs = self.generate_many(model, &prompts, document)?;
        outputs
            .pop()
            .ok_or_else(|| ClientError::ResponseParsing("generation produced no output".into()))
    }

    /// One upload serves every prompt: stage, wait until `ACTIVE`, run
    /// `generateContent` per prompt against the same handle, delete once.
    fn generate_many(
        &self,
        model: &str,
        prompts: &[DocumentPrompt<'_>],
        document: &[u8],
    ) -> Result<Vec<ModelOutput>, ClientError> {
        let _span = info_span!(
            "document_generate",
            model = %model,
            prompts = prompts.len(),
            document_size = document.len(),
        )
        .entered();

        let uploaded = self.upload_document(document)?;
        let remote_name = uploaded.name.clone();

        // Guaranteed-release: generation results are captured first, then
        // the remote file is deleted on every path, then stale uploads
        // from prior runs are swept.
        let result = self.wait_until_active(uploaded).and_then(|file| {
            prompts
                .iter()
                .map(|p| self.generate_content(model, p.system_prompt, p.user_text, &file, p.schema))
                .collect()
        });

        self.delete_file(&remote_name);
        self.purge_stale_uploads();

        result
    }
}

// ── Wire types ────────────────────────────────────────────

#[derive(Deserialize)]
struct UploadEnvelope {
    file: RemoteFile,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RemoteFile {
    name: String,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    state: FileState,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum FileState {
    Processing,
    Active,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Default)]
struct FileListing {
    #[serde(default)]
    files: Vec<RemoteFile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Concatenate the text parts of the first candidate.
fn extract_candidate_text(response: &GenerateResponse) -> Result<String, ClientError> {
    let candidate = response
        .candidates
        .first()
        .ok_or_else(|| ClientError::ResponseParsing("response carried no candidates".into()))?;
    let parts = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();
    let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
    if text.is_empty() {
        return Err(ClientError::ResponseParsing(
            "candidate carried no text parts".into(),
        ));
    }
    Ok(text)
}
