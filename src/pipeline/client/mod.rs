pub mod gemini;
pub mod openai;

pub use gemini::GeminiFileClient;
pub use openai::OpenAiCompatClient;

use std::collections::VecDeque;
use std::sync::Mutex;

use base64::Engine as _;
use serde::Serialize;
use thiserror::Error;

use crate::config::estimate_cost_usd;
use crate::pipeline::schema::SchemaConstraint;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot reach model provider: {0}")]
    Connection(String),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Provider returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Document upload failed: {0}")]
    Upload(String),

    #[error("Uploaded document never became active within {secs}s")]
    UploadTimeout { secs: u64 },

    #[error("Remote document processing failed: {0}")]
    UploadFailed(String),

    #[error("Malformed provider response: {0}")]
    ResponseParsing(String),
}

/// Token accounting for one model request, with the cost estimate derived
/// from the config table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    pub fn from_counts(model: &str, input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            estimated_cost_usd: estimate_cost_usd(model, input_tokens, output_tokens),
        }
    }

    /// Combine usage across the requests of a split batch.
    pub fn sum(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
            estimated_cost_usd: self.estimated_cost_usd + other.estimated_cost_usd,
        }
    }
}

/// Fully-concatenated model output. Streaming is consumed inside the
/// client; no partial-result contract is exposed upward.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// One multimodal chat-completion request.
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_text: &'a str,
    /// Data URLs, one per inline image.
    pub images: &'a [String],
    /// When set, either passed as a decoding constraint or inlined into
    /// the system prompt, depending on the client's capabilities.
    pub schema: Option<&'a SchemaConstraint>,
}

/// Chat-completion capability over inline images (or plain text when
/// `images` is empty).
pub trait ChatModelClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ModelOutput, ClientError>;
}

/// One prompt of a multi-request exchange against a single document.
pub struct DocumentPrompt<'a> {
    pub system_prompt: &'a str,
    pub user_text: &'a str,
    pub schema: Option<&'a SchemaConstraint>,
}

/// Whole-document capability: the provider receives the document itself
/// rather than page images.
pub trait DocumentModelClient {
    fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        user_text: &str,
        document: &[u8],
        schema: Option<&SchemaConstraint>,
    ) -> Result<ModelOutput, ClientError>;

    /// Run several prompts against one document, failing fast on the
    /// first error. Upload-based implementations override this to stage
    /// the document once and reuse the remote handle for every prompt.
    fn generate_many(
        &self,
        model: &str,
        prompts: &[DocumentPrompt<'_>],
        document: &[u8],
    ) -> Result<Vec<ModelOutput>, ClientError> {
        prompts
            .iter()
            .map(|p| self.generate(model, p.system_prompt, p.user_text, document, p.schema))
            .collect()
    }
}

impl<T: ChatModelClient + ?Sized> ChatModelClient for std::sync::Arc<T> {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ModelOutput, ClientError> {
        (**self).complete(request)
    }
}

impl<T: DocumentModelClient + ?Sized> DocumentModelClient for std::sync::Arc<T> {
    fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        user_text: &str,
        document: &[u8],
        schema: Option<&SchemaConstraint>,
    ) -> Result<ModelOutput, ClientError> {
        (**self).generate(model, system_prompt, user_text, document, schema)
    }

    fn generate_many(
        &self,
        model: &str,
        prompts: &[DocumentPrompt<'_>],
        document: &[u8],
    ) -> Result<Vec<ModelOutput>, ClientError> {
        (**self).generate_many(model, prompts, document)
    }
}

/// Base64 a JPEG page into a chat-message data URL.
pub fn jpeg_data_url(jpeg_bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(jpeg_bytes);
    format!("data:image/jpeg;base64,{encoded}")
}

// ── Mocks (testing) ───────────────────────────────────────

/// What a scripted mock returns for one call.
pub enum MockReply {
    Text(String),
    TextWithUsage(String, TokenUsage),
    Fail(String),
}

/// Captured shape of one mock call, for assertions.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub system_prompt: String,
    pub image_count: usize,
    pub schema_name: Option<&'static str>,
}

/// Scripted chat client: replies are consumed in order; running out of
/// script is a test bug and fails loudly.
#[derive(Default)]
pub struct MockChatClient {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(self, text: &str) -> Self {
        self.replies.lock().unwrap().push_back(MockReply::Text(text.into()));
        self
    }

    pub fn push_reply(self, reply: MockReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn push_failure(self, message: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(MockReply::Fail(message.into()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl ChatModelClient for MockChatClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ModelOutput, ClientError> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: request.model.to_string(),
            system_prompt: request.system_prompt.to_string(),
            image_count: request.images.len(),
            schema_name: request.schema.map(|s| s.name),
        });
        match self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock script exhausted")
        {
            MockReply::Text(text) => Ok(ModelOutput { text, usage: None }),
            MockReply::TextWithUsage(text, usage) => Ok(ModelOutput {
                text,
                usage: Some(usage),
            }),
            MockReply::Fail(message) => Err(ClientError::Api {
                status: 500,
                body: message,
            }),
        }
    }
}

/// Scripted document client, same discipline as `MockChatClient`.
#[derive(Default)]
pub struct MockDocumentClient {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockDocumentClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(self, reply: MockReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn push_text(self, text: &str) -> Self {
        self.push_reply(MockReply::Text(text.into()))
    }

    pub fn push_failure(self, message: &str) -> Self {
        self.push_reply(MockReply::Fail(message.into()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl DocumentModelClient for MockDocumentClient {
    fn generate(
        &self,
        model: &str,
        system_prompt: &str,
        _user_text: &str,
        _document: &[u8],
        schema: Option<&SchemaConstraint>,
    ) -> Result<ModelOutput, ClientError> {
        self.calls.lock().unwrap().push(RecordedCall {
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            image_count: 0,
            schema_name: schema.map(|s| s.name),
        });
        match self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .expect("mock script exhausted")
        {
            MockReply::Text(text) => Ok(ModelOutput { text, usage: None }),
            MockReply::TextWithUsage(text, usage) => Ok(ModelOutput {
                text,
                usage: Some(usage),
            }),
            MockReply::Fail(message) => Err(ClientError::UploadFailed(message)),
        }
    }
}
