//! OpenAI-compatible chat-completions client (works against OpenAI-style
//! routers such as Requesty or a local gateway).
//!
//! Images travel inline as base64 data URLs. Responses are requested as a
//! stream and concatenated before returning; the caller only ever sees the
//! full text. When the endpoint supports structured output the schema is
//! sent as a `response_format` decoding constraint, otherwise it is
//! inlined into the system prompt and compliant JSON is expected back.

use std::io::{BufRead, BufReader};
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info_span};

use super::{ChatModelClient, ChatRequest, ClientError, ModelOutput, TokenUsage};
use crate::config::CHAT_TIMEOUT_SECS;
use crate::pipeline::prompt::with_schema_block;

pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
    structured_output: bool,
    stream: bool,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(CHAT_TIMEOUT_SECS))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
            timeout_secs: CHAT_TIMEOUT_SECS,
            structured_output: true,
            stream: true,
        }
    }

    /// Fallback mode for endpoints that reject `response_format`; the
    /// schema is inlined into the system prompt instead.
    pub fn without_structured_output(mut self) -> Self {
        self.structured_output = false;
        self
    }

    pub fn without_streaming(mut self) -> Self {
        self.stream = false;
        self
    }

    fn build_body(&self, request: &ChatRequest<'_>) -> Value {
        let system_prompt = match (request.schema, self.structured_output) {
            (Some(schema), false) => with_schema_block(request.system_prompt, schema),
            _ => request.system_prompt.to_string(),
        };

        let user_content: Value = if request.images.is_empty() {
            Value::String(request.user_text.to_string())
        } else {
            let mut parts = vec![json!({"type": "text", "text": request.user_text})];
            for url in request.images {
                parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
            }
            Value::Array(parts)
        };

        let mut body = json!({
            "model": request.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_content},
            ],
        });

        if self.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        if let (Some(schema), true) = (request.schema, self.structured_output) {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "description": schema.description,
                    "schema": schema.schema,
                    "strict": true,
                },
            });
        }

        body
    }

    fn map_send_error(&self, e: reqwest::Error) -> ClientError {
        if e.is_connect() {
            ClientError::Connection(self.base_url.clone())
        } else if e.is_timeout() {
            ClientError::Timeout {
                secs: self.timeout_secs,
            }
        } else {
            ClientError::Connection(e.to_string())
        }
    }
}

impl ChatModelClient for OpenAiCompatClient {
    fn complete(&self, request: &ChatRequest<'_>) -> Result<ModelOutput, ClientError> {
        let _span = info_span!(
            "chat_completion",
            model = %request.model,
            images = request.images.len(),
            structured = self.structured_output,
        )
        .entered();
        let start = Instant::now();

        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
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

        let (text, usage) = if self.stream {
            consume_sse(BufReader::new(response))?
        } else {
            let parsed: CompletionResponse = response
                .json()
                .map_err(|e| ClientError::ResponseParsing(e.to_string()))?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| {
                    ClientError::ResponseParsing("response carried no choices".into())
                })?;
            (text, parsed.usage)
        };

        let usage = usage.map(|u| {
            TokenUsage::from_counts(request.model, u.prompt_tokens, u.completion_tokens)
        });

        debug!(
            elapsed_ms = %start.elapsed().as_millis(),
            text_len = text.len(),
            has_usage = usage.is_some(),
            "Chat completion finished"
        );

        Ok(ModelOutput { text, usage })
    }
}

// ── Wire types ────────────────────────────────────────────

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize, Debug, PartialEq)]
struct WireUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

/// Extract the payload of one SSE line. `[DONE]` and non-data lines
/// yield `None`.
fn parse_sse_data(line: &str) -> Option<&str> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload.is_empty() || payload == "[DONE]" {
        return None;
    }
    Some(payload)
}

/// Drain a chat-completion SSE stream into the concatenated text plus the
/// usage figures from the terminal chunk (when the provider sends them).
fn consume_sse(reader: impl BufRead) -> Result<(String, Option<WireUsage>), ClientError> {
    let mut text = String::new();
    let mut usage = None;

    for line in reader.lines() {
        let line = line.map_err(ClientError::Io)?;
        let Some(payload) = parse_sse_data(&line) else {
            continue;
        };
        let chunk: StreamChunk = serde_json::from_str(payload)
            .map_err(|e| ClientError::ResponseParsing(format!("bad stream chunk: {e}")))?;
        for choice in chunk.choices {
            if let Some(delta) = choice.delta.content {
                text.push_str(&delta);
            }
        }
        if chunk.usage.is_some() {
            usage = chunk.usage;
        }
    }

    Ok((text, usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::schema::full_schema;

    #[test]
    fn sse_data_lines_parsed() {
        assert_eq!(parse_sse_data("data: {\"x\":1}"), Some("{\"x\":1}"));
        assert_eq!(parse_sse_data("data: [DONE]"), None);
        assert_eq!(parse_sse_data(": keep-alive"), None);
        assert_eq!(parse_sse_data(""), None);
    }

    #[test]
    fn sse_stream_concatenates_deltas() {
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"elem\"}}]}\n",
            "\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ents\\\":[]}\"}}]}\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":120,\"completion_tokens\":8,\"total_tokens\":128}}\n",
            "data: [DONE]\n",
        );
        let (text, usage) = consume_sse(stream.as_bytes()).unwrap();
        assert_eq!(text, "{\"elements\":[]}");
        assert_eq!(
            usage,
            Some(WireUsage {
                prompt_tokens: 120,
                completion_tokens: 8
            })
        );
    }

    #[test]
    fn sse_stream_without_usage() {
        let stream = "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\ndata: [DONE]\n";
        let (text, usage) = consume_sse(stream.as_bytes()).unwrap();
        assert_eq!(text, "hi");
        assert!(usage.is_none());
    }

    #[test]
    fn malformed_chunk_is_a_parse_error() {
        let stream = "data: {not json}\n";
        assert!(matches!(
            consume_sse(stream.as_bytes()),
            Err(ClientError::ResponseParsing(_))
        ));
    }

    #[test]
    fn structured_body_carries_response_format() {
        let client = OpenAiCompatClient::new("https://router.example/v1", "key");
        let schema = full_schema();
        let request = ChatRequest {
            model: "gpt-4o",
            system_prompt: "sys",
            user_text: "extract",
            images: &[],
            schema: Some(&schema),
        };
        let body = client.build_body(&request);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["name"], "ExtractionResult");
        assert_eq!(body["messages"][0]["content"], "sys");
    }

    #[test]
    fn fallback_body_inlines_schema_into_system_prompt() {
        let client =
            OpenAiCompatClient::new("https://router.example/v1", "key").without_structured_output();
        let schema = full_schema();
        let request = ChatRequest {
            model: "gpt-4o",
            system_prompt: "sys",
            user_text: "extract",
            images: &[],
            schema: Some(&schema),
        };
        let body = client.build_body(&request);
        assert!(body.get("response_format").is_none());
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("sys"));
        assert!(system.contains("```json"));
    }

    #[test]
    fn image_payload_uses_content_parts() {
        let client = OpenAiCompatClient::new("https://router.example/v1", "key");
        let images = vec![super::super::jpeg_data_url(b"page-1")];
        let request = ChatRequest {
            model: "gpt-4o",
            system_prompt: "sys",
            user_text: "extract",
            images: &images,
            schema: None,
        };
        let body = client.build_body(&request);
        let content = body["messages"][1]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
        assert!(content[1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn text_only_payload_is_a_plain_string() {
        let client = OpenAiCompatClient::new("https://router.example/v1", "key");
        let request = ChatRequest {
            model: "gpt-4o",
            system_prompt: "sys",
            user_text: "extract from transcript",
            images: &[],
            schema: None,
        };
        let body = client.build_body(&request);
        assert_eq!(body["messages"][1]["content"], "extract from transcript");
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = OpenAiCompatClient::new("https://router.example/v1/", "key");
        assert_eq!(client.base_url, "https://router.example/v1");
    }
}
