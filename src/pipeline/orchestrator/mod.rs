//! Extraction run orchestration.
//!
//! One run is a small state machine: `START → RASTERIZE → EXTRACT → DONE`,
//! where `EXTRACT` is one of three shapes — a per-page loop, a single
//! whole-document batch, or a split batch of two schema-constrained
//! requests merged all-or-nothing. Strategies share one runner
//! parameterized by the `Strategy` enum and the client trait seams; errors
//! are collected on the run, never thrown past it.

use serde::{Serialize, Serializer};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use super::client::{
    ChatModelClient, ChatRequest, DocumentModelClient, DocumentPrompt, ModelOutput, TokenUsage,
};
use super::prompt::{
    effective_system_prompt, ELEMENTS_ONLY_ADDENDUM, OCR_SYSTEM, TESTS_ONLY_ADDENDUM,
    TEXT_EXTRACTION_SYSTEM, USER_TEXT_ALL_PAGES, USER_TEXT_SINGLE_PAGE,
};
use super::rasterize::{PageImage, PageRasterizer, DEFAULT_RENDER_DPI};
use super::schema::{
    elements_schema, full_schema, parse_extraction, tests_schema, ExtractionResult,
};
use crate::config::DEFAULT_MODEL;
use crate::pipeline::client::jpeg_data_url;

/// How a run drives the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Per page: OCR transcript first, then text extraction over it.
    PerPageOcr,
    /// Per page: direct vision extraction from the page image.
    PerPageVision,
    /// One request carrying every page image.
    SingleBatchVision,
    /// Two schema-constrained requests over all page images, merged.
    SplitBatchVision,
    /// Whole document uploaded to the provider, one request.
    DocumentUploadBatch,
    /// Whole document uploaded, two schema-constrained requests, merged.
    DocumentUploadSplit,
}

impl Strategy {
    /// Human-readable source tag stored on each record.
    pub fn label(&self) -> &'static str {
        match self {
            Strategy::PerPageOcr => "OCR + Extraction",
            Strategy::PerPageVision => "Per-Page Vision",
            Strategy::SingleBatchVision => "Vision Single Batch",
            Strategy::SplitBatchVision => "Vision Split Batch",
            Strategy::DocumentUploadBatch => "Document Upload",
            Strategy::DocumentUploadSplit => "Document Upload Split",
        }
    }

    pub fn needs_document_client(&self) -> bool {
        matches!(
            self,
            Strategy::DocumentUploadBatch | Strategy::DocumentUploadSplit
        )
    }
}

/// Configuration for one extraction run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model: String,
    pub strategy: Strategy,
    pub system_prompt: Option<String>,
    pub dpi: u32,
}

impl RunConfig {
    pub fn builder(strategy: Strategy) -> RunConfigBuilder {
        RunConfigBuilder {
            model: DEFAULT_MODEL.to_string(),
            strategy,
            system_prompt: None,
            dpi: DEFAULT_RENDER_DPI,
        }
    }
}

/// Builder setting only the fields a given strategy needs.
pub struct RunConfigBuilder {
    model: String,
    strategy: Strategy,
    system_prompt: Option<String>,
    dpi: u32,
}

impl RunConfigBuilder {
    pub fn model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = Some(prompt.to_string());
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.dpi = dpi;
        self
    }

    pub fn build(self) -> RunConfig {
        RunConfig {
            model: self.model,
            strategy: self.strategy,
            system_prompt: self.system_prompt,
            dpi: self.dpi,
        }
    }
}

/// Which page a record covers: one page, or the whole document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRef {
    Page(u32),
    All,
}

impl Serialize for PageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PageRef::Page(n) => serializer.serialize_u32(*n),
            PageRef::All => serializer.serialize_str("All"),
        }
    }
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageRef::Page(n) => write!(f, "{n}"),
            PageRef::All => write!(f, "All"),
        }
    }
}

/// One unit of output: never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRecord {
    pub page: PageRef,
    pub content: ExtractionResult,
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

/// Mutable context threaded through one run.
///
/// Invariant: `cursor` is monotonically non-decreasing, bounded by
/// `pages.len()`, and advances exactly once per page attempt.
pub struct RunState {
    pub document: Vec<u8>,
    pub pages: Vec<PageImage>,
    pub cursor: usize,
    pub extracted: Vec<ExtractionRecord>,
    pub errors: Vec<String>,
    pub config: RunConfig,
}

impl RunState {
    fn new(document: Vec<u8>, config: RunConfig) -> Self {
        Self {
            document,
            pages: Vec::new(),
            cursor: 0,
            extracted: Vec::new(),
            errors: Vec::new(),
            config,
        }
    }

    fn advance_cursor(&mut self) {
        debug_assert!(self.cursor < self.pages.len());
        self.cursor += 1;
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            extracted_data: self.extracted,
            errors: self.errors,
            images: self.pages,
        }
    }
}

/// Terminal state exposed to the presenter.
pub struct RunOutcome {
    pub extracted_data: Vec<ExtractionRecord>,
    pub errors: Vec<String>,
    pub images: Vec<PageImage>,
}

/// Drives extraction runs. Trait objects for the rasterizer and clients
/// enable dependency injection.
pub struct ExtractionRunner {
    rasterizer: Box<dyn PageRasterizer + Send + Sync>,
    chat_client: Box<dyn ChatModelClient + Send + Sync>,
    document_client: Option<Box<dyn DocumentModelClient + Send + Sync>>,
}

impl ExtractionRunner {
    pub fn new(
        rasterizer: Box<dyn PageRasterizer + Send + Sync>,
        chat_client: Box<dyn ChatModelClient + Send + Sync>,
    ) -> Self {
        Self {
            rasterizer,
            chat_client,
            document_client: None,
        }
    }

    /// Attach a whole-document client for the upload strategies.
    pub fn with_document_client(
        mut self,
        client: Box<dyn DocumentModelClient + Send + Sync>,
    ) -> Self {
        self.document_client = Some(client);
        self
    }

    /// Run one extraction end to end. Never returns an error: every
    /// failure lands in the outcome's ordered error list.
    pub fn run(&self, document: Vec<u8>, config: RunConfig) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let _span = info_span!(
            "extraction_run",
            run_id = %run_id,
            strategy = config.strategy.label(),
            model = %config.model,
        )
        .entered();

        let mut state = RunState::new(document, config);

        // RASTERIZE — a conversion failure is terminal for the run.
        match self.rasterizer.rasterize(&state.document, state.config.dpi) {
            Ok(pages) => {
                info!(pages = pages.len(), "Converted document to page images");
                state.pages = pages;
            }
            Err(e) => {
                warn!(error = %e, "Document conversion failed");
                state.errors.push(format!("PDF Conversion Error: {e}"));
                return state.into_outcome();
            }
        }

        // Empty document: EXTRACT is skipped entirely, and that is not
        // an error.
        if state.pages.is_empty() {
            info!("Document has no pages; nothing to extract");
            return state.into_outcome();
        }

        match state.config.strategy {
            Strategy::PerPageVision | Strategy::PerPageOcr => self.extract_per_page(&mut state),
            Strategy::SingleBatchVision => self.extract_single_batch(&mut state),
            Strategy::SplitBatchVision => self.extract_split_batch(&mut state),
            Strategy::DocumentUploadBatch => self.extract_document_batch(&mut state),
            Strategy::DocumentUploadSplit => self.extract_document_split(&mut state),
        }

        info!(
            records = state.extracted.len(),
            errors = state.errors.len(),
            "Extraction run complete"
        );
        state.into_outcome()
    }

    // ── PER_PAGE_LOOP ──────────────────────────────────────

    /// One page per iteration; a failed page is skipped, never retried,
    /// and never blocks the rest. The cursor advances exactly once per
    /// attempt.
    fn extract_per_page(&self, state: &mut RunState) {
        let strategy = state.config.strategy;
        while state.cursor < state.pages.len() {
            let page_number = state.cursor as u32 + 1;
            debug!(page = page_number, "Extracting page");

            let attempt = match strategy {
                Strategy::PerPageOcr => self.attempt_ocr_page(state, state.cursor),
                _ => self.attempt_vision_page(state, state.cursor),
            };

            match attempt {
                Ok((content, usage)) => {
                    push_record(state, PageRef::Page(page_number), content, usage);
                }
                Err(message) => {
                    warn!(page = page_number, error = %message, "Page extraction failed");
                    state.errors.push(message);
                }
            }
            state.advance_cursor();
        }
    }

    fn attempt_vision_page(
        &self,
        state: &RunState,
        index: usize,
    ) -> Result<(ExtractionResult, Option<TokenUsage>), String> {
        let page_number = index as u32 + 1;
        let fail = |e: &dyn std::fmt::Display| {
            format!("Vision Extraction Error (page {page_number}): {e}")
        };

        let jpeg = state.pages[index].to_jpeg_bytes().map_err(|e| fail(&e))?;
        let images = vec![jpeg_data_url(&jpeg)];
        let schema = full_schema();
        let system = effective_system_prompt(state.config.system_prompt.as_deref(), None);

        let output = self
            .chat_client
            .complete(&ChatRequest {
                model: &state.config.model,
                system_prompt: &system,
                user_text: USER_TEXT_SINGLE_PAGE,
                images: &images,
                schema: Some(&schema),
            })
            .map_err(|e| fail(&e))?;

        let content = parse_extraction(&output.text).map_err(|e| fail(&e))?;
        Ok((content, output.usage))
    }

    /// Two chained calls: transcript first, then extraction over it.
    fn attempt_ocr_page(
        &self,
        state: &RunState,
        index: usize,
    ) -> Result<(ExtractionResult, Option<TokenUsage>), String> {
        let page_number = index as u32 + 1;
        let fail =
            |e: &dyn std::fmt::Display| format!("OCR Extraction Error (page {page_number}): {e}");

        let jpeg = state.pages[index].to_jpeg_bytes().map_err(|e| fail(&e))?;
        let images = vec![jpeg_data_url(&jpeg)];

        let ocr_output = self
            .chat_client
            .complete(&ChatRequest {
                model: &state.config.model,
                system_prompt: OCR_SYSTEM,
                user_text: "Transcribe this page.",
                images: &images,
                schema: None,
            })
            .map_err(|e| fail(&e))?;

        let schema = full_schema();
        let system = state
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| TEXT_EXTRACTION_SYSTEM.to_string());
        let transcript_prompt = format!(
            "This is the OCR transcript of page {page_number}. Use {page_number} as the page_number for every entry.\n\n{}",
            ocr_output.text
        );

        let extract_output = self
            .chat_client
            .complete(&ChatRequest {
                model: &state.config.model,
                system_prompt: &system,
                user_text: &transcript_prompt,
                images: &[],
                schema: Some(&schema),
            })
            .map_err(|e| fail(&e))?;

        let content = parse_extraction(&extract_output.text).map_err(|e| fail(&e))?;
        Ok((content, combine_usage(ocr_output.usage, extract_output.usage)))
    }

    // ── SINGLE_BATCH ───────────────────────────────────────

    /// One request carrying every page image; each leaf's own
    /// `page_number` disambiguates placement, never request position.
    fn extract_single_batch(&self, state: &mut RunState) {
        match self.batch_request(state, None) {
            Ok(output) => match parse_extraction(&output.text) {
                Ok(content) => push_record(state, PageRef::All, content, output.usage),
                Err(e) => state.errors.push(format!("Vision Extraction Error: {e}")),
            },
            Err(message) => state.errors.push(message),
        }
    }

    /// Issue one all-pages request, optionally constrained to a subset
    /// of the schema (split mode).
    fn batch_request(
        &self,
        state: &RunState,
        split: Option<SplitHalf>,
    ) -> Result<ModelOutput, String> {
        let fail = |e: &dyn std::fmt::Display| format!("Vision Extraction Error: {e}");

        let mut images = Vec::with_capacity(state.pages.len());
        for page in &state.pages {
            let jpeg = page.to_jpeg_bytes().map_err(|e| fail(&e))?;
            images.push(jpeg_data_url(&jpeg));
        }

        let (schema, addendum) = match split {
            None => (full_schema(), None),
            Some(SplitHalf::Elements) => (elements_schema(), Some(ELEMENTS_ONLY_ADDENDUM)),
            Some(SplitHalf::Tests) => (tests_schema(), Some(TESTS_ONLY_ADDENDUM)),
        };
        let system = effective_system_prompt(state.config.system_prompt.as_deref(), addendum);

        self.chat_client
            .complete(&ChatRequest {
                model: &state.config.model,
                system_prompt: &system,
                user_text: USER_TEXT_ALL_PAGES,
                images: &images,
                schema: Some(&schema),
            })
            .map_err(|e| fail(&e))
    }

    // ── SPLIT_BATCH ────────────────────────────────────────

    /// Two narrower requests against the same payload, merged
    /// field-by-field. All-or-nothing: a half-merged record is worse
    /// than none, so either failure discards both halves with one error.
    fn extract_split_batch(&self, state: &mut RunState) {
        let merged = self
            .batch_request(state, Some(SplitHalf::Elements))
            .and_then(|first| {
                let second = self.batch_request(state, Some(SplitHalf::Tests))?;
                merge_split_outputs(&first, &second)
            });

        match merged {
            Ok((content, usage)) => push_record(state, PageRef::All, content, usage),
            Err(message) => {
                warn!(error = %message, "Split batch failed; discarding both halves");
                state.errors.push(message);
            }
        }
    }

    // ── Document upload strategies ─────────────────────────

    fn require_document_client(
        &self,
    ) -> Result<&(dyn DocumentModelClient + Send + Sync), String> {
        self.document_client.as_deref().ok_or_else(|| {
            "Document Extraction Error: no document-upload client configured".to_string()
        })
    }

    fn extract_document_batch(&self, state: &mut RunState) {
        let fail = |e: &dyn std::fmt::Display| format!("Document Extraction Error: {e}");

        let outcome = self.require_document_client().and_then(|client| {
            let schema = full_schema();
            let system = effective_system_prompt(state.config.system_prompt.as_deref(), None);
            client
                .generate(
                    &state.config.model,
                    &system,
                    USER_TEXT_ALL_PAGES,
                    &state.document,
                    Some(&schema),
                )
                .map_err(|e| fail(&e))
        });

        match outcome {
            Ok(output) => match parse_extraction(&output.text) {
                Ok(content) => push_record(state, PageRef::All, content, output.usage),
                Err(e) => state.errors.push(fail(&e)),
            },
            Err(message) => state.errors.push(message),
        }
    }

    /// Split variant over one upload: both prompts run against the same
    /// remote handle, merged all-or-nothing like the vision split.
    fn extract_document_split(&self, state: &mut RunState) {
        let fail = |e: &dyn std::fmt::Display| format!("Document Extraction Error: {e}");

        let merged = self.require_document_client().and_then(|client| {
            let elements_constraint = elements_schema();
            let tests_constraint = tests_schema();
            let elements_system = effective_system_prompt(
                state.config.system_prompt.as_deref(),
                Some(ELEMENTS_ONLY_ADDENDUM),
            );
            let tests_system = effective_system_prompt(
                state.config.system_prompt.as_deref(),
                Some(TESTS_ONLY_ADDENDUM),
            );
            let prompts = [
                DocumentPrompt {
                    system_prompt: &elements_system,
                    user_text: USER_TEXT_ALL_PAGES,
                    schema: Some(&elements_constraint),
                },
                DocumentPrompt {
                    system_prompt: &tests_system,
                    user_text: USER_TEXT_ALL_PAGES,
                    schema: Some(&tests_constraint),
                },
            ];
            let outputs = client
                .generate_many(&state.config.model, &prompts, &state.document)
                .map_err(|e| fail(&e))?;
            match outputs.as_slice() {
                [first, second] => merge_split_outputs(first, second),
                _ => Err(fail(&"split generation returned the wrong number of outputs")),
            }
        });

        match merged {
            Ok((content, usage)) => push_record(state, PageRef::All, content, usage),
            Err(message) => {
                warn!(error = %message, "Split batch failed; discarding both halves");
                state.errors.push(message);
            }
        }
    }
}

/// Append one record to the run, noting empty model output. An empty
/// result is recorded like any other; it only rates a log line.
fn push_record(
    state: &mut RunState,
    page: PageRef,
    content: ExtractionResult,
    usage: Option<TokenUsage>,
) {
    if content.is_empty() {
        debug!(page = %page, "Model returned an empty extraction result");
    }
    state.extracted.push(ExtractionRecord {
        page,
        content,
        source: state.config.strategy.label(),
        usage,
    });
}

#[derive(Debug, Clone, Copy)]
enum SplitHalf {
    Elements,
    Tests,
}

/// Parse both split halves and merge: elements + urine from the first,
/// tests from the second.
fn merge_split_outputs(
    first: &ModelOutput,
    second: &ModelOutput,
) -> Result<(ExtractionResult, Option<TokenUsage>), String> {
    let elements_half = parse_extraction(&first.text)
        .map_err(|e| format!("Split Extraction Error (elements request): {e}"))?;
    let tests_half = parse_extraction(&second.text)
        .map_err(|e| format!("Split Extraction Error (tests request): {e}"))?;

    let content = ExtractionResult {
        elements: elements_half.elements,
        urine_details: elements_half.urine_details,
        tests: tests_half.tests,
    };
    Ok((content, combine_usage(first.usage, second.usage)))
}

/// Sum usage only when both sides report it; a half-summed figure would
/// misstate the run's cost.
fn combine_usage(a: Option<TokenUsage>, b: Option<TokenUsage>) -> Option<TokenUsage> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.sum(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pipeline::client::{MockChatClient, MockDocumentClient, MockReply};
    use crate::pipeline::rasterize::MockRasterizer;

    const PAGE_RESULT: &str = r#"{"elements":[{"label":"Patient","value":"Jane Doe","page_number":1,"bounding_box":[100,100,150,400]}],"tests":[],"urine_details":null}"#;

    const ELEMENTS_HALF: &str = r#"{"elements":[{"label":"Patient","value":"Jane Doe","page_number":1,"bounding_box":null}],"tests":[],"urine_details":{"collection_type":"24h","volume":"1200 mL","page_number":2,"bounding_box":null}}"#;

    const TESTS_HALF: &str = r#"{"elements":[],"tests":[{"description":"Hemoglobin A1c","sample_type":"Serum","loinc_code":"4548-4","page_number":1,"bounding_box":null}],"urine_details":null}"#;

    fn runner(pages: usize, chat: MockChatClient) -> ExtractionRunner {
        ExtractionRunner::new(Box::new(MockRasterizer::new(pages)), Box::new(chat))
    }

    // ── RASTERIZE failures and the empty document ──

    #[test]
    fn conversion_failure_is_terminal() {
        let runner = ExtractionRunner::new(
            Box::new(MockRasterizer::failing()),
            Box::new(MockChatClient::new()),
        );
        let config = RunConfig::builder(Strategy::PerPageVision).build();
        let outcome = runner.run(b"not a pdf".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert!(outcome.images.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("PDF Conversion Error:"));
    }

    #[test]
    fn empty_document_is_not_an_error() {
        let runner = runner(0, MockChatClient::new());
        let config = RunConfig::builder(Strategy::SingleBatchVision).build();
        let outcome = runner.run(vec![], config);

        assert!(outcome.extracted_data.is_empty());
        assert!(outcome.errors.is_empty());
        assert!(outcome.images.is_empty());
    }

    // ── PER_PAGE_LOOP ──

    #[test]
    fn per_page_failure_skips_page_and_continues() {
        let chat = MockChatClient::new()
            .push_text(PAGE_RESULT)
            .push_failure("rate limited")
            .push_text(PAGE_RESULT);
        let runner = runner(3, chat);
        let config = RunConfig::builder(Strategy::PerPageVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert_eq!(outcome.extracted_data.len(), 2);
        assert_eq!(outcome.extracted_data[0].page, PageRef::Page(1));
        assert_eq!(outcome.extracted_data[1].page, PageRef::Page(3));
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("page 2"), "{}", outcome.errors[0]);
        assert_eq!(outcome.images.len(), 3);
    }

    #[test]
    fn per_page_unparseable_output_is_one_error() {
        let chat = MockChatClient::new().push_text("Sorry, I cannot help with that.");
        let runner = runner(1, chat);
        let config = RunConfig::builder(Strategy::PerPageVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("page 1"));
    }

    #[test]
    fn per_page_records_carry_source_and_schema() {
        let chat = MockChatClient::new().push_text(PAGE_RESULT);
        let runner = runner(1, chat);
        let config = RunConfig::builder(Strategy::PerPageVision)
            .model("gpt-4o")
            .build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert_eq!(outcome.extracted_data[0].source, "Per-Page Vision");
        assert_eq!(outcome.extracted_data[0].content.elements.len(), 1);
    }

    #[test]
    fn ocr_strategy_chains_transcription_and_extraction() {
        let chat = Arc::new(
            MockChatClient::new()
                .push_text("# Page transcript\nPatient: Jane Doe")
                .push_text(PAGE_RESULT),
        );
        let runner =
            ExtractionRunner::new(Box::new(MockRasterizer::new(1)), Box::new(chat.clone()));
        let config = RunConfig::builder(Strategy::PerPageOcr).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted_data.len(), 1);
        assert_eq!(outcome.extracted_data[0].source, "OCR + Extraction");

        let calls = chat.calls();
        assert_eq!(calls.len(), 2);
        // First call transcribes with the image and no schema; second
        // extracts from the transcript text alone.
        assert_eq!(calls[0].image_count, 1);
        assert!(calls[0].schema_name.is_none());
        assert_eq!(calls[1].image_count, 0);
        assert_eq!(calls[1].schema_name, Some("ExtractionResult"));
    }

    #[test]
    fn split_batch_narrows_schema_per_request() {
        let chat = Arc::new(
            MockChatClient::new()
                .push_text(ELEMENTS_HALF)
                .push_text(TESTS_HALF),
        );
        let runner =
            ExtractionRunner::new(Box::new(MockRasterizer::new(1)), Box::new(chat.clone()));
        let config = RunConfig::builder(Strategy::SplitBatchVision).build();
        let _ = runner.run(b"%PDF".to_vec(), config);

        let calls = chat.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].schema_name, Some("ExtractionElements"));
        assert_eq!(calls[1].schema_name, Some("ExtractionTests"));
        assert!(calls[0].system_prompt.contains("ONLY the labeled elements"));
        assert!(calls[1].system_prompt.contains("ONLY the requested clinical tests"));
    }

    // ── SINGLE_BATCH ──

    #[test]
    fn single_batch_end_to_end_two_pages() {
        // 2-page document, model returns one element on page 1:
        // exactly one record tagged "All", zero errors.
        let chat = MockChatClient::new().push_text(PAGE_RESULT);
        let runner = runner(2, chat);
        let config = RunConfig::builder(Strategy::SingleBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert_eq!(outcome.extracted_data.len(), 1);
        let record = &outcome.extracted_data[0];
        assert_eq!(record.page, PageRef::All);
        assert_eq!(record.content.elements.len(), 1);
        assert_eq!(record.content.elements[0].page_number, 1);
        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.images.len(), 2);
    }

    #[test]
    fn single_batch_failure_means_no_records() {
        let chat = MockChatClient::new().push_failure("model overloaded");
        let runner = runner(2, chat);
        let config = RunConfig::builder(Strategy::SingleBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }

    // ── SPLIT_BATCH ──

    #[test]
    fn split_batch_merges_both_halves() {
        let chat = MockChatClient::new()
            .push_reply(MockReply::TextWithUsage(
                ELEMENTS_HALF.into(),
                TokenUsage::from_counts("gpt-4o-mini", 1000, 100),
            ))
            .push_reply(MockReply::TextWithUsage(
                TESTS_HALF.into(),
                TokenUsage::from_counts("gpt-4o-mini", 1000, 50),
            ));
        let runner = runner(2, chat);
        let config = RunConfig::builder(Strategy::SplitBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted_data.len(), 1);
        let record = &outcome.extracted_data[0];
        assert_eq!(record.page, PageRef::All);
        assert_eq!(record.content.elements.len(), 1);
        assert_eq!(record.content.tests.len(), 1);
        assert_eq!(record.content.tests[0].description, "Hemoglobin A1c");
        assert!(record.content.urine_details.is_some());
        let usage = record.usage.unwrap();
        assert_eq!(usage.input_tokens, 2000);
        assert_eq!(usage.output_tokens, 150);
    }

    #[test]
    fn split_batch_second_failure_discards_first_half() {
        // Request 1 succeeds, request 2 fails to parse: no records,
        // one error, elements from request 1 discarded.
        let chat = MockChatClient::new()
            .push_text(ELEMENTS_HALF)
            .push_text("I had trouble reading the tests section.");
        let runner = runner(2, chat);
        let config = RunConfig::builder(Strategy::SplitBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("tests request"));
    }

    #[test]
    fn split_batch_first_failure_is_one_error() {
        let chat = MockChatClient::new().push_failure("boom");
        let runner = runner(1, chat);
        let config = RunConfig::builder(Strategy::SplitBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert_eq!(outcome.errors.len(), 1);
    }

    #[test]
    fn split_usage_absent_when_either_half_lacks_it() {
        let chat = MockChatClient::new()
            .push_text(ELEMENTS_HALF)
            .push_text(TESTS_HALF);
        let runner = runner(1, chat);
        let config = RunConfig::builder(Strategy::SplitBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);
        assert!(outcome.extracted_data[0].usage.is_none());
    }

    // ── Document upload strategies ──

    #[test]
    fn document_batch_uses_document_client() {
        let doc_client = MockDocumentClient::new().push_text(PAGE_RESULT);
        let runner = ExtractionRunner::new(
            Box::new(MockRasterizer::new(2)),
            Box::new(MockChatClient::new()),
        )
        .with_document_client(Box::new(doc_client));
        let config = RunConfig::builder(Strategy::DocumentUploadBatch)
            .model("gemini-3-pro-preview")
            .build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted_data.len(), 1);
        assert_eq!(outcome.extracted_data[0].page, PageRef::All);
        assert_eq!(outcome.extracted_data[0].source, "Document Upload");
    }

    #[test]
    fn document_split_merges_halves() {
        let doc_client = MockDocumentClient::new()
            .push_text(ELEMENTS_HALF)
            .push_text(TESTS_HALF);
        let runner = ExtractionRunner::new(
            Box::new(MockRasterizer::new(1)),
            Box::new(MockChatClient::new()),
        )
        .with_document_client(Box::new(doc_client));
        let config = RunConfig::builder(Strategy::DocumentUploadSplit).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        let record = &outcome.extracted_data[0];
        assert_eq!(record.content.elements.len(), 1);
        assert_eq!(record.content.tests.len(), 1);
    }

    #[test]
    fn document_split_issues_both_prompts_against_one_document() {
        let doc_client = Arc::new(
            MockDocumentClient::new()
                .push_text(ELEMENTS_HALF)
                .push_text(TESTS_HALF),
        );
        let runner = ExtractionRunner::new(
            Box::new(MockRasterizer::new(1)),
            Box::new(MockChatClient::new()),
        )
        .with_document_client(Box::new(doc_client.clone()));
        let config = RunConfig::builder(Strategy::DocumentUploadSplit).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted_data.len(), 1);
        let calls = doc_client.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].schema_name, Some("ExtractionElements"));
        assert_eq!(calls[1].schema_name, Some("ExtractionTests"));
    }

    #[test]
    fn empty_model_output_still_produces_a_record() {
        let chat = MockChatClient::new().push_text("{}");
        let runner = runner(1, chat);
        let config = RunConfig::builder(Strategy::SingleBatchVision).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.extracted_data.len(), 1);
        assert!(outcome.extracted_data[0].content.is_empty());
    }

    #[test]
    fn upload_strategy_without_client_is_one_error() {
        let runner = runner(1, MockChatClient::new());
        let config = RunConfig::builder(Strategy::DocumentUploadBatch).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert!(outcome.extracted_data.is_empty());
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("no document-upload client"));
    }

    #[test]
    fn upload_failure_is_recorded_not_thrown() {
        let doc_client = MockDocumentClient::new().push_failure("file never became active");
        let runner = ExtractionRunner::new(
            Box::new(MockRasterizer::new(1)),
            Box::new(MockChatClient::new()),
        )
        .with_document_client(Box::new(doc_client));
        let config = RunConfig::builder(Strategy::DocumentUploadBatch).build();
        let outcome = runner.run(b"%PDF".to_vec(), config);

        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("Document Extraction Error:"));
    }

    // ── Configuration and record shape ──

    #[test]
    fn builder_defaults() {
        let config = RunConfig::builder(Strategy::PerPageVision).build();
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.dpi, DEFAULT_RENDER_DPI);
        assert!(config.system_prompt.is_none());
    }

    #[test]
    fn system_prompt_override_reaches_the_model() {
        let chat = MockChatClient::new().push_text(PAGE_RESULT);
        let runner = ExtractionRunner::new(Box::new(MockRasterizer::new(1)), Box::new(chat));
        let config = RunConfig::builder(Strategy::PerPageVision)
            .system_prompt("Extract only the patient block.")
            .build();
        let _ = runner.run(b"%PDF".to_vec(), config);
        // Prompt composition is covered directly:
        let composed = effective_system_prompt(Some("Extract only the patient block."), None);
        assert_eq!(composed, "Extract only the patient block.");
    }

    #[test]
    fn page_ref_serializes_as_number_or_all() {
        assert_eq!(serde_json::to_string(&PageRef::Page(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&PageRef::All).unwrap(), "\"All\"");
    }

    #[test]
    fn record_serializes_without_absent_usage() {
        let record = ExtractionRecord {
            page: PageRef::Page(1),
            content: ExtractionResult::default(),
            source: "Per-Page Vision",
            usage: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["page"], 1);
        assert!(json.get("usage").is_none());
    }
}
