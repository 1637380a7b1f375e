//! System prompts for the extraction strategies.
//!
//! Prompts are in-crate constants; the run configuration can override the
//! extraction system prompt per run.

use super::schema::SchemaConstraint;

/// System prompt for direct vision extraction (single page or batch).
pub const VISION_EXTRACTION_SYSTEM: &str = "\
You are a clinical document data extractor. You receive page images of a \
clinical analysis request (lab order, petición de análisis) and extract \
every labeled field you can read: patient identity, requesting physician, \
dates, sample identifiers, and the requested clinical tests.\n\
Rules:\n\
- Report each field as an element with its label exactly as printed and its value.\n\
- Report each requested test separately, with sample type and LOINC code when identifiable.\n\
- Report urine collection details (24h, Spot, Random) when the document mentions a urine sample.\n\
- Every entry carries the 1-indexed page_number of the page it appears on.\n\
- When you can locate an entry visually, include its bounding box as \
[ymin, xmin, ymax, xmax] on a 0-1000 grid normalized to the page; otherwise use null.\n\
- Never invent values. Omit what you cannot read.";

/// System prompt for the OCR pass of the OCR-then-extract strategy.
pub const OCR_SYSTEM: &str = "\
You are a medical document transcriber. Extract ALL visible text from the \
provided page image as structured Markdown. Preserve tables using Markdown \
table syntax and headers using # syntax. Be thorough and accurate. Output \
only the transcription.";

/// System prompt for the text-extraction pass over OCR output.
pub const TEXT_EXTRACTION_SYSTEM: &str = "\
You are a clinical document data extractor. You receive the OCR transcript \
of one page of a clinical analysis request. Extract every labeled field, \
every requested test, and any urine collection details. Every entry carries \
the given page_number. Bounding boxes are not available from a transcript; \
set bounding_box to null. Never invent values.";

/// User-message text for single-page payloads.
pub const USER_TEXT_SINGLE_PAGE: &str = "Extract the clinical data from this document.";

/// User-message text for whole-document payloads.
pub const USER_TEXT_ALL_PAGES: &str =
    "Extract the clinical data from this document. The document is provided as a series of images.";

/// Addendum constraining a split request to elements + urine details.
pub const ELEMENTS_ONLY_ADDENDUM: &str = "\
For this request, extract ONLY the labeled elements and urine details. \
Return `tests` as an empty array.";

/// Addendum constraining a split request to tests.
pub const TESTS_ONLY_ADDENDUM: &str = "\
For this request, extract ONLY the requested clinical tests. \
Return `elements` as an empty array and omit urine details.";

/// Fallback-mode system prompt: the schema is appended as text when the
/// provider cannot take it as a decoding constraint.
pub fn with_schema_block(system_prompt: &str, schema: &SchemaConstraint) -> String {
    format!("{system_prompt}\n\n{}", schema.as_prompt_block())
}

/// Compose the effective extraction system prompt for a run.
pub fn effective_system_prompt(override_prompt: Option<&str>, addendum: Option<&str>) -> String {
    let base = override_prompt.unwrap_or(VISION_EXTRACTION_SYSTEM);
    match addendum {
        Some(extra) => format!("{base}\n\n{extra}"),
        None => base.to_string(),
    }
}
