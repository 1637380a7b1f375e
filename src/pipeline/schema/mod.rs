pub mod json_schema;
pub mod parser;

pub use json_schema::{elements_schema, full_schema, tests_schema, SchemaConstraint};
pub use parser::parse_extraction;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("No JSON object found in model output")]
    NoJsonObject,

    #[error("JSON does not match the extraction schema: {0}")]
    JsonParsing(String),
}

/// The normalized extraction output contract. This is exactly the shape
/// advertised to the model, either as a structured-output schema or as an
/// inlined JSON-schema block in the system prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub elements: Vec<ExtractedElement>,
    #[serde(default)]
    pub tests: Vec<ClinicalTest>,
    #[serde(default)]
    pub urine_details: Option<UrineDetails>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.tests.is_empty() && self.urine_details.is_none()
    }
}

/// Free-form label/value pair found on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedElement {
    pub label: String,
    pub value: String,
    /// 1-indexed page the element was found on.
    pub page_number: u32,
    /// `[ymin, xmin, ymax, xmax]`, normalized 0–1000 or absolute pixels.
    #[serde(default)]
    pub bounding_box: Option<Vec<i64>>,
}

/// One requested clinical test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalTest {
    pub description: String,
    #[serde(default)]
    pub sample_type: Option<String>,
    #[serde(default)]
    pub loinc_code: Option<String>,
    pub page_number: u32,
    #[serde(default)]
    pub bounding_box: Option<Vec<i64>>,
}

/// Urine collection details, present only when the document mentions a
/// urine sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrineDetails {
    pub collection_type: UrineCollectionType,
    #[serde(default)]
    pub volume: Option<String>,
    pub page_number: u32,
    #[serde(default)]
    pub bounding_box: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UrineCollectionType {
    #[serde(rename = "24h")]
    TwentyFourHour,
    Spot,
    Random,
}
