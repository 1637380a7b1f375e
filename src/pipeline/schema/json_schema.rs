//! JSON-schema objects advertised to the model.
//!
//! Built by hand (no `$defs`/`$ref` — several routers reject them) in the
//! same wire shape as `ExtractionResult`. Three variants exist because
//! split-batch strategies constrain each request to a subset of the
//! schema: the full contract, elements+urine with tests forced empty, and
//! tests only.

use serde_json::{json, Value};

/// A schema handed to the model client, either as a structured-output
/// decoding constraint or inlined into the system prompt (fallback mode).
#[derive(Debug, Clone)]
pub struct SchemaConstraint {
    pub name: &'static str,
    pub description: &'static str,
    pub schema: Value,
}

impl SchemaConstraint {
    /// Textual rendering for providers without structured output: the
    /// schema is appended to the system prompt and compliant JSON is
    /// expected back.
    pub fn as_prompt_block(&self) -> String {
        format!(
            "Respond with a single JSON object and nothing else. It must conform to this JSON schema ({}):\n```json\n{}\n```",
            self.description,
            serde_json::to_string_pretty(&self.schema).unwrap_or_default()
        )
    }
}

fn bounding_box_property() -> Value {
    json!({
        "type": ["array", "null"],
        "items": {"type": "integer"},
        "description": "The bounding box [ymin, xmin, ymax, xmax] on a 0-1000 normalized grid, or null"
    })
}

fn page_number_property() -> Value {
    json!({
        "type": "integer",
        "description": "The page number where this entry was found (1-indexed)"
    })
}

// Strict structured-output decoding (OpenAI dialect) demands that every
// object list ALL of its properties in `required` and forbid extras via
// `additionalProperties: false`; optionality is expressed only through
// `["T", "null"]` type unions. Schemas violating that are rejected with
// HTTP 400 before any extraction runs.

fn elements_property() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "label": {
                    "type": "string",
                    "description": "The label of the extracted element, e.g., 'NombreApellidos'"
                },
                "value": {"type": "string", "description": "The extracted value"},
                "page_number": page_number_property(),
                "bounding_box": bounding_box_property()
            },
            "required": ["label", "value", "page_number", "bounding_box"],
            "additionalProperties": false
        }
    })
}

fn tests_property() -> Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "description": {"type": "string", "description": "The test as written in the document"},
                "sample_type": {"type": ["string", "null"], "description": "Sample type, e.g. 'Serum', 'Whole blood'"},
                "loinc_code": {"type": ["string", "null"], "description": "LOINC code if identifiable"},
                "page_number": page_number_property(),
                "bounding_box": bounding_box_property()
            },
            "required": ["description", "sample_type", "loinc_code", "page_number", "bounding_box"],
            "additionalProperties": false
        }
    })
}

fn urine_details_property() -> Value {
    json!({
        "type": ["object", "null"],
        "properties": {
            "collection_type": {
                "type": "string",
                "enum": ["24h", "Spot", "Random"],
                "description": "How the urine sample was collected"
            },
            "volume": {"type": ["string", "null"], "description": "Collected volume if stated"},
            "page_number": page_number_property(),
            "bounding_box": bounding_box_property()
        },
        "required": ["collection_type", "volume", "page_number", "bounding_box"],
        "additionalProperties": false
    })
}

/// A `tests`/`elements` slot pinned to the empty array in the split
/// variants.
fn empty_array_property() -> Value {
    json!({
        "type": "array",
        "items": {"type": "string"},
        "maxItems": 0,
        "description": "Must be an empty array"
    })
}

/// The full extraction contract: elements, tests, and urine details.
pub fn full_schema() -> SchemaConstraint {
    SchemaConstraint {
        name: "ExtractionResult",
        description: "Extraction result containing elements, clinical tests and urine details",
        schema: json!({
            "type": "object",
            "properties": {
                "elements": elements_property(),
                "tests": tests_property(),
                "urine_details": urine_details_property()
            },
            "required": ["elements", "tests", "urine_details"],
            "additionalProperties": false
        }),
    }
}

/// Elements + urine details only; `tests` is pinned to an empty array so
/// the model cannot spend its budget there.
pub fn elements_schema() -> SchemaConstraint {
    SchemaConstraint {
        name: "ExtractionElements",
        description: "Extraction result limited to elements and urine details; tests must be empty",
        schema: json!({
            "type": "object",
            "properties": {
                "elements": elements_property(),
                "tests": empty_array_property(),
                "urine_details": urine_details_property()
            },
            "required": ["elements", "tests", "urine_details"],
            "additionalProperties": false
        }),
    }
}

/// Tests only; elements pinned empty.
pub fn tests_schema() -> SchemaConstraint {
    SchemaConstraint {
        name: "ExtractionTests",
        description: "Extraction result limited to clinical tests; elements must be empty",
        schema: json!({
            "type": "object",
            "properties": {
                "elements": empty_array_property(),
                "tests": tests_property()
            },
            "required": ["elements", "tests"],
            "additionalProperties": false
        }),
    }
}
