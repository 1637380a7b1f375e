//! Tolerant recovery of `ExtractionResult` JSON from model output.
//!
//! Models wrap payloads in markdown fences and surround them with prose.
//! Recovery order: strip any code fences, slice from the first `{` to the
//! last `}`, then decode strictly against the schema. An unlocatable or
//! undecodable payload is always an error — never a silent empty result.

use tracing::debug;

use super::{ExtractionResult, SchemaError};

/// Parse raw model output into an `ExtractionResult`.
pub fn parse_extraction(raw: &str) -> Result<ExtractionResult, SchemaError> {
    let candidate = extract_json_payload(raw)?;
    let result: ExtractionResult = serde_json::from_str(candidate)
        .map_err(|e| SchemaError::JsonParsing(e.to_string()))?;
    debug!(
        elements = result.elements.len(),
        tests = result.tests.len(),
        has_urine = result.urine_details.is_some(),
        "Parsed extraction result"
    );
    Ok(result)
}

/// Locate the JSON object inside possibly fenced, prose-wrapped output.
fn extract_json_payload(raw: &str) -> Result<&str, SchemaError> {
    let mut text = raw.trim();

    // Strip a leading ``` or ```json fence and its closing fence.
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        text = rest.rsplit_once("```").map(|(body, _)| body).unwrap_or(rest);
        text = text.trim();
    }

    let start = text.find('{').ok_or(SchemaError::NoJsonObject)?;
    let end = text.rfind('}').ok_or(SchemaError::NoJsonObject)?;
    if end < start {
        return Err(SchemaError::NoJsonObject);
    }
    Ok(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{"elements":[{"label":"Patient","value":"Jane Doe","page_number":1,"bounding_box":[100,100,150,400]}],"tests":[],"urine_details":null}"#;

    #[test]
    fn plain_json_parses() {
        let result = parse_extraction(VALID).unwrap();
        assert_eq!(result.elements.len(), 1);
        assert_eq!(result.elements[0].label, "Patient");
        assert_eq!(
            result.elements[0].bounding_box.as_deref(),
            Some(&[100, 100, 150, 400][..])
        );
    }

    #[test]
    fn fenced_json_parses() {
        let fenced = format!("```json\n{VALID}\n```");
        let result = parse_extraction(&fenced).unwrap();
        assert_eq!(result.elements.len(), 1);
    }

    #[test]
    fn bare_fence_parses() {
        let fenced = format!("```\n{VALID}\n```");
        assert!(parse_extraction(&fenced).is_ok());
    }

    #[test]
    fn prose_around_json_parses() {
        let wrapped = format!("Here is the extracted data:\n\n{VALID}\n\nLet me know if you need anything else.");
        let result = parse_extraction(&wrapped).unwrap();
        assert_eq!(result.elements[0].value, "Jane Doe");
    }

    #[test]
    fn round_trip_equals() {
        let result = parse_extraction(VALID).unwrap();
        let json = serde_json::to_string(&result).unwrap();
        let back = parse_extraction(&json).unwrap();
        assert_eq!(result, back);
    }

    #[test]
    fn missing_arrays_default_to_empty() {
        let result = parse_extraction(r#"{"elements":[]}"#).unwrap();
        assert!(result.tests.is_empty());
        assert!(result.urine_details.is_none());
    }

    #[test]
    fn no_json_object_is_an_error() {
        let err = parse_extraction("I could not read the document, sorry.").unwrap_err();
        assert!(matches!(err, SchemaError::NoJsonObject));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(
            parse_extraction(""),
            Err(SchemaError::NoJsonObject)
        ));
    }

    #[test]
    fn type_mismatch_is_a_parse_error() {
        // page_number as a string violates the schema.
        let bad = r#"{"elements":[{"label":"a","value":"b","page_number":"one"}]}"#;
        let err = parse_extraction(bad).unwrap_err();
        assert!(matches!(err, SchemaError::JsonParsing(_)));
    }

    #[test]
    fn truncated_json_is_a_parse_error() {
        let truncated = r#"{"elements":[{"label":"a","value":"b"}"#;
        // rfind('}') lands inside the array, decode then fails.
        let err = parse_extraction(truncated).unwrap_err();
        assert!(matches!(err, SchemaError::JsonParsing(_)));
    }

    #[test]
    fn urine_details_decodes() {
        let raw = r#"{"elements":[],"tests":[],"urine_details":{"collection_type":"24h","volume":"900 mL","page_number":2,"bounding_box":null}}"#;
        let result = parse_extraction(raw).unwrap();
        let urine = result.urine_details.unwrap();
        assert_eq!(urine.volume.as_deref(), Some("900 mL"));
        assert_eq!(urine.page_number, 2);
    }
}
