//! Pipeline-wide constants: log filter, request timeouts, the named-color
//! table used for annotation overlays, and the per-model cost table used
//! for usage estimates.

pub const APP_NAME: &str = "clinex";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> &'static str {
    "info,clinex=debug"
}

/// Default model id when the caller does not name one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Per-request timeout for inline-image chat completions.
pub const CHAT_TIMEOUT_SECS: u64 = 300;

/// Per-request timeout for document-upload provider calls.
pub const UPLOAD_TIMEOUT_SECS: u64 = 600;

/// Interval between remote-file state polls.
pub const UPLOAD_POLL_INTERVAL_SECS: u64 = 2;

/// Ceiling on total time waiting for an uploaded document to become
/// active. Past this the upload fails; the poll loop never runs unbounded.
pub const UPLOAD_POLL_CEILING_SECS: u64 = 120;

// ── Annotation colors ───────────────────────────────────────────────────────

/// Named colors accepted by the annotator, as RGB triples.
pub const NAMED_COLORS: &[(&str, [u8; 3])] = &[
    ("red", [255, 0, 0]),
    ("green", [0, 170, 0]),
    ("blue", [0, 90, 255]),
    ("yellow", [255, 200, 0]),
    ("purple", [156, 39, 176]),
    ("orange", [255, 120, 0]),
    ("gold", [212, 175, 55]),
];

/// Resolve a symbolic color name or `#rrggbb` hex string to RGB.
/// Unknown names fall back to red.
pub fn resolve_color(name: &str) -> [u8; 3] {
    let lower = name.trim().to_ascii_lowercase();
    if let Some(hex) = lower.strip_prefix('#') {
        if hex.len() == 6 {
            if let (Ok(r), Ok(g), Ok(b)) = (
                u8::from_str_radix(&hex[0..2], 16),
                u8::from_str_radix(&hex[2..4], 16),
                u8::from_str_radix(&hex[4..6], 16),
            ) {
                return [r, g, b];
            }
        }
    }
    NAMED_COLORS
        .iter()
        .find(|(n, _)| *n == lower)
        .map(|(_, rgb)| *rgb)
        .unwrap_or([255, 0, 0])
}

// ── Model cost table ────────────────────────────────────────────────────────

/// USD per 1M tokens (input, output), matched by model-id substring.
/// Unlisted models estimate at zero rather than guessing.
const MODEL_COSTS: &[(&str, f64, f64)] = &[
    ("gemini-3-pro", 2.0, 12.0),
    ("gemini-2.5-pro", 1.25, 10.0),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.0),
    ("claude-3-5-sonnet", 3.0, 15.0),
];

/// Estimate the USD cost of a request from token counts.
pub fn estimate_cost_usd(model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let lower = model.to_ascii_lowercase();
    for (needle, input_rate, output_rate) in MODEL_COSTS {
        if lower.contains(needle) {
            return (input_tokens as f64 * input_rate + output_tokens as f64 * output_rate)
                / 1_000_000.0;
        }
    }
    0.0
}
