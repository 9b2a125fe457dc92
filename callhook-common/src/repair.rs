//! Recovery of near-valid JSON payloads.
//!
//! The call-tracking platform renders template variables that have no value as nothing at
//! all, which leaves bodies like `{"durationSec": ,"payout":}`. We try a strict parse
//! first and only when that fails rewrite the empty values to `null` and try once more.
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

// Order matters: the narrow forms go first so the catch-all never sees them.
static EMPTY_BEFORE_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s*,").unwrap());
static EMPTY_BEFORE_BRACE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s*\}").unwrap());
static EMPTY_AT_LINE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":\s*\r?\n\s*([,}])").unwrap());
static EMPTY_WITH_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r":\s+([,}])").unwrap());

/// Payloads that could not be parsed even after the repair pass.
/// Both texts are kept so that the failure can be diagnosed from the logs.
#[derive(Error, Debug)]
#[error("payload is not valid JSON after repair: {error}")]
pub struct RepairError {
    pub original: String,
    pub repaired: String,
    #[source]
    pub error: serde_json::Error,
}

/// A successfully parsed payload, and whether we had to rewrite it to get there.
#[derive(Debug, PartialEq)]
pub struct ParsedPayload {
    pub value: Value,
    pub repaired: bool,
}

/// Rewrite omitted scalar values into explicit `null`s.
pub fn fill_empty_values(raw: &str) -> String {
    let fixed = EMPTY_BEFORE_COMMA.replace_all(raw, ": null,");
    let fixed = EMPTY_BEFORE_BRACE.replace_all(&fixed, ": null}");
    let fixed = EMPTY_AT_LINE_END.replace_all(&fixed, ": null\n$1");
    let fixed = EMPTY_WITH_WHITESPACE.replace_all(&fixed, ": null$1");

    fixed.into_owned()
}

/// Parse a webhook body, repairing it once if the strict parse fails.
pub fn parse_payload(raw: &str) -> Result<ParsedPayload, RepairError> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        return Ok(ParsedPayload {
            value,
            repaired: false,
        });
    }

    let repaired = fill_empty_values(raw);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value) => Ok(ParsedPayload {
            value,
            repaired: true,
        }),
        Err(error) => Err(RepairError {
            original: raw.to_owned(),
            repaired,
            error,
        }),
    }
}
