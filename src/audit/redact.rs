//! Command-line redaction for audit payloads
//!
//! `key=value` arguments and JSON object arguments whose key looks like a
//! secret have the value replaced by [`REDACTED`]. Everything else is kept.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replacement for secret values
pub const REDACTED: &str = "***";

const SECRET_MARKERS: &[&str] = &[
    "token",
    "secret",
    "password",
    "passwd",
    "apikey",
    "api_key",
    "api-key",
    "credential",
    "authorization",
    "private",
];

/// Redacted command line as stored in a sealed audit payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactedCommand {
    pub arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl RedactedCommand {
    pub fn new(arguments: &[String], context: Option<&str>) -> Self {
        Self {
            arguments: redact_arguments(arguments),
            context: context.map(str::to_string),
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn redact_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if is_secret_key(key) {
                    *inner = Value::String(REDACTED.to_string());
                } else {
                    redact_json(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_json),
        _ => {}
    }
}

fn redact_argument(arg: &str) -> String {
    if arg.starts_with('{') {
        if let Ok(mut value) = serde_json::from_str::<Value>(arg) {
            redact_json(&mut value);
            return value.to_string();
        }
    }
    match arg.split_once('=') {
        Some((key, _)) if is_secret_key(key) => format!("{}={}", key, REDACTED),
        _ => arg.to_string(),
    }
}

/// Redact secret-looking values in a list of arguments
pub fn redact_arguments(arguments: &[String]) -> Vec<String> {
    arguments.iter().map(|arg| redact_argument(arg)).collect()
}
