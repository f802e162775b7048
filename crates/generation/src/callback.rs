//! Provider callback (webhook) payload parsing.
//!
//! Accepted shapes:
//! - flat object, or an object wrapping the fields in a `data` envelope
//! - task id under `task_id` or `taskId`
//! - `status` as a string
//! - asset URLs under `generated` (list), `outputs` (list) or `url` (single),
//!   first non-empty shape wins; list items are strings or `{ "url": ... }`
//! - `error` of any shape

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

const TASK_ID_KEYS: [&str; 2] = ["task_id", "taskId"];
const LIST_URL_KEYS: [&str; 2] = ["generated", "outputs"];
const SINGLE_URL_KEY: &str = "url";
const ERROR_MESSAGE_KEYS: [&str; 3] = ["message", "detail", "error"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallbackParseError {
    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("payload must be a json object")]
    NotAnObject,

    #[error("missing task identifier (task_id or taskId)")]
    MissingTaskId,

    #[error("missing status")]
    MissingStatus,
}

/// Fields the reconciler reads from a provider callback.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCallback {
    pub task_id: String,
    pub status: String,
    pub output_urls: Vec<String>,
    pub error_message: Option<String>,
    /// Full inbound body, kept for the audit trail.
    pub raw: JsonValue,
}

pub fn parse_callback(body: &[u8]) -> Result<ProviderCallback, CallbackParseError> {
    let raw: JsonValue =
        serde_json::from_slice(body).map_err(|e| CallbackParseError::MalformedJson(e.to_string()))?;

    let root = raw.as_object().ok_or(CallbackParseError::NotAnObject)?;
    let fields = root
        .get("data")
        .and_then(JsonValue::as_object)
        .unwrap_or(root);

    let task_id = TASK_ID_KEYS
        .iter()
        .find_map(|k| non_empty_str(fields.get(*k)))
        .ok_or(CallbackParseError::MissingTaskId)?;

    let status = fields
        .get("status")
        .and_then(JsonValue::as_str)
        .ok_or(CallbackParseError::MissingStatus)?
        .to_string();

    let output_urls = extract_output_urls(fields);
    let error_message = fields.get("error").and_then(normalize_error);

    Ok(ProviderCallback {
        task_id,
        status,
        output_urls,
        error_message,
        raw,
    })
}

/// Asset URLs in priority order: `generated`, `outputs`, then `url`.
pub fn extract_output_urls(fields: &Map<String, JsonValue>) -> Vec<String> {
    for key in LIST_URL_KEYS {
        if let Some(JsonValue::Array(items)) = fields.get(key) {
            let urls: Vec<String> = items.iter().filter_map(url_of).collect();
            if !urls.is_empty() {
                return dedup_preserving_order(urls);
            }
        }
    }

    non_empty_str(fields.get(SINGLE_URL_KEY))
        .map(|u| vec![u])
        .unwrap_or_default()
}

/// Human-readable message from whatever error shape the provider sent.
pub fn normalize_error(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        JsonValue::Object(obj) => ERROR_MESSAGE_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(normalize_error))
            .or_else(|| Some(value.to_string())),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(normalize_error).collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        other => Some(other.to_string()),
    }
}

fn url_of(item: &JsonValue) -> Option<String> {
    match item {
        JsonValue::String(_) => non_empty_str(Some(item)),
        JsonValue::Object(obj) => non_empty_str(obj.get(SINGLE_URL_KEY)),
        _ => None,
    }
}

fn non_empty_str(value: Option<&JsonValue>) -> Option<String> {
    value
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn dedup_preserving_order(urls: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    urls.into_iter().filter(|u| seen.insert(u.clone())).collect()
}
