//! Outbound boundary to the AI generation provider.

pub mod http;
pub mod stub;

pub use http::{HttpProviderConfig, HttpProviderGateway};
pub use stub::StubProviderGateway;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Provider's answer to a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitResponse {
    /// Task id the provider will echo back in its callbacks.
    pub provider_job_id: String,
    /// Raw status string; interpret with `map_provider_status`.
    pub initial_status: String,
    pub raw: JsonValue,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider answered with a non-success HTTP status.
    #[error("provider rejected request ({status}): {message}")]
    Request { status: u16, message: String },

    #[error("provider unreachable: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// HTTP status to surface to the end user, when the provider gave one.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ProviderError::Request { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProviderError::Request { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait::async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Submit one generation request. A single attempt; no retries.
    async fn submit(
        &self,
        model_id: &str,
        payload: JsonValue,
    ) -> Result<SubmitResponse, ProviderError>;
}

/// Status assumed when a submission response carries none.
const DEFAULT_INITIAL_STATUS: &str = "CREATED";

/// Read the task id and status from a submission response body.
///
/// Accepts the fields at the top level or inside a `data` envelope.
pub fn parse_submit_response(raw: JsonValue) -> Result<SubmitResponse, ProviderError> {
    let empty = Map::new();
    let root = raw.as_object().ok_or_else(|| {
        ProviderError::InvalidResponse("response is not a json object".to_string())
    })?;
    let data = root.get("data").and_then(JsonValue::as_object).unwrap_or(&empty);

    let field = |key: &str| {
        data.get(key)
            .or_else(|| root.get(key))
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let provider_job_id = field("task_id")
        .or_else(|| field("taskId"))
        .ok_or_else(|| ProviderError::InvalidResponse("missing task_id".to_string()))?;
    let initial_status = field("status").unwrap_or_else(|| DEFAULT_INITIAL_STATUS.to_string());

    Ok(SubmitResponse {
        provider_job_id,
        initial_status,
        raw,
    })
}
