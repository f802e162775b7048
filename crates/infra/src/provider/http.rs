use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{info, instrument, warn};

use genforge_generation::callback::normalize_error;

use super::{parse_submit_response, ProviderError, ProviderGateway, SubmitResponse};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub base_url: String,
    pub api_key: String,
    /// Injected into every payload as `webhook_url` when set.
    pub webhook_url: Option<String>,
    pub timeout: Duration,
}

/// Provider client over HTTPS (reqwest).
#[derive(Debug, Clone)]
pub struct HttpProviderGateway {
    client: reqwest::Client,
    config: HttpProviderConfig,
}

impl HttpProviderGateway {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, model_id: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            model_id.trim_start_matches('/')
        )
    }
}

#[async_trait::async_trait]
impl ProviderGateway for HttpProviderGateway {
    #[instrument(skip(self, payload), err)]
    async fn submit(
        &self,
        model_id: &str,
        mut payload: JsonValue,
    ) -> Result<SubmitResponse, ProviderError> {
        if let (Some(url), Some(obj)) = (&self.config.webhook_url, payload.as_object_mut()) {
            obj.insert("webhook_url".to_string(), JsonValue::String(url.clone()));
        }

        let resp = self
            .client
            .post(self.endpoint(model_id))
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("provider error")
                    .to_string()
            });
            warn!(status = status.as_u16(), %message, "provider rejected submission");
            return Err(ProviderError::Request {
                status: status.as_u16(),
                message,
            });
        }

        let raw: JsonValue = serde_json::from_str(&body)
            .map_err(|e| ProviderError::InvalidResponse(format!("malformed json: {e}")))?;
        let response = parse_submit_response(raw)?;
        info!(
            provider_job_id = %response.provider_job_id,
            initial_status = %response.initial_status,
            "provider accepted submission"
        );
        Ok(response)
    }
}

/// Best human-readable message from an error body.
fn error_message(body: &str) -> Option<String> {
    match serde_json::from_str::<JsonValue>(body) {
        Ok(json) => normalize_error(&json),
        Err(_) => {
            let text = body.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
    }
}
