use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value as JsonValue};

use super::{ProviderError, ProviderGateway, SubmitResponse};

#[derive(Debug, Clone)]
enum Behavior {
    Accept { initial_status: String },
    Fail(ProviderError),
}

/// Provider stand-in for tests and local runs without provider credentials.
///
/// Accepts every submission with a fresh `stub-task-N` id, or fails every
/// submission with a fixed error.
#[derive(Debug)]
pub struct StubProviderGateway {
    behavior: Behavior,
    counter: AtomicU64,
    calls: Mutex<Vec<(String, JsonValue)>>,
}

impl StubProviderGateway {
    pub fn accepting(initial_status: impl Into<String>) -> Self {
        Self::with(Behavior::Accept {
            initial_status: initial_status.into(),
        })
    }

    pub fn failing(error: ProviderError) -> Self {
        Self::with(Behavior::Fail(error))
    }

    fn with(behavior: Behavior) -> Self {
        Self {
            behavior,
            counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(model_id, payload)` of every submission so far.
    pub fn calls(&self) -> Vec<(String, JsonValue)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl ProviderGateway for StubProviderGateway {
    async fn submit(
        &self,
        model_id: &str,
        payload: JsonValue,
    ) -> Result<SubmitResponse, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((model_id.to_string(), payload));
        }

        match &self.behavior {
            Behavior::Fail(err) => Err(err.clone()),
            Behavior::Accept { initial_status } => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let provider_job_id = format!("stub-task-{n}");
                Ok(SubmitResponse {
                    raw: json!({"data": {"task_id": provider_job_id, "status": initial_status}}),
                    provider_job_id,
                    initial_status: initial_status.clone(),
                })
            }
        }
    }
}
