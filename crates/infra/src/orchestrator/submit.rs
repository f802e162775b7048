//! Job submission: admit, debit, submit, link.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{field, info, instrument, warn, Span};

use genforge_core::{JobId, UserId};
use genforge_generation::{
    ConcurrencyLimits, Job, JobEvent, JobEventType, JobStatus, NewJob, PlanTier, PricingCatalog,
};

use super::{refund_if_due, DEFAULT_FAILURE_MESSAGE};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::{CreditsLedger, LedgerError};
use crate::provider::ProviderGateway;
use crate::share::ShareAttacher;

/// Body of a job creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    /// Model slug from the pricing catalog.
    pub model: String,
    pub modality: String,
    #[serde(default = "empty_object")]
    pub input_params: JsonValue,
    #[serde(default)]
    pub is_public: bool,
}

fn empty_object() -> JsonValue {
    JsonValue::Object(Map::new())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub provider_job_id: Option<String>,
    pub status: JobStatus,
    pub credits_cost: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("concurrency limit reached ({limit} active jobs allowed)")]
    ConcurrencyLimit { limit: u32 },

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits {
        job_id: JobId,
        balance: i64,
        required: i64,
    },

    #[error("provider error: {message}")]
    Provider {
        job_id: JobId,
        /// Provider's HTTP status, when it answered at all.
        status: Option<u16>,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JobStoreError> for SubmitError {
    fn from(value: JobStoreError) -> Self {
        match value {
            JobStoreError::ConcurrencyLimitExceeded { limit } => {
                SubmitError::ConcurrencyLimit { limit }
            }
            other => SubmitError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobServiceSettings {
    /// Recorded on every job, e.g. `freepik`.
    pub provider_code: String,
    pub limits: ConcurrencyLimits,
    pub catalog: PricingCatalog,
}

pub struct JobService {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditsLedger>,
    gateway: Arc<dyn ProviderGateway>,
    share: Arc<dyn ShareAttacher>,
    settings: JobServiceSettings,
}

impl JobService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditsLedger>,
        gateway: Arc<dyn ProviderGateway>,
        share: Arc<dyn ShareAttacher>,
        settings: JobServiceSettings,
    ) -> Self {
        Self {
            jobs,
            ledger,
            gateway,
            share,
            settings,
        }
    }

    /// Create a job and hand it to the provider.
    ///
    /// Credits are taken before the provider is called and returned if the
    /// provider refuses or immediately fails the job. A job refused for lack
    /// of credits never reaches the provider.
    #[instrument(
        skip(self, request),
        fields(user_id = %user_id, model = %request.model, job_id = field::Empty),
        err
    )]
    pub async fn create_job(
        &self,
        user_id: UserId,
        plan: PlanTier,
        request: CreateJobRequest,
    ) -> Result<CreateJobResponse, SubmitError> {
        let modality = request.modality.trim();
        if modality.is_empty() {
            return Err(SubmitError::Validation("modality is required".to_string()));
        }
        if !request.input_params.is_object() {
            return Err(SubmitError::Validation(
                "input_params must be a json object".to_string(),
            ));
        }
        let price = self
            .settings
            .catalog
            .get(&request.model)
            .cloned()
            .ok_or_else(|| SubmitError::Validation(format!("unknown model: {}", request.model)))?;
        let cost = self
            .settings
            .catalog
            .estimate(&request.model, &request.input_params)
            .map_err(|e| SubmitError::Validation(e.to_string()))?;

        let limit = self.settings.limits.limit_for(plan);
        let new_job = NewJob {
            user_id,
            provider_code: self.settings.provider_code.clone(),
            modality_code: modality.to_string(),
            model_slug: price.model_slug.clone(),
            input_params: request.input_params.clone(),
            is_public: request.is_public,
            cost,
        };
        let mut job = self.jobs.admit(new_job, limit).await?;
        Span::current().record("job_id", field::display(job.id));

        let amount = job.cost_estimated_credits;
        let note = debit_note(&job);
        if let Err(e) = self.ledger.debit(user_id, amount, &note).await {
            return Err(self.settle_refused_debit(job, e).await);
        }

        job.charge(amount, Utc::now());
        self.jobs.save(&mut job).await?;
        match self.ledger.attach_to_latest_log(user_id, job.id, &note).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "no unlinked debit entry to attach"),
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to link debit entry to job"),
        }

        let response = match self
            .gateway
            .submit(&price.provider_model_id, request.input_params)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let now = Utc::now();
                job.mark_failed(e.message(), now);
                let reason = "provider submission failed";
                refund_if_due(self.ledger.as_ref(), &mut job, reason, now).await;
                self.jobs.save(&mut job).await?;
                self.jobs
                    .append_event(JobEvent::new(
                        job.id,
                        JobEventType::TaskFailed,
                        json!({ "error": e.to_string(), "provider_status": e.http_status() }),
                        now,
                    ))
                    .await?;
                warn!(job_id = %job.id, error = %e, "provider submission failed");
                return Err(SubmitError::Provider {
                    job_id: job.id,
                    status: e.http_status(),
                    message: e.message(),
                });
            }
        };

        let now = Utc::now();
        job.link_provider(response.provider_job_id.clone(), now);
        let change = job.observe_provider_status(&response.initial_status, now);
        if change.reached(JobStatus::Failed) {
            if job.error_message().is_none() {
                job.set_error_message(DEFAULT_FAILURE_MESSAGE);
            }
            refund_if_due(self.ledger.as_ref(), &mut job, "provider reported failure", now).await;
        }
        self.jobs.save(&mut job).await?;
        self.jobs
            .append_event(JobEvent::new(
                job.id,
                JobEventType::TaskCreated,
                response.raw,
                now,
            ))
            .await?;

        if job.is_public {
            if let Err(e) = self.share.prepare(&mut job).await {
                warn!(job_id = %job.id, error = %e, "share preparation failed");
            }
        }

        info!(
            job_id = %job.id,
            provider_job_id = %response.provider_job_id,
            status = %job.status,
            credits = amount,
            "job submitted"
        );

        Ok(CreateJobResponse {
            job_id: job.id,
            provider_job_id: job.provider_job_id.clone(),
            status: job.status,
            credits_cost: amount,
        })
    }

    /// Record a refused debit on the job and translate it for the caller.
    async fn settle_refused_debit(&self, mut job: Job, err: LedgerError) -> SubmitError {
        let now = Utc::now();
        let (event_type, payload, outcome) = match err {
            LedgerError::InsufficientCredits { balance, required } => {
                job.mark_cancelled_insufficient_credits(
                    format!("insufficient credits: balance {balance}, required {required}"),
                    now,
                );
                (
                    JobEventType::TaskCancelledInsufficientCredits,
                    json!({ "balance": balance, "required": required }),
                    SubmitError::InsufficientCredits {
                        job_id: job.id,
                        balance,
                        required,
                    },
                )
            }
            other => {
                job.mark_failed(format!("credit debit failed: {other}"), now);
                (
                    JobEventType::TaskFailed,
                    json!({ "error": other.to_string() }),
                    SubmitError::Internal(other.to_string()),
                )
            }
        };

        if let Err(e) = self.jobs.save(&mut job).await {
            return e.into();
        }
        if let Err(e) = self
            .jobs
            .append_event(JobEvent::new(job.id, event_type, payload, now))
            .await
        {
            return e.into();
        }
        warn!(job_id = %job.id, status = %job.status, "debit refused");
        outcome
    }
}

/// Ledger note for the debit of `job`; also the key for linking it afterwards.
fn debit_note(job: &Job) -> String {
    format!("generation:{}:{}", job.model_slug, job.id)
}
