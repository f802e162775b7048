//! Provider callback reconciliation.
//!
//! Callbacks can arrive late, twice, or out of order. Each delivery is applied
//! as an idempotent update: the status only moves along legal edges, outputs
//! are deduplicated by URL, and refunds are flag-guarded. Every matched
//! delivery is kept in the job's event trail.
//!
//! Saves are revision-checked. When another delivery (or the submit path)
//! saves the job between our read and our write, the delivery is re-applied
//! to a fresh copy instead of overwriting the newer state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, field, info, instrument, warn, Span};

use genforge_core::JobId;
use genforge_generation::{
    map_provider_status, parse_callback, CallbackParseError, Job, JobEvent, JobEventType,
    JobOutput, JobStatus, ProviderCallback, StatusChange,
};

use super::{refund_if_due, DEFAULT_FAILURE_MESSAGE};
use crate::jobs::{JobStore, JobStoreError};
use crate::ledger::CreditsLedger;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] CallbackParseError),

    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

impl WebhookError {
    /// HTTP status for this error: a bad payload is the sender's fault, a
    /// storage failure is ours (and worth a provider retry).
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::InvalidPayload(_) => 400,
            WebhookError::Store(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// No job carries this provider task id.
    Unmatched { task_id: String },
    /// The report was applied (or was already the job's status).
    Applied {
        job_id: JobId,
        status: JobStatus,
        outputs_added: usize,
        refunded: bool,
    },
    /// The report would have regressed the job; recorded but not applied.
    Ignored {
        job_id: JobId,
        status: JobStatus,
        reported: JobStatus,
    },
}

/// Reloads allowed when a concurrent writer saves the job first.
const MAX_APPLY_ATTEMPTS: u32 = 5;

#[derive(Debug, Default, Clone, Copy)]
struct SideEffects {
    outputs_added: usize,
    refunded: bool,
}

struct Applied {
    job: Job,
    change: StatusChange,
    outputs_added: usize,
    refunded: bool,
}

pub struct Reconciler {
    jobs: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditsLedger>,
}

impl Reconciler {
    pub fn new(jobs: Arc<dyn JobStore>, ledger: Arc<dyn CreditsLedger>) -> Self {
        Self { jobs, ledger }
    }

    #[instrument(
        skip(self, body),
        fields(task_id = field::Empty, job_id = field::Empty, reported = field::Empty),
        err
    )]
    pub async fn handle(&self, body: &[u8]) -> Result<ReconcileOutcome, WebhookError> {
        let callback = parse_callback(body)?;
        let span = Span::current();
        span.record("task_id", callback.task_id.as_str());
        span.record("reported", callback.status.as_str());

        let now = Utc::now();
        let mut outputs_added = 0;
        let mut refunded = false;
        let mut attempt = 1;
        let (job, change) = loop {
            let Some(job) = self.jobs.find_by_provider_job_id(&callback.task_id).await? else {
                info!("callback for unknown task ignored");
                return Ok(ReconcileOutcome::Unmatched {
                    task_id: callback.task_id,
                });
            };
            span.record("job_id", field::display(job.id));

            match self.apply(job, &callback, now).await {
                Ok(applied) => {
                    outputs_added += applied.outputs_added;
                    refunded |= applied.refunded;
                    break (applied.job, applied.change);
                }
                Err((JobStoreError::Conflict(_), partial)) if attempt < MAX_APPLY_ATTEMPTS => {
                    outputs_added += partial.outputs_added;
                    refunded |= partial.refunded;
                    debug!(attempt, "job changed while applying callback; reloading");
                    attempt += 1;
                }
                Err((e, _)) => return Err(e.into()),
            }
        };

        let reported: JobStatus = map_provider_status(&callback.status).into();
        self.jobs
            .append_event(JobEvent::new(
                job.id,
                JobEventType::for_status(reported),
                callback.raw,
                now,
            ))
            .await?;

        Ok(match change {
            StatusChange::Ignored { current, reported } => {
                warn!(status = %current, %reported, "status regression ignored");
                ReconcileOutcome::Ignored {
                    job_id: job.id,
                    status: current,
                    reported,
                }
            }
            applied => {
                info!(status = %applied.current(), outputs_added, refunded, "callback applied");
                ReconcileOutcome::Applied {
                    job_id: job.id,
                    status: applied.current(),
                    outputs_added,
                    refunded,
                }
            }
        })
    }

    /// Apply one delivery to a freshly loaded job and save it.
    ///
    /// A job the delivery leaves unchanged is not written. On error the side
    /// effects already performed (outputs inserted, refund issued) are
    /// returned alongside it so a retry can report them.
    async fn apply(
        &self,
        mut job: Job,
        callback: &ProviderCallback,
        now: DateTime<Utc>,
    ) -> Result<Applied, (JobStoreError, SideEffects)> {
        let loaded = job.clone();
        let change = job.observe_provider_status(&callback.status, now);
        let mut effects = SideEffects::default();

        if change.reached(JobStatus::Completed) {
            let added = self
                .materialize_outputs(&job, &callback.output_urls, now)
                .await
                .map_err(|e| (e, effects))?;
            effects.outputs_added = added;
        }

        if change.reached(JobStatus::Failed) {
            match &callback.error_message {
                Some(message) => job.set_error_message(message.clone()),
                None if job.error_message().is_none() => {
                    job.set_error_message(DEFAULT_FAILURE_MESSAGE)
                }
                None => {}
            }
            effects.refunded =
                refund_if_due(self.ledger.as_ref(), &mut job, "provider reported failure", now)
                    .await;
        }

        if job != loaded {
            if let Err(e) = self.jobs.save(&mut job).await {
                return Err((e, effects));
            }
        }

        Ok(Applied {
            job,
            change,
            outputs_added: effects.outputs_added,
            refunded: effects.refunded,
        })
    }

    /// Insert the URLs not yet stored for the job, numbering after existing outputs.
    async fn materialize_outputs(
        &self,
        job: &Job,
        urls: &[String],
        at: DateTime<Utc>,
    ) -> Result<usize, JobStoreError> {
        if urls.is_empty() {
            return Ok(0);
        }

        let existing = self.jobs.output_urls(job.id).await?;
        let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
        let kind = job.output_kind();
        let start = existing.len();

        let fresh: Vec<JobOutput> = urls
            .iter()
            .filter(|u| !known.contains(u.as_str()))
            .enumerate()
            .map(|(i, url)| JobOutput::new(job.id, (start + i) as i32, kind, url.clone(), at))
            .collect();

        self.jobs.insert_outputs(fresh).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use crate::jobs::InMemoryJobStore;
    use crate::ledger::{InMemoryCreditsLedger, LedgerError};
    use crate::orchestrator::testing::{request, Harness};
    use crate::provider::StubProviderGateway;
    use genforge_core::UserId;
    use genforge_credits::{CreditLedgerEntry, DebitReceipt, EntryType, RefundReceipt};
    use genforge_generation::job::meta;
    use genforge_generation::{NewJob, OutputKind, PlanTier};
    use serde_json::json;

    async fn submitted(
        h: &Harness,
        user: UserId,
        model: &str,
        modality: &str,
        params: serde_json::Value,
    ) -> Job {
        let resp = h
            .service
            .create_job(user, PlanTier::Paid, request(model, modality, params))
            .await
            .unwrap();
        h.jobs.get(resp.job_id).await.unwrap().unwrap()
    }

    fn body(v: serde_json::Value) -> Vec<u8> {
        v.to_string().into_bytes()
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected_without_mutation() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let err = h.reconciler.handle(b"{oops").await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = h
            .reconciler
            .handle(&body(json!({"status": "COMPLETED"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WebhookError::InvalidPayload(CallbackParseError::MissingTaskId)
        ));
    }

    #[tokio::test]
    async fn unknown_task_is_a_no_op() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let outcome = h
            .reconciler
            .handle(&body(json!({"task_id": "nobody", "status": "COMPLETED"})))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Unmatched {
                task_id: "nobody".to_string()
            }
        );
    }

    #[tokio::test]
    async fn processing_then_completed_materializes_outputs() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "kling-v2", "image-to-video", json!({})).await;
        let task = job.provider_job_id.clone().unwrap();

        h.reconciler
            .handle(&body(json!({"data": {"task_id": task, "status": "IN_PROGRESS"}})))
            .await
            .unwrap();
        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        let outcome = h
            .reconciler
            .handle(&body(json!({
                "task_id": task,
                "status": "COMPLETED",
                "generated": ["https://cdn/v1.mp4", {"url": "https://cdn/v2.mp4"}],
            })))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Applied {
                job_id: job.id,
                status: JobStatus::Completed,
                outputs_added: 2,
                refunded: false
            }
        );

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert!(job.completed_at.is_some());
        assert_eq!(job.cost_actual_credits, 20);
        let outputs = h.jobs.outputs(job.id).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert!(outputs.iter().all(|o| o.kind == OutputKind::Video));
        assert_eq!(outputs[1].index, 1);
    }

    #[tokio::test]
    async fn duplicate_completed_delivery_is_idempotent() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "mystic", "text-to-image", json!({})).await;
        let payload = body(json!({
            "task_id": job.provider_job_id.clone().unwrap(),
            "status": "COMPLETED",
            "generated": ["https://cdn/a.png", "https://cdn/b.png"],
        }));

        h.reconciler.handle(&payload).await.unwrap();
        let after_first = h.jobs.get(job.id).await.unwrap().unwrap();
        let second = h.reconciler.handle(&payload).await.unwrap();
        assert!(matches!(second, ReconcileOutcome::Applied { outputs_added: 0, .. }));

        // The job row is not touched by the repeat.
        let after_second = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(after_second, after_first);
        let history = &after_second.metadata[meta::PROVIDER_STATUS_HISTORY];
        assert_eq!(history, &json!(["CREATED", "COMPLETED"]));

        assert_eq!(h.jobs.outputs(job.id).await.unwrap().len(), 2);
        let completed_events = h
            .jobs
            .events(job.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == JobEventType::TaskCompleted)
            .count();
        assert_eq!(completed_events, 2);
    }

    #[tokio::test]
    async fn later_delivery_adds_only_new_urls() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "mystic", "text-to-image", json!({})).await;
        let task = job.provider_job_id.clone().unwrap();

        h.reconciler
            .handle(&body(json!({
                "task_id": task,
                "status": "COMPLETED",
                "generated": ["https://cdn/a.png"],
            })))
            .await
            .unwrap();
        h.reconciler
            .handle(&body(json!({
                "task_id": task,
                "status": "COMPLETED",
                "generated": ["https://cdn/a.png", "https://cdn/b.png"],
            })))
            .await
            .unwrap();

        let outputs = h.jobs.outputs(job.id).await.unwrap();
        let urls: Vec<_> = outputs.iter().map(|o| (o.index, o.url.as_str())).collect();
        assert_eq!(urls, vec![(0, "https://cdn/a.png"), (1, "https://cdn/b.png")]);
    }

    #[tokio::test]
    async fn failed_callback_refunds_exactly_once() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let params = json!({"duration": 5});
        let job = submitted(&h, user, "kling-v2", "image-to-video", params).await;
        assert_eq!(h.ledger.balance(user).await.unwrap(), 30);

        let payload = body(json!({
            "task_id": job.provider_job_id.clone().unwrap(),
            "status": "FAILED",
            "error": {"message": "content policy violation"},
        }));
        let first = h.reconciler.handle(&payload).await.unwrap();
        let second = h.reconciler.handle(&payload).await.unwrap();
        assert!(matches!(first, ReconcileOutcome::Applied { refunded: true, .. }));
        assert!(matches!(second, ReconcileOutcome::Applied { refunded: false, .. }));

        assert_eq!(h.ledger.balance(user).await.unwrap(), 50);
        let refunds = h
            .ledger
            .entries(user)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.entry_type == EntryType::Refund)
            .count();
        assert_eq!(refunds, 1);

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.cost_actual_credits, 0);
        assert!(job.refund_issued());
        assert_eq!(job.error_message(), Some("content policy violation"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_failed_deliveries_refund_once() {
        let h = std::sync::Arc::new(Harness::new(StubProviderGateway::accepting("CREATED")));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "kling-v2", "image-to-video", json!({})).await;
        let payload = body(json!({
            "task_id": job.provider_job_id.clone().unwrap(),
            "status": "FAILED",
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let h = h.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(
                async move { h.reconciler.handle(&payload).await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.ledger.balance(user).await.unwrap(), 50);
        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.error_message(), Some(DEFAULT_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "mystic", "text-to-image", json!({})).await;
        let task = job.provider_job_id.clone().unwrap();

        h.reconciler
            .handle(&body(json!({
                "task_id": task,
                "status": "COMPLETED",
                "url": "https://cdn/x.png",
            })))
            .await
            .unwrap();
        let outcome = h
            .reconciler
            .handle(&body(json!({"task_id": task, "status": "FAILED"})))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Ignored {
                job_id: job.id,
                status: JobStatus::Completed,
                reported: JobStatus::Failed
            }
        );

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.cost_actual_credits, 5);
        assert_eq!(h.ledger.balance(user).await.unwrap(), 45);
        assert_eq!(job.provider_latest_status(), Some("FAILED"));
    }

    /// Ledger whose refunds always fail.
    struct RefundOutage(InMemoryCreditsLedger);

    #[async_trait::async_trait]
    impl CreditsLedger for RefundOutage {
        async fn debit(
            &self,
            user_id: UserId,
            amount: i64,
            note: &str,
        ) -> Result<DebitReceipt, LedgerError> {
            self.0.debit(user_id, amount, note).await
        }

        async fn attach_to_latest_log(
            &self,
            user_id: UserId,
            job_id: JobId,
            note: &str,
        ) -> Result<bool, LedgerError> {
            self.0.attach_to_latest_log(user_id, job_id, note).await
        }

        async fn refund(
            &self,
            _user_id: UserId,
            _amount: i64,
            _job_id: JobId,
            _note: &str,
        ) -> Result<RefundReceipt, LedgerError> {
            Err(LedgerError::Storage("connection reset".to_string()))
        }

        async fn grant(
            &self,
            user_id: UserId,
            amount: i64,
            note: &str,
        ) -> Result<i64, LedgerError> {
            self.0.grant(user_id, amount, note).await
        }

        async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
            self.0.balance(user_id).await
        }

        async fn entries(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>, LedgerError> {
            self.0.entries(user_id).await
        }
    }

    #[tokio::test]
    async fn failed_refund_leaves_flag_unset_and_cost_intact() {
        let h = Harness::with_ledger(
            StubProviderGateway::accepting("CREATED"),
            std::sync::Arc::new(RefundOutage(InMemoryCreditsLedger::new())),
        );
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "kling-v2", "image-to-video", json!({})).await;

        let outcome = h
            .reconciler
            .handle(&body(json!({
                "task_id": job.provider_job_id.clone().unwrap(),
                "status": "FAILED",
            })))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { refunded: false, .. }));

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!job.refund_issued());
        assert_eq!(job.cost_actual_credits, 20);
    }

    #[tokio::test]
    async fn status_history_is_bounded() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "mystic", "text-to-image", json!({})).await;
        let task = job.provider_job_id.clone().unwrap();

        // Alternate raw values so every delivery is a new observation.
        for i in 0..25 {
            let raw = if i % 2 == 0 { "IN_PROGRESS" } else { "RUNNING" };
            h.reconciler
                .handle(&body(json!({"task_id": task, "status": raw})))
                .await
                .unwrap();
        }

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        let history = job.metadata[meta::PROVIDER_STATUS_HISTORY]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(history, 20);
    }

    /// Job store that parks the first provider-id lookup until released.
    struct ParkedLookup {
        inner: Arc<InMemoryJobStore>,
        gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
    }

    #[async_trait::async_trait]
    impl JobStore for ParkedLookup {
        async fn admit(&self, new_job: NewJob, limit: u32) -> Result<Job, JobStoreError> {
            self.inner.admit(new_job, limit).await
        }

        async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id).await
        }

        async fn get_for_user(
            &self,
            user_id: UserId,
            job_id: JobId,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.get_for_user(user_id, job_id).await
        }

        async fn find_by_provider_job_id(
            &self,
            provider_job_id: &str,
        ) -> Result<Option<Job>, JobStoreError> {
            let job = self.inner.find_by_provider_job_id(provider_job_id).await?;
            let gate = self.gate.lock().unwrap().take();
            if let Some((loaded, resume)) = gate {
                loaded.send(()).unwrap();
                resume.await.unwrap();
            }
            Ok(job)
        }

        async fn save(&self, job: &mut Job) -> Result<(), JobStoreError> {
            self.inner.save(job).await
        }

        async fn set_share_slug(
            &self,
            job_id: JobId,
            slug: &str,
        ) -> Result<String, JobStoreError> {
            self.inner.set_share_slug(job_id, slug).await
        }

        async fn list_for_user(
            &self,
            user_id: UserId,
            limit: usize,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list_for_user(user_id, limit).await
        }

        async fn output_urls(&self, job_id: JobId) -> Result<Vec<String>, JobStoreError> {
            self.inner.output_urls(job_id).await
        }

        async fn insert_outputs(&self, outputs: Vec<JobOutput>) -> Result<usize, JobStoreError> {
            self.inner.insert_outputs(outputs).await
        }

        async fn outputs(&self, job_id: JobId) -> Result<Vec<JobOutput>, JobStoreError> {
            self.inner.outputs(job_id).await
        }

        async fn append_event(&self, event: JobEvent) -> Result<(), JobStoreError> {
            self.inner.append_event(event).await
        }

        async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
            self.inner.events(job_id).await
        }
    }

    #[tokio::test]
    async fn late_progress_delivery_does_not_undo_a_failure() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "kling-v2", "image-to-video", json!({})).await;
        let task = job.provider_job_id.clone().unwrap();
        assert_eq!(h.ledger.balance(user).await.unwrap(), 30);

        // The progress delivery reads the pending job, then stalls.
        let (loaded_tx, loaded_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        let parked = Arc::new(ParkedLookup {
            inner: h.jobs.clone(),
            gate: Mutex::new(Some((loaded_tx, resume_rx))),
        });
        let slow = Reconciler::new(parked, h.ledger.clone());
        let progress = body(json!({"task_id": task, "status": "IN_PROGRESS"}));
        let slow_delivery = tokio::spawn(async move { slow.handle(&progress).await });
        loaded_rx.await.unwrap();

        // The failure lands in between and refunds.
        let failed = h
            .reconciler
            .handle(&body(json!({"task_id": task, "status": "FAILED"})))
            .await
            .unwrap();
        assert!(matches!(failed, ReconcileOutcome::Applied { refunded: true, .. }));

        resume_tx.send(()).unwrap();
        let outcome = slow_delivery.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Ignored {
                job_id: job.id,
                status: JobStatus::Failed,
                reported: JobStatus::Processing,
            }
        );

        let job = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.cost_actual_credits, 0);
        assert!(job.refund_issued());
        assert_eq!(h.ledger.balance(user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn repeated_failure_retries_an_outstanding_refund() {
        let h = Harness::new(StubProviderGateway::accepting("CREATED"));
        let user = h.funded_user(50).await;
        let job = submitted(&h, user, "kling-v2", "image-to-video", json!({})).await;

        // A failure that was stored without its refund.
        let mut stored = h.jobs.get(job.id).await.unwrap().unwrap();
        stored.observe_provider_status("FAILED", Utc::now());
        h.jobs.save(&mut stored).await.unwrap();
        assert_eq!(stored.refund_due(), Some(20));

        let task = job.provider_job_id.clone().unwrap();
        let outcome = h
            .reconciler
            .handle(&body(json!({"task_id": task, "status": "FAILED"})))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Applied { refunded: true, .. }));
        assert!(h.jobs.get(job.id).await.unwrap().unwrap().refund_issued());
        assert_eq!(h.ledger.balance(user).await.unwrap(), 50);
    }
}
