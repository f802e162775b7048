//! Generation job record, outputs, and audit events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use genforge_core::{JobEventId, JobId, JobOutputId, UserId};

use crate::pricing::CostEstimate;
use crate::status::{map_provider_status, JobStatus};

/// Metadata keys written by the platform.
pub mod meta {
    pub const PROVIDER_LATEST_STATUS: &str = "provider_latest_status";
    pub const PROVIDER_STATUS_HISTORY: &str = "provider_status_history";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const REFUND_ISSUED: &str = "refund_issued";
    pub const REFUNDED_AT: &str = "refunded_at";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
}

/// Raw provider statuses kept in `provider_status_history`.
const STATUS_HISTORY_LIMIT: usize = 20;

/// Fields supplied by the caller when admitting a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub user_id: UserId,
    pub provider_code: String,
    pub modality_code: String,
    pub model_slug: String,
    pub input_params: JsonValue,
    pub is_public: bool,
    pub cost: CostEstimate,
}

/// One generation request tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub provider_code: String,
    pub modality_code: String,
    pub model_slug: String,
    pub input_params: JsonValue,
    pub metadata: Map<String, JsonValue>,
    pub provider_job_id: Option<String>,
    pub cost_estimated_credits: i64,
    pub cost_actual_credits: i64,
    pub pricing_snapshot: JsonValue,
    pub is_public: bool,
    pub share_slug: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every successful save; a save carrying a
    /// stale revision is rejected.
    #[serde(default)]
    pub revision: i64,
}

/// Result of applying a provider-reported status to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The job was already in the reported status.
    Unchanged(JobStatus),
    /// The job moved along a legal edge.
    Applied { from: JobStatus, to: JobStatus },
    /// The report would move the job backwards or out of a terminal state.
    Ignored { current: JobStatus, reported: JobStatus },
}

impl StatusChange {
    /// Status the job is in after the change was considered.
    pub fn current(&self) -> JobStatus {
        match *self {
            StatusChange::Unchanged(s) => s,
            StatusChange::Applied { to, .. } => to,
            StatusChange::Ignored { current, .. } => current,
        }
    }

    /// The reported status is the job's status now (applied or already there).
    pub fn reached(&self, status: JobStatus) -> bool {
        !matches!(self, StatusChange::Ignored { .. }) && self.current() == status
    }
}

impl Job {
    /// Build a `pending` job from admission input.
    pub fn admitted(new: NewJob, at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            user_id: new.user_id,
            provider_code: new.provider_code,
            modality_code: new.modality_code,
            model_slug: new.model_slug,
            input_params: new.input_params,
            metadata: Map::new(),
            provider_job_id: None,
            cost_estimated_credits: new.cost.credits,
            cost_actual_credits: 0,
            pricing_snapshot: new.cost.snapshot(at),
            is_public: new.is_public,
            share_slug: None,
            status: JobStatus::Pending,
            created_at: at,
            started_at: None,
            completed_at: None,
            updated_at: at,
            revision: 0,
        }
    }

    /// Record that `amount` credits were debited for this job.
    pub fn charge(&mut self, amount: i64, at: DateTime<Utc>) {
        self.cost_actual_credits = amount;
        self.updated_at = at;
    }

    /// Link the job to the provider task that will call back later.
    pub fn link_provider(&mut self, provider_job_id: impl Into<String>, at: DateTime<Utc>) {
        self.provider_job_id = Some(provider_job_id.into());
        self.updated_at = at;
    }

    /// Apply a raw provider status string.
    ///
    /// Records the raw value in metadata, then moves the job along the
    /// lifecycle graph if the mapped status is a legal next step. The first
    /// `processing` observation stamps `started_at`; reaching `completed`
    /// stamps `completed_at`. Repeating the latest raw status for the
    /// current status leaves the job untouched.
    pub fn observe_provider_status(&mut self, raw: &str, at: DateTime<Utc>) -> StatusChange {
        let reported: JobStatus = map_provider_status(raw).into();
        if self.status == reported && self.provider_latest_status() == Some(raw) {
            return StatusChange::Unchanged(reported);
        }
        self.record_provider_status(raw);
        self.updated_at = at;

        let change = if self.status == reported {
            StatusChange::Unchanged(reported)
        } else if self.status.can_transition_to(reported) {
            let from = self.status;
            self.status = reported;
            StatusChange::Applied { from, to: reported }
        } else {
            StatusChange::Ignored {
                current: self.status,
                reported,
            }
        };

        if change.reached(JobStatus::Processing) {
            self.stamp_started(at);
        }
        if change.reached(JobStatus::Completed) && self.completed_at.is_none() {
            self.completed_at = Some(at);
            self.metadata
                .insert(meta::COMPLETED_AT.to_string(), JsonValue::String(at.to_rfc3339()));
        }

        change
    }

    /// Synchronous failure (gateway error, ledger error). No-op on terminal jobs.
    pub fn mark_failed(&mut self, message: impl Into<String>, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(JobStatus::Failed) {
            return false;
        }
        self.status = JobStatus::Failed;
        self.set_error_message(message);
        self.updated_at = at;
        true
    }

    pub fn mark_cancelled_insufficient_credits(
        &mut self,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> bool {
        if !self
            .status
            .can_transition_to(JobStatus::CancelledInsufficientCredits)
        {
            return false;
        }
        self.status = JobStatus::CancelledInsufficientCredits;
        self.set_error_message(message);
        self.updated_at = at;
        true
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.metadata
            .insert(meta::ERROR_MESSAGE.to_string(), JsonValue::String(message.into()));
    }

    pub fn error_message(&self) -> Option<&str> {
        self.metadata.get(meta::ERROR_MESSAGE).and_then(JsonValue::as_str)
    }

    pub fn refund_issued(&self) -> bool {
        self.metadata
            .get(meta::REFUND_ISSUED)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    /// Credits owed back to the user, if any.
    ///
    /// Decided from the `refund_issued` flag, never by re-deriving an amount.
    pub fn refund_due(&self) -> Option<i64> {
        if self.refund_issued() || self.cost_actual_credits <= 0 {
            return None;
        }
        Some(self.cost_actual_credits)
    }

    /// Record a completed refund: zero the actual cost and set the flag.
    pub fn mark_refunded(&mut self, at: DateTime<Utc>) {
        self.cost_actual_credits = 0;
        self.metadata
            .insert(meta::REFUND_ISSUED.to_string(), JsonValue::Bool(true));
        self.metadata
            .insert(meta::REFUNDED_AT.to_string(), JsonValue::String(at.to_rfc3339()));
        self.updated_at = at;
    }

    pub fn provider_latest_status(&self) -> Option<&str> {
        self.metadata
            .get(meta::PROVIDER_LATEST_STATUS)
            .and_then(JsonValue::as_str)
    }

    pub fn output_kind(&self) -> OutputKind {
        OutputKind::for_modality(&self.modality_code)
    }

    fn record_provider_status(&mut self, raw: &str) {
        self.metadata.insert(
            meta::PROVIDER_LATEST_STATUS.to_string(),
            JsonValue::String(raw.to_string()),
        );

        let history = self
            .metadata
            .entry(meta::PROVIDER_STATUS_HISTORY.to_string())
            .or_insert_with(|| JsonValue::Array(Vec::new()));
        if !history.is_array() {
            *history = JsonValue::Array(Vec::new());
        }
        if let JsonValue::Array(items) = history {
            items.push(JsonValue::String(raw.to_string()));
            if items.len() > STATUS_HISTORY_LIMIT {
                let excess = items.len() - STATUS_HISTORY_LIMIT;
                items.drain(..excess);
            }
        }
    }

    fn stamp_started(&mut self, at: DateTime<Utc>) {
        if self.started_at.is_some() {
            return;
        }
        self.started_at = Some(at);
        self.metadata
            .insert(meta::STARTED_AT.to_string(), JsonValue::String(at.to_rfc3339()));
    }
}

/// Media type of a generated asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    Image,
    Video,
    Audio,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Image => "image",
            OutputKind::Video => "video",
            OutputKind::Audio => "audio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(OutputKind::Image),
            "video" => Some(OutputKind::Video),
            "audio" => Some(OutputKind::Audio),
            _ => None,
        }
    }

    /// Lip-sync renders a video; sound modalities render audio; everything else is an image.
    pub fn for_modality(modality_code: &str) -> Self {
        let m = modality_code.to_ascii_lowercase();
        if m.contains("video") || m.contains("lip") {
            OutputKind::Video
        } else if m.contains("sound") || m.contains("audio") || m.contains("music") {
            OutputKind::Audio
        } else {
            OutputKind::Image
        }
    }
}

/// One generated asset belonging to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    pub id: JobOutputId,
    pub job_id: JobId,
    pub index: i32,
    pub kind: OutputKind,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl JobOutput {
    pub fn new(
        job_id: JobId,
        index: i32,
        kind: OutputKind,
        url: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobOutputId::new(),
            job_id,
            index,
            kind,
            url: url.into(),
            created_at: at,
        }
    }
}

/// Audit event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    TaskCreated,
    TaskPending,
    TaskProcessing,
    TaskCompleted,
    TaskFailed,
    TaskCancelledInsufficientCredits,
    SharePrepared,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::TaskCreated => "task_created",
            JobEventType::TaskPending => "task_pending",
            JobEventType::TaskProcessing => "task_processing",
            JobEventType::TaskCompleted => "task_completed",
            JobEventType::TaskFailed => "task_failed",
            JobEventType::TaskCancelledInsufficientCredits => "task_cancelled_insufficient_credits",
            JobEventType::SharePrepared => "share_prepared",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "task_created" => Some(JobEventType::TaskCreated),
            "task_pending" => Some(JobEventType::TaskPending),
            "task_processing" => Some(JobEventType::TaskProcessing),
            "task_completed" => Some(JobEventType::TaskCompleted),
            "task_failed" => Some(JobEventType::TaskFailed),
            "task_cancelled_insufficient_credits" => {
                Some(JobEventType::TaskCancelledInsufficientCredits)
            }
            "share_prepared" => Some(JobEventType::SharePrepared),
            _ => None,
        }
    }

    /// Event recorded for a callback that left the job in `status`.
    pub fn for_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => JobEventType::TaskPending,
            JobStatus::Processing => JobEventType::TaskProcessing,
            JobStatus::Completed => JobEventType::TaskCompleted,
            JobStatus::Failed => JobEventType::TaskFailed,
            JobStatus::CancelledInsufficientCredits => {
                JobEventType::TaskCancelledInsufficientCredits
            }
        }
    }
}

/// Append-only audit trail entry carrying the raw provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub id: JobEventId,
    pub job_id: JobId,
    pub event_type: JobEventType,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(
        job_id: JobId,
        event_type: JobEventType,
        payload: JsonValue,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobEventId::new(),
            job_id,
            event_type,
            payload,
            created_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::CostEstimate;

    fn pending_job() -> Job {
        Job::admitted(
            NewJob {
                user_id: UserId::new(),
                provider_code: "freepik".to_string(),
                modality_code: "text-to-image".to_string(),
                model_slug: "mystic".to_string(),
                input_params: serde_json::json!({"prompt": "a fox"}),
                is_public: false,
                cost: CostEstimate::new("mystic", 20),
            },
            Utc::now(),
        )
    }

    #[test]
    fn admitted_job_is_pending_and_uncharged() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.cost_estimated_credits, 20);
        assert_eq!(job.cost_actual_credits, 0);
        assert_eq!(job.pricing_snapshot["credits"], 20);
        assert!(job.refund_due().is_none());
    }

    #[test]
    fn first_processing_observation_stamps_started_at_once() {
        let mut job = pending_job();
        let t1 = Utc::now();
        let change = job.observe_provider_status("IN_PROGRESS", t1);
        assert_eq!(
            change,
            StatusChange::Applied {
                from: JobStatus::Pending,
                to: JobStatus::Processing
            }
        );
        assert_eq!(job.started_at, Some(t1));

        let t2 = t1 + chrono::Duration::seconds(5);
        let change = job.observe_provider_status("IN_PROGRESS", t2);
        assert_eq!(change, StatusChange::Unchanged(JobStatus::Processing));
        assert_eq!(job.started_at, Some(t1));
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut job = pending_job();
        job.observe_provider_status("COMPLETED", Utc::now());
        let change = job.observe_provider_status("FAILED", Utc::now());
        assert_eq!(
            change,
            StatusChange::Ignored {
                current: JobStatus::Completed,
                reported: JobStatus::Failed
            }
        );
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.provider_latest_status(), Some("FAILED"));
    }

    #[test]
    fn processing_does_not_regress_to_pending() {
        let mut job = pending_job();
        job.observe_provider_status("IN_PROGRESS", Utc::now());
        let change = job.observe_provider_status("CREATED", Utc::now());
        assert!(matches!(change, StatusChange::Ignored { .. }));
        assert_eq!(job.status, JobStatus::Processing);
    }

    #[test]
    fn refund_bookkeeping_is_flag_driven() {
        let mut job = pending_job();
        job.charge(20, Utc::now());
        assert_eq!(job.refund_due(), Some(20));

        job.mark_refunded(Utc::now());
        assert!(job.refund_issued());
        assert_eq!(job.cost_actual_credits, 0);
        assert_eq!(job.refund_due(), None);
    }

    #[test]
    fn status_history_is_bounded() {
        let mut job = pending_job();
        for i in 0..(STATUS_HISTORY_LIMIT + 5) {
            job.observe_provider_status(&format!("STEP_{i}"), Utc::now());
        }
        let history = job.metadata[meta::PROVIDER_STATUS_HISTORY].as_array().unwrap();
        assert_eq!(history.len(), STATUS_HISTORY_LIMIT);
        let newest = format!("STEP_{}", STATUS_HISTORY_LIMIT + 4);
        assert_eq!(history.last().unwrap(), &serde_json::json!(newest));
    }

    #[test]
    fn repeated_latest_status_leaves_job_untouched() {
        let mut job = pending_job();
        let t1 = Utc::now();
        job.observe_provider_status("COMPLETED", t1);
        let settled = job.clone();

        let t2 = t1 + chrono::Duration::seconds(30);
        let change = job.observe_provider_status("COMPLETED", t2);
        assert_eq!(change, StatusChange::Unchanged(JobStatus::Completed));
        assert_eq!(job, settled);

        // A different raw value for the same mapped status is still recorded.
        job.observe_provider_status("SUCCESS", t2);
        assert_eq!(job.provider_latest_status(), Some("SUCCESS"));
        assert_eq!(job.updated_at, t2);
        let history = job.metadata[meta::PROVIDER_STATUS_HISTORY].as_array().unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn mark_failed_refuses_terminal_jobs() {
        let mut job = pending_job();
        assert!(job.mark_cancelled_insufficient_credits("insufficient credits", Utc::now()));
        assert!(!job.mark_failed("late failure", Utc::now()));
        assert_eq!(job.status, JobStatus::CancelledInsufficientCredits);
        assert_eq!(job.error_message(), Some("insufficient credits"));
    }

    #[test]
    fn output_kind_follows_modality() {
        assert_eq!(OutputKind::for_modality("image-to-video"), OutputKind::Video);
        assert_eq!(OutputKind::for_modality("lip-sync"), OutputKind::Video);
        assert_eq!(OutputKind::for_modality("text-to-sound"), OutputKind::Audio);
        assert_eq!(OutputKind::for_modality("text-to-image"), OutputKind::Image);
    }
}
