//! Job status and the provider status vocabulary.

use serde::{Deserialize, Serialize};

/// Platform-side job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Admitted, not yet accepted by the provider
    Pending,
    /// Provider is working on it
    Processing,
    /// Outputs available
    Completed,
    /// Provider or submission failure
    Failed,
    /// Debit was refused; nothing was charged and the provider was never called
    CancelledInsufficientCredits,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::CancelledInsufficientCredits => "cancelled_insufficient_credits",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled_insufficient_credits" => Some(JobStatus::CancelledInsufficientCredits),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::CancelledInsufficientCredits
        )
    }

    /// Counts against the per-user concurrency limit.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Allowed edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Processing | Completed | Failed | CancelledInsufficientCredits) => true,
            (Processing, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-reported status, reduced to the four values the platform reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<ProviderStatus> for JobStatus {
    fn from(value: ProviderStatus) -> Self {
        match value {
            ProviderStatus::Pending => JobStatus::Pending,
            ProviderStatus::Processing => JobStatus::Processing,
            ProviderStatus::Completed => JobStatus::Completed,
            ProviderStatus::Failed => JobStatus::Failed,
        }
    }
}

/// Translate a raw provider status string into a [`ProviderStatus`].
///
/// Total and deterministic. Matching ignores case and surrounding whitespace;
/// unknown strings map to `Processing` so they are never mistaken for a
/// terminal outcome.
pub fn map_provider_status(raw: &str) -> ProviderStatus {
    let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
    match normalized.as_str() {
        "created" | "pending" | "queued" | "waiting" | "submitted" => ProviderStatus::Pending,
        "in_progress" | "processing" | "running" | "started" => ProviderStatus::Processing,
        "completed" | "complete" | "succeeded" | "success" | "done" | "finished" => {
            ProviderStatus::Completed
        }
        "failed" | "failure" | "error" | "errored" | "cancelled" | "canceled" | "rejected"
        | "timeout" | "timed_out" => ProviderStatus::Failed,
        _ => ProviderStatus::Processing,
    }
}
