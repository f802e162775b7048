//! Job orchestration: submission and provider callback reconciliation.
//!
//! Both paths share one transition helper (`Job::observe_provider_status`)
//! and one refund routine, so a failure observed synchronously and a failure
//! reported by a webhook settle the ledger the same way.

pub mod reconcile;
pub mod submit;

pub use reconcile::{ReconcileOutcome, Reconciler, WebhookError};
pub use submit::{CreateJobRequest, CreateJobResponse, JobService, JobServiceSettings, SubmitError};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use genforge_generation::Job;

use crate::ledger::{CreditsLedger, LedgerError};

/// Error text recorded when the provider fails a job without saying why.
pub const DEFAULT_FAILURE_MESSAGE: &str = "provider reported failure";

/// Refund the job's charge if one is outstanding.
///
/// Guarded by the `refund_issued` flag; the ledger's one-refund-per-job rule
/// backs it up when two callers race. On success the job is marked refunded
/// (cost zeroed, flag set); the caller persists it. A ledger failure is
/// logged and leaves the job untouched so a later delivery can retry.
pub(crate) async fn refund_if_due(
    ledger: &dyn CreditsLedger,
    job: &mut Job,
    reason: &str,
    at: DateTime<Utc>,
) -> bool {
    let Some(amount) = job.refund_due() else {
        return false;
    };

    match ledger.refund(job.user_id, amount, job.id, reason).await {
        Ok(receipt) => {
            job.mark_refunded(at);
            info!(job_id = %job.id, amount, balance = receipt.balance, "job refunded");
            true
        }
        Err(LedgerError::AlreadyRefunded(_)) => {
            job.mark_refunded(at);
            warn!(job_id = %job.id, "refund already recorded in ledger; syncing job flag");
            false
        }
        Err(e) => {
            error!(job_id = %job.id, amount, error = %e, "refund failed");
            false
        }
    }
}
