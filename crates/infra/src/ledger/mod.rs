//! Credits ledger storage boundary.
//!
//! The ledger is the source of truth for a user's credits. Every balance change
//! goes through one of the atomic operations below, each of which appends an
//! entry and moves the cached balance in the same step.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryCreditsLedger;
pub use postgres::PostgresCreditsLedger;

use thiserror::Error;

use genforge_core::{JobId, UserId};
use genforge_credits::{CreditError, CreditLedgerEntry, DebitReceipt, RefundReceipt};

/// Ledger operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("job {0} has already been refunded")]
    AlreadyRefunded(JobId),

    #[error("amount must be positive (got {0})")]
    InvalidAmount(i64),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<CreditError> for LedgerError {
    fn from(value: CreditError) -> Self {
        match value {
            CreditError::InvalidAmount(a) => LedgerError::InvalidAmount(a),
            CreditError::InsufficientCredits { balance, required } => {
                LedgerError::InsufficientCredits { balance, required }
            }
            CreditError::AlreadyRefunded(job_id) => LedgerError::AlreadyRefunded(job_id),
        }
    }
}

/// Atomic credit operations.
#[async_trait::async_trait]
pub trait CreditsLedger: Send + Sync {
    /// Check `balance >= amount`, deduct, and append a `debit` entry.
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        note: &str,
    ) -> Result<DebitReceipt, LedgerError>;

    /// Link the newest unlinked `debit` entry carrying `note` to `job_id`.
    ///
    /// Returns whether an entry was linked.
    async fn attach_to_latest_log(
        &self,
        user_id: UserId,
        job_id: JobId,
        note: &str,
    ) -> Result<bool, LedgerError>;

    /// Credit back `amount` for `job_id`. At most one refund per job.
    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        note: &str,
    ) -> Result<RefundReceipt, LedgerError>;

    /// Credit `amount` from an external source; returns the new balance.
    async fn grant(&self, user_id: UserId, amount: i64, note: &str) -> Result<i64, LedgerError>;

    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError>;

    /// Full ledger history for a user, oldest first.
    async fn entries(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>, LedgerError>;
}
