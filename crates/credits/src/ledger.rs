use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use genforge_core::{JobId, LedgerEntryId, UserId};

/// Kind of balance change recorded by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Credits spent on a generation job.
    Debit,
    /// Credits returned for a job that failed after being charged.
    Refund,
    /// Credits granted from outside this subsystem (rewards, purchases).
    Grant,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "debit",
            EntryType::Refund => "refund",
            EntryType::Grant => "grant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(EntryType::Debit),
            "refund" => Some(EntryType::Refund),
            "grant" => Some(EntryType::Grant),
            _ => None,
        }
    }
}

impl core::fmt::Display for EntryType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One append-only row of the credits ledger.
///
/// `amount` is signed: debits are negative, refunds and grants positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub amount: i64,
    pub entry_type: EntryType,
    pub related_job_id: Option<JobId>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DebitReceipt {
    pub entry_id: LedgerEntryId,
    pub balance: i64,
}

/// Outcome of a successful refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefundReceipt {
    pub entry_id: LedgerEntryId,
    pub balance: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CreditError {
    #[error("amount must be positive (got {0})")]
    InvalidAmount(i64),

    #[error("insufficient credits: balance {balance}, required {required}")]
    InsufficientCredits { balance: i64, required: i64 },

    #[error("job {0} has already been refunded")]
    AlreadyRefunded(JobId),
}

/// Signed sum of ledger entries; the authoritative balance.
pub fn reconstruct_balance<'a>(entries: impl IntoIterator<Item = &'a CreditLedgerEntry>) -> i64 {
    entries.into_iter().map(|e| e.amount).sum()
}

/// Decision state for one user's credits.
///
/// Note: the balance held here is a projection of the entries applied to it.
/// Callers decide an entry, persist it, then `apply` it; nothing else moves
/// the balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditAccount {
    user_id: UserId,
    balance: i64,
    refunded_jobs: HashSet<JobId>,
}

impl CreditAccount {
    /// Empty account for a user with no ledger history.
    pub fn open(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            refunded_jobs: HashSet::new(),
        }
    }

    /// Rehydrate from the full ledger history.
    pub fn from_entries<'a>(
        user_id: UserId,
        entries: impl IntoIterator<Item = &'a CreditLedgerEntry>,
    ) -> Self {
        let mut account = Self::open(user_id);
        for entry in entries {
            account.apply(entry);
        }
        account
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn has_refund_for(&self, job_id: JobId) -> bool {
        self.refunded_jobs.contains(&job_id)
    }

    pub fn decide_debit(
        &self,
        amount: i64,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<CreditLedgerEntry, CreditError> {
        ensure_positive(amount)?;
        if self.balance < amount {
            return Err(CreditError::InsufficientCredits {
                balance: self.balance,
                required: amount,
            });
        }
        Ok(self.entry(-amount, EntryType::Debit, None, note, at))
    }

    pub fn decide_refund(
        &self,
        amount: i64,
        job_id: JobId,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<CreditLedgerEntry, CreditError> {
        ensure_positive(amount)?;
        if self.has_refund_for(job_id) {
            return Err(CreditError::AlreadyRefunded(job_id));
        }
        Ok(self.entry(amount, EntryType::Refund, Some(job_id), note, at))
    }

    pub fn decide_grant(
        &self,
        amount: i64,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<CreditLedgerEntry, CreditError> {
        ensure_positive(amount)?;
        Ok(self.entry(amount, EntryType::Grant, None, note, at))
    }

    /// Evolve the projection from a persisted entry.
    pub fn apply(&mut self, entry: &CreditLedgerEntry) {
        self.balance += entry.amount;
        if entry.entry_type == EntryType::Refund {
            if let Some(job_id) = entry.related_job_id {
                self.refunded_jobs.insert(job_id);
            }
        }
    }

    fn entry(
        &self,
        amount: i64,
        entry_type: EntryType,
        related_job_id: Option<JobId>,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> CreditLedgerEntry {
        CreditLedgerEntry {
            id: LedgerEntryId::new(),
            user_id: self.user_id,
            amount,
            entry_type,
            related_job_id,
            notes,
            created_at: at,
        }
    }
}

fn ensure_positive(amount: i64) -> Result<(), CreditError> {
    if amount <= 0 {
        return Err(CreditError::InvalidAmount(amount));
    }
    Ok(())
}
