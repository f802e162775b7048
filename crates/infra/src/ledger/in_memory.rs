use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{info, instrument};

use genforge_core::{JobId, UserId};
use genforge_credits::{CreditAccount, CreditLedgerEntry, DebitReceipt, EntryType, RefundReceipt};

use super::{CreditsLedger, LedgerError};

#[derive(Debug)]
struct Account {
    state: CreditAccount,
    entries: Vec<CreditLedgerEntry>,
}

impl Account {
    fn open(user_id: UserId) -> Self {
        Self {
            state: CreditAccount::open(user_id),
            entries: Vec::new(),
        }
    }

    fn record(&mut self, entry: CreditLedgerEntry) -> i64 {
        self.state.apply(&entry);
        self.entries.push(entry);
        self.state.balance()
    }
}

/// In-memory credits ledger.
///
/// Intended for tests/dev. Each operation decides and appends under a single
/// write lock, so check-and-deduct is atomic per process.
#[derive(Debug, Default)]
pub struct InMemoryCreditsLedger {
    accounts: RwLock<HashMap<UserId, Account>>,
}

impl InMemoryCreditsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_account<T>(
        &self,
        user_id: UserId,
        f: impl FnOnce(&mut Account) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut accounts = self
            .accounts
            .write()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        let account = accounts
            .entry(user_id)
            .or_insert_with(|| Account::open(user_id));
        f(account)
    }
}

#[async_trait::async_trait]
impl CreditsLedger for InMemoryCreditsLedger {
    #[instrument(skip(self, note), fields(user_id = %user_id), err)]
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        note: &str,
    ) -> Result<DebitReceipt, LedgerError> {
        self.with_account(user_id, |account| {
            let entry = account
                .state
                .decide_debit(amount, Some(note.to_string()), Utc::now())?;
            let entry_id = entry.id;
            let balance = account.record(entry);
            Ok(DebitReceipt { entry_id, balance })
        })
    }

    async fn attach_to_latest_log(
        &self,
        user_id: UserId,
        job_id: JobId,
        note: &str,
    ) -> Result<bool, LedgerError> {
        self.with_account(user_id, |account| {
            let target = account.entries.iter_mut().rev().find(|e| {
                e.entry_type == EntryType::Debit
                    && e.related_job_id.is_none()
                    && e.notes.as_deref() == Some(note)
            });
            Ok(match target {
                Some(entry) => {
                    entry.related_job_id = Some(job_id);
                    true
                }
                None => false,
            })
        })
    }

    #[instrument(skip(self, note), fields(user_id = %user_id, job_id = %job_id), err)]
    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        note: &str,
    ) -> Result<RefundReceipt, LedgerError> {
        self.with_account(user_id, |account| {
            let entry = account
                .state
                .decide_refund(amount, job_id, Some(note.to_string()), Utc::now())?;
            let entry_id = entry.id;
            let balance = account.record(entry);
            info!(amount, balance, "credits refunded");
            Ok(RefundReceipt { entry_id, balance })
        })
    }

    #[instrument(skip(self, note), fields(user_id = %user_id), err)]
    async fn grant(&self, user_id: UserId, amount: i64, note: &str) -> Result<i64, LedgerError> {
        self.with_account(user_id, |account| {
            let entry = account
                .state
                .decide_grant(amount, Some(note.to_string()), Utc::now())?;
            Ok(account.record(entry))
        })
    }

    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(accounts.get(&user_id).map(|a| a.state.balance()).unwrap_or(0))
    }

    async fn entries(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>, LedgerError> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| LedgerError::Storage("lock poisoned".to_string()))?;
        Ok(accounts
            .get(&user_id)
            .map(|a| a.entries.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genforge_credits::reconstruct_balance;
    use proptest::prelude::*;

    #[tokio::test]
    async fn debit_then_refund_restores_balance() {
        let ledger = InMemoryCreditsLedger::new();
        let user = UserId::new();
        let job = JobId::new();

        assert_eq!(ledger.grant(user, 50, "signup").await.unwrap(), 50);
        let debit = ledger.debit(user, 20, "generation:mystic").await.unwrap();
        assert_eq!(debit.balance, 30);

        let refund = ledger.refund(user, 20, job, "provider failure").await.unwrap();
        assert_eq!(refund.balance, 50);
        assert_eq!(ledger.balance(user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_ledger_untouched() {
        let ledger = InMemoryCreditsLedger::new();
        let user = UserId::new();
        ledger.grant(user, 5, "signup").await.unwrap();

        let err = ledger.debit(user, 20, "generation:kling-v2").await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientCredits {
                balance: 5,
                required: 20
            }
        );
        assert_eq!(ledger.balance(user).await.unwrap(), 5);
        assert_eq!(ledger.entries(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_refund_for_same_job_is_rejected() {
        let ledger = InMemoryCreditsLedger::new();
        let user = UserId::new();
        let job = JobId::new();
        ledger.grant(user, 10, "signup").await.unwrap();
        ledger.debit(user, 10, "generation").await.unwrap();

        ledger.refund(user, 10, job, "failed").await.unwrap();
        let err = ledger.refund(user, 10, job, "failed").await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadyRefunded(job));
        assert_eq!(ledger.balance(user).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn attach_links_only_the_latest_matching_debit() {
        let ledger = InMemoryCreditsLedger::new();
        let user = UserId::new();
        let job = JobId::new();
        ledger.grant(user, 100, "signup").await.unwrap();
        ledger.debit(user, 5, "generation:mystic").await.unwrap();
        ledger.debit(user, 5, "generation:mystic").await.unwrap();

        assert!(ledger.attach_to_latest_log(user, job, "generation:mystic").await.unwrap());
        assert!(!ledger.attach_to_latest_log(user, job, "generation:other").await.unwrap());

        let entries = ledger.entries(user).await.unwrap();
        assert_eq!(entries[1].related_job_id, None);
        assert_eq!(entries[2].related_job_id, Some(job));
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let ledger = InMemoryCreditsLedger::new();
        let user = UserId::new();
        assert_eq!(
            ledger.grant(user, 0, "x").await.unwrap_err(),
            LedgerError::InvalidAmount(0)
        );
        assert_eq!(
            ledger.debit(user, -1, "x").await.unwrap_err(),
            LedgerError::InvalidAmount(-1)
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Grant(i64),
        Debit(i64),
        Refund(i64, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..100).prop_map(Op::Grant),
            (1i64..100).prop_map(Op::Debit),
            ((1i64..100), (0usize..4)).prop_map(|(a, j)| Op::Refund(a, j)),
        ]
    }

    proptest! {
        #[test]
        fn cached_balance_matches_reconstructed_ledger(ops in prop::collection::vec(op(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let ledger = InMemoryCreditsLedger::new();
                let user = UserId::new();
                let jobs: Vec<JobId> = (0..4).map(|_| JobId::new()).collect();

                for op in ops {
                    let _ = match op {
                        Op::Grant(a) => ledger.grant(user, a, "grant").await.map(|_| ()),
                        Op::Debit(a) => ledger.debit(user, a, "debit").await.map(|_| ()),
                        Op::Refund(a, j) => {
                            ledger.refund(user, a, jobs[j], "refund").await.map(|_| ())
                        }
                    };

                    let balance = ledger.balance(user).await.unwrap();
                    let entries = ledger.entries(user).await.unwrap();
                    prop_assert_eq!(balance, reconstruct_balance(&entries));
                    prop_assert!(balance >= 0);

                    let refunds = entries
                        .iter()
                        .filter(|e| e.entry_type == EntryType::Refund)
                        .count();
                    let distinct: std::collections::HashSet<_> = entries
                        .iter()
                        .filter(|e| e.entry_type == EntryType::Refund)
                        .filter_map(|e| e.related_job_id)
                        .collect();
                    prop_assert_eq!(refunds, distinct.len());
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
