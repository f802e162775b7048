//! Postgres-backed credits ledger.
//!
//! Each mutating operation is one call to a SQL function that locks the user's
//! `credit_balances` row, appends to `credit_ledger` and moves the cached
//! balance in the same statement. The unique partial index on refunds backs
//! the at-most-one-refund-per-job rule.
//!
//! ## Error Mapping
//!
//! | Condition | `LedgerError` |
//! |-----------|---------------|
//! | `debit_credits` returns `applied = false` | `InsufficientCredits` |
//! | `refund_credits` returns `applied = false` | `AlreadyRefunded` |
//! | unique violation (`23505`) on the refund index | `AlreadyRefunded` |
//! | anything else | `Storage` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, instrument, Span};

use genforge_core::{JobId, LedgerEntryId, UserId};
use genforge_credits::{CreditLedgerEntry, DebitReceipt, EntryType, RefundReceipt};

use super::{CreditsLedger, LedgerError};

#[derive(Debug, Clone)]
pub struct PostgresCreditsLedger {
    pool: Arc<PgPool>,
}

impl PostgresCreditsLedger {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn ensure_positive(amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

#[async_trait::async_trait]
impl CreditsLedger for PostgresCreditsLedger {
    #[instrument(
        skip(self, note),
        fields(user_id = %user_id, applied = tracing::field::Empty),
        err
    )]
    async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        note: &str,
    ) -> Result<DebitReceipt, LedgerError> {
        ensure_positive(amount)?;
        let entry_id = LedgerEntryId::new();

        let row = sqlx::query("SELECT applied, new_balance FROM debit_credits($1, $2, $3, $4)")
            .bind(entry_id.as_uuid())
            .bind(user_id.as_uuid())
            .bind(amount)
            .bind(note)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("debit_credits", e))?;

        let applied: bool = row.try_get("applied").map_err(decode_error)?;
        let balance: i64 = row.try_get("new_balance").map_err(decode_error)?;
        Span::current().record("applied", applied);

        if !applied {
            return Err(LedgerError::InsufficientCredits {
                balance,
                required: amount,
            });
        }
        Ok(DebitReceipt { entry_id, balance })
    }

    #[instrument(skip(self, note), fields(user_id = %user_id, job_id = %job_id), err)]
    async fn attach_to_latest_log(
        &self,
        user_id: UserId,
        job_id: JobId,
        note: &str,
    ) -> Result<bool, LedgerError> {
        let row = sqlx::query("SELECT attach_debit_to_job($1, $2, $3) AS attached")
            .bind(user_id.as_uuid())
            .bind(job_id.as_uuid())
            .bind(note)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("attach_debit_to_job", e))?;

        row.try_get("attached").map_err(decode_error)
    }

    #[instrument(skip(self, note), fields(user_id = %user_id, job_id = %job_id), err)]
    async fn refund(
        &self,
        user_id: UserId,
        amount: i64,
        job_id: JobId,
        note: &str,
    ) -> Result<RefundReceipt, LedgerError> {
        ensure_positive(amount)?;
        let entry_id = LedgerEntryId::new();

        let row = sqlx::query(
            "SELECT applied, new_balance FROM refund_credits($1, $2, $3, $4, $5)",
        )
        .bind(entry_id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(amount)
        .bind(job_id.as_uuid())
        .bind(note)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            // Two refunds racing past the EXISTS check collide on the unique index.
            if is_unique_violation(&e) {
                LedgerError::AlreadyRefunded(job_id)
            } else {
                map_sqlx_error("refund_credits", e)
            }
        })?;

        let applied: bool = row.try_get("applied").map_err(decode_error)?;
        let balance: i64 = row.try_get("new_balance").map_err(decode_error)?;
        if !applied {
            return Err(LedgerError::AlreadyRefunded(job_id));
        }

        info!(amount, balance, "credits refunded");
        Ok(RefundReceipt { entry_id, balance })
    }

    #[instrument(skip(self, note), fields(user_id = %user_id), err)]
    async fn grant(&self, user_id: UserId, amount: i64, note: &str) -> Result<i64, LedgerError> {
        ensure_positive(amount)?;

        let row = sqlx::query("SELECT grant_credits($1, $2, $3, $4) AS balance")
            .bind(LedgerEntryId::new().as_uuid())
            .bind(user_id.as_uuid())
            .bind(amount)
            .bind(note)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("grant_credits", e))?;

        row.try_get("balance").map_err(decode_error)
    }

    async fn balance(&self, user_id: UserId) -> Result<i64, LedgerError> {
        let row = sqlx::query("SELECT balance FROM credit_balances WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_balance", e))?;

        match row {
            Some(row) => row.try_get("balance").map_err(decode_error),
            None => Ok(0),
        }
    }

    async fn entries(&self, user_id: UserId) -> Result<Vec<CreditLedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, entry_type, related_job_id, notes, created_at
            FROM credit_ledger
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_entries", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let entry = <LedgerRow as sqlx::FromRow<_>>::from_row(&row).map_err(decode_error)?;
            entries.push(entry.try_into()?);
        }
        Ok(entries)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            LedgerError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => LedgerError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_error(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(format!("failed to decode ledger row: {err}"))
}

#[derive(Debug)]
struct LedgerRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    amount: i64,
    entry_type: String,
    related_job_id: Option<uuid::Uuid>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LedgerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            entry_type: row.try_get("entry_type")?,
            related_job_id: row.try_get("related_job_id")?,
            notes: row.try_get("notes")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<LedgerRow> for CreditLedgerEntry {
    type Error = LedgerError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let entry_type = EntryType::parse(&row.entry_type).ok_or_else(|| {
            LedgerError::Storage(format!("unknown ledger entry type '{}'", row.entry_type))
        })?;
        Ok(CreditLedgerEntry {
            id: LedgerEntryId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            amount: row.amount,
            entry_type,
            related_job_id: row.related_job_id.map(JobId::from_uuid),
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}
