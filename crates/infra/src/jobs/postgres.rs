//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | `JobStoreError` | Scenario |
//! |------------|-----------------|-----------------|----------|
//! | Database | `GF001` | `ConcurrencyLimitExceeded` | user already at the cap |
//! | Database | `23503` | `NotFound` | output or event for a job that does not exist |
//! | N/A (0 rows) | N/A | `Conflict` | `save` with a stale `revision` |
//! | Database | any other | `Storage` | |
//! | PoolClosed / other | N/A | `Storage` | network errors, closed pool |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{instrument, Span};

use genforge_core::{JobEventId, JobId, JobOutputId, UserId};
use genforge_generation::{
    Job, JobEvent, JobEventType, JobOutput, JobStatus, NewJob, OutputKind,
};

use super::{JobStore, JobStoreError};

const JOB_COLUMNS: &str = r#"
    id, user_id, provider_code, modality_code, model_slug, input_params, metadata,
    provider_job_id, cost_estimated_credits, cost_actual_credits, pricing_snapshot,
    is_public, share_slug, status, created_at, started_at, completed_at, updated_at,
    revision
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, new_job),
        fields(user_id = %new_job.user_id, active = tracing::field::Empty),
        err
    )]
    async fn admit(&self, new_job: NewJob, limit: u32) -> Result<Job, JobStoreError> {
        let job = Job::admitted(new_job, Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Holds the per-user advisory lock until commit.
        let row = sqlx::query("SELECT admit_generation_job($1, $2) AS active")
            .bind(job.user_id.as_uuid())
            .bind(limit as i32)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if has_sqlstate(&e, CONCURRENCY_LIMIT_SQLSTATE) {
                    JobStoreError::ConcurrencyLimitExceeded { limit }
                } else {
                    map_sqlx_error("admit_generation_job", e)
                }
            })?;
        let active: i32 = row.try_get("active").map_err(decode_error)?;
        Span::current().record("active", active);

        sqlx::query(
            r#"
            INSERT INTO generation_jobs (
                id, user_id, provider_code, modality_code, model_slug, input_params, metadata,
                provider_job_id, cost_estimated_credits, cost_actual_credits, pricing_snapshot,
                is_public, share_slug, status, created_at, started_at, completed_at, updated_at,
                revision
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19
            )
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(&job.provider_code)
        .bind(&job.modality_code)
        .bind(&job.model_slug)
        .bind(&job.input_params)
        .bind(JsonValue::Object(job.metadata.clone()))
        .bind(&job.provider_job_id)
        .bind(job.cost_estimated_credits)
        .bind(job.cost_actual_credits)
        .bind(&job.pricing_snapshot)
        .bind(job.is_public)
        .bind(&job.share_slug)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.revision)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        optional_job(row)
    }

    async fn get_for_user(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(user_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job_for_user", e))?;
        optional_job(row)
    }

    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql =
            format!("SELECT {JOB_COLUMNS} FROM generation_jobs WHERE provider_job_id = $1");
        let row = sqlx::query(&sql)
            .bind(provider_job_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_provider_job_id", e))?;
        optional_job(row)
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, status = %job.status, revision = job.revision),
        err
    )]
    async fn save(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET metadata = $2,
                provider_job_id = $3,
                cost_actual_credits = $4,
                status = $5,
                started_at = $6,
                completed_at = $7,
                updated_at = $8,
                revision = revision + 1
            WHERE id = $1 AND revision = $9
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(JsonValue::Object(job.metadata.clone()))
        .bind(&job.provider_job_id)
        .bind(job.cost_actual_credits)
        .bind(job.status.as_str())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .bind(job.revision)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM generation_jobs WHERE id = $1")
                .bind(job.id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("save_job", e))?;
            return Err(match exists {
                Some(_) => JobStoreError::Conflict(job.id),
                None => JobStoreError::NotFound(job.id),
            });
        }
        job.revision += 1;
        Ok(())
    }

    #[instrument(skip(self, slug), fields(job_id = %job_id), err)]
    async fn set_share_slug(&self, job_id: JobId, slug: &str) -> Result<String, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE generation_jobs
            SET share_slug = COALESCE(share_slug, $2)
            WHERE id = $1
            RETURNING share_slug
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(slug)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_share_slug", e))?
        .ok_or(JobStoreError::NotFound(job_id))?;

        row.try_get("share_slug").map_err(decode_error)
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(JobRow::from_row(&row).map_err(decode_error)?.try_into()?);
        }
        Ok(jobs)
    }

    async fn output_urls(&self, job_id: JobId) -> Result<Vec<String>, JobStoreError> {
        let rows = sqlx::query(
            "SELECT url FROM generation_job_outputs WHERE job_id = $1 ORDER BY output_index",
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_output_urls", e))?;

        rows.iter()
            .map(|r| r.try_get("url").map_err(decode_error))
            .collect()
    }

    #[instrument(skip(self, outputs), fields(count = outputs.len()), err)]
    async fn insert_outputs(&self, outputs: Vec<JobOutput>) -> Result<usize, JobStoreError> {
        if outputs.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut inserted = 0usize;
        for output in &outputs {
            let result = sqlx::query(
                r#"
                INSERT INTO generation_job_outputs (id, job_id, output_index, kind, url, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (job_id, url) DO NOTHING
                "#,
            )
            .bind(output.id.as_uuid())
            .bind(output.job_id.as_uuid())
            .bind(output.index)
            .bind(output.kind.as_str())
            .bind(&output.url)
            .bind(output.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if has_sqlstate(&e, FOREIGN_KEY_VIOLATION) {
                    JobStoreError::NotFound(output.job_id)
                } else {
                    map_sqlx_error("insert_output", e)
                }
            })?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(inserted)
    }

    async fn outputs(&self, job_id: JobId) -> Result<Vec<JobOutput>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, output_index, kind, url, created_at
            FROM generation_job_outputs
            WHERE job_id = $1
            ORDER BY output_index ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_outputs", e))?;

        let mut outputs = Vec::with_capacity(rows.len());
        for row in rows {
            outputs.push(OutputRow::from_row(&row).map_err(decode_error)?.try_into()?);
        }
        Ok(outputs)
    }

    async fn append_event(&self, event: JobEvent) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO generation_job_events (id, job_id, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(event.job_id.as_uuid())
        .bind(event.event_type.as_str())
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if has_sqlstate(&e, FOREIGN_KEY_VIOLATION) {
                JobStoreError::NotFound(event.job_id)
            } else {
                map_sqlx_error("append_event", e)
            }
        })?;
        Ok(())
    }

    async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, event_type, payload, created_at
            FROM generation_job_events
            WHERE job_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_events", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(EventRow::from_row(&row).map_err(decode_error)?.try_into()?);
        }
        Ok(events)
    }
}

/// Raised by `admit_generation_job` when the user is at the cap.
const CONCURRENCY_LIMIT_SQLSTATE: &str = "GF001";

const FOREIGN_KEY_VIOLATION: &str = "23503";

fn optional_job(row: Option<PgRow>) -> Result<Option<Job>, JobStoreError> {
    match row {
        Some(row) => Ok(Some(JobRow::from_row(&row).map_err(decode_error)?.try_into()?)),
        None => Ok(None),
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn has_sqlstate(err: &sqlx::Error, sqlstate: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == sqlstate;
        }
    }
    false
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    user_id: uuid::Uuid,
    provider_code: String,
    modality_code: String,
    model_slug: String,
    input_params: JsonValue,
    metadata: JsonValue,
    provider_job_id: Option<String>,
    cost_estimated_credits: i64,
    cost_actual_credits: i64,
    pricing_snapshot: JsonValue,
    is_public: bool,
    share_slug: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    revision: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            provider_code: row.try_get("provider_code")?,
            modality_code: row.try_get("modality_code")?,
            model_slug: row.try_get("model_slug")?,
            input_params: row.try_get("input_params")?,
            metadata: row.try_get("metadata")?,
            provider_job_id: row.try_get("provider_job_id")?,
            cost_estimated_credits: row.try_get("cost_estimated_credits")?,
            cost_actual_credits: row.try_get("cost_actual_credits")?,
            pricing_snapshot: row.try_get("pricing_snapshot")?,
            is_public: row.try_get("is_public")?,
            share_slug: row.try_get("share_slug")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
            revision: row.try_get("revision")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown job status '{}'", row.status))
        })?;
        let metadata = match row.metadata {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            provider_code: row.provider_code,
            modality_code: row.modality_code,
            model_slug: row.model_slug,
            input_params: row.input_params,
            metadata,
            provider_job_id: row.provider_job_id,
            cost_estimated_credits: row.cost_estimated_credits,
            cost_actual_credits: row.cost_actual_credits,
            pricing_snapshot: row.pricing_snapshot,
            is_public: row.is_public,
            share_slug: row.share_slug,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            revision: row.revision,
        })
    }
}

#[derive(Debug)]
struct OutputRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    output_index: i32,
    kind: String,
    url: String,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutputRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutputRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            output_index: row.try_get("output_index")?,
            kind: row.try_get("kind")?,
            url: row.try_get("url")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<OutputRow> for JobOutput {
    type Error = JobStoreError;

    fn try_from(row: OutputRow) -> Result<Self, Self::Error> {
        let kind = OutputKind::parse(&row.kind).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown output kind '{}'", row.kind))
        })?;
        Ok(JobOutput {
            id: JobOutputId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            index: row.output_index,
            kind,
            url: row.url,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    event_type: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<EventRow> for JobEvent {
    type Error = JobStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event_type = JobEventType::parse(&row.event_type).ok_or_else(|| {
            JobStoreError::Storage(format!("unknown job event type '{}'", row.event_type))
        })?;
        Ok(JobEvent {
            id: JobEventId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            event_type,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}
