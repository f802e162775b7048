//! Generation job persistence.
//!
//! ## Components
//!
//! - `JobStore`: job rows, outputs and the append-only event trail
//! - `InMemoryJobStore`: single-process store for tests/dev
//! - `PostgresJobStore`: durable store; admission is serialized per user with
//!   a transaction-scoped advisory lock
//!
//! `admit` is the concurrency admission gate: counting a user's active jobs and
//! inserting the new one happen as one linearizable step, so two racing
//! requests can never both slip under the cap.
//!
//! `save` is a compare-and-swap on `Job::revision`: a writer holding a stale
//! copy gets `Conflict` and must reload before retrying.

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

use thiserror::Error;

use genforge_core::{JobId, UserId};
use genforge_generation::{Job, JobEvent, JobOutput, NewJob};

/// Job store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobStoreError {
    #[error("concurrency limit reached ({limit} active jobs allowed)")]
    ConcurrencyLimitExceeded { limit: u32 },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {0} was modified concurrently")]
    Conflict(JobId),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically count the user's active jobs and insert `new_job` as
    /// `pending` if fewer than `limit` are active.
    async fn admit(&self, new_job: NewJob, limit: u32) -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Owner-scoped lookup; another user's job reads as absent.
    async fn get_for_user(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError>;

    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Write the mutable columns if the stored revision still equals
    /// `job.revision`, then bump `job.revision` to match the stored row.
    ///
    /// Fails with `Conflict` when another writer saved first. `share_slug`
    /// is not written here; see [`JobStore::set_share_slug`].
    async fn save(&self, job: &mut Job) -> Result<(), JobStoreError>;

    /// Set the share slug unless one is already stored. Returns the slug the
    /// job ends up with. Touches no other column.
    async fn set_share_slug(&self, job_id: JobId, slug: &str) -> Result<String, JobStoreError>;

    /// Newest first.
    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn output_urls(&self, job_id: JobId) -> Result<Vec<String>, JobStoreError>;

    /// Insert outputs, skipping any `(job_id, url)` already stored.
    ///
    /// Returns how many rows were inserted.
    async fn insert_outputs(&self, outputs: Vec<JobOutput>) -> Result<usize, JobStoreError>;

    /// Ordered by output index.
    async fn outputs(&self, job_id: JobId) -> Result<Vec<JobOutput>, JobStoreError>;

    async fn append_event(&self, event: JobEvent) -> Result<(), JobStoreError>;

    /// Oldest first.
    async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError>;
}
