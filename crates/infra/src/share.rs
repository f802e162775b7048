//! Public share metadata for jobs submitted with `is_public`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument};

use genforge_generation::{Job, JobEvent, JobEventType};

use crate::jobs::{JobStore, JobStoreError};

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

/// Best-effort share preparation; callers log failures and carry on.
#[async_trait::async_trait]
pub trait ShareAttacher: Send + Sync {
    /// Attach a share slug to a public job and persist it.
    ///
    /// Returns `None` for private jobs. Calling it again returns the
    /// existing slug. Only the slug is written, so a stale `job` copy never
    /// rolls back status changes stored by someone else.
    async fn prepare(&self, job: &mut Job) -> Result<Option<String>, ShareError>;
}

/// Derives `<model-slug>-<job id>` slugs.
pub struct SlugShareAttacher {
    jobs: Arc<dyn JobStore>,
}

impl SlugShareAttacher {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }
}

#[async_trait::async_trait]
impl ShareAttacher for SlugShareAttacher {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn prepare(&self, job: &mut Job) -> Result<Option<String>, ShareError> {
        if !job.is_public {
            return Ok(None);
        }
        if let Some(existing) = &job.share_slug {
            return Ok(Some(existing.clone()));
        }

        let candidate = share_slug(&job.model_slug, &job.id.as_uuid().simple().to_string());
        let slug = self.jobs.set_share_slug(job.id, &candidate).await?;
        job.share_slug = Some(slug.clone());
        if slug != candidate {
            return Ok(Some(slug));
        }

        let now = Utc::now();
        self.jobs
            .append_event(JobEvent::new(
                job.id,
                JobEventType::SharePrepared,
                json!({ "share_slug": slug }),
                now,
            ))
            .await?;

        info!(share_slug = %slug, "share metadata prepared");
        Ok(Some(slug))
    }
}

/// Lowercase, ASCII alphanumerics, single dashes between words.
fn share_slug(model_slug: &str, suffix: &str) -> String {
    let mut slug = String::with_capacity(model_slug.len() + suffix.len() + 1);
    for c in model_slug.chars().chain(std::iter::once('-')).chain(suffix.chars()) {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').to_string()
}
