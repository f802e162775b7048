use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use tracing::instrument;

use genforge_core::{JobId, UserId};
use genforge_generation::{Job, JobEvent, JobOutput, NewJob};

use super::{JobStore, JobStoreError};

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    by_provider_job_id: HashMap<String, JobId>,
    outputs: HashMap<JobId, Vec<JobOutput>>,
    events: HashMap<JobId, Vec<JobEvent>>,
}

/// In-memory job store for tests/dev.
///
/// One lock guards all tables and is held only for the duration of a single
/// operation, so work on different jobs never waits on a slow caller.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    #[instrument(skip(self, new_job), fields(user_id = %new_job.user_id), err)]
    async fn admit(&self, new_job: NewJob, limit: u32) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;

        let active = tables
            .jobs
            .values()
            .filter(|j| j.user_id == new_job.user_id && j.status.is_active())
            .count();
        if active >= limit as usize {
            return Err(JobStoreError::ConcurrencyLimitExceeded { limit });
        }

        let job = Job::admitted(new_job, Utc::now());
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn get_for_user(
        &self,
        user_id: UserId,
        job_id: JobId,
    ) -> Result<Option<Job>, JobStoreError> {
        Ok(self
            .read()?
            .jobs
            .get(&job_id)
            .filter(|j| j.user_id == user_id)
            .cloned())
    }

    async fn find_by_provider_job_id(
        &self,
        provider_job_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let tables = self.read()?;
        Ok(tables
            .by_provider_job_id
            .get(provider_job_id)
            .and_then(|id| tables.jobs.get(id))
            .cloned())
    }

    async fn save(&self, job: &mut Job) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .jobs
            .get(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        if stored.revision != job.revision {
            return Err(JobStoreError::Conflict(job.id));
        }

        let mut next = job.clone();
        next.share_slug = stored.share_slug.clone();
        next.revision += 1;
        if let Some(provider_job_id) = &next.provider_job_id {
            tables
                .by_provider_job_id
                .insert(provider_job_id.clone(), next.id);
        }
        tables.jobs.insert(next.id, next);
        job.revision += 1;
        Ok(())
    }

    async fn set_share_slug(&self, job_id: JobId, slug: &str) -> Result<String, JobStoreError> {
        let mut tables = self.write()?;
        let stored = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        Ok(stored
            .share_slug
            .get_or_insert_with(|| slug.to_string())
            .clone())
    }

    async fn list_for_user(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn output_urls(&self, job_id: JobId) -> Result<Vec<String>, JobStoreError> {
        Ok(self
            .read()?
            .outputs
            .get(&job_id)
            .map(|outs| outs.iter().map(|o| o.url.clone()).collect())
            .unwrap_or_default())
    }

    async fn insert_outputs(&self, outputs: Vec<JobOutput>) -> Result<usize, JobStoreError> {
        let mut tables = self.write()?;
        let mut inserted = 0;
        for output in outputs {
            if !tables.jobs.contains_key(&output.job_id) {
                return Err(JobStoreError::NotFound(output.job_id));
            }
            let existing = tables.outputs.entry(output.job_id).or_default();
            let urls: HashSet<&str> = existing.iter().map(|o| o.url.as_str()).collect();
            if urls.contains(output.url.as_str()) {
                continue;
            }
            existing.push(output);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn outputs(&self, job_id: JobId) -> Result<Vec<JobOutput>, JobStoreError> {
        let mut outputs = self
            .read()?
            .outputs
            .get(&job_id)
            .cloned()
            .unwrap_or_default();
        outputs.sort_by_key(|o| o.index);
        Ok(outputs)
    }

    async fn append_event(&self, event: JobEvent) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if !tables.jobs.contains_key(&event.job_id) {
            return Err(JobStoreError::NotFound(event.job_id));
        }
        tables.events.entry(event.job_id).or_default().push(event);
        Ok(())
    }

    async fn events(&self, job_id: JobId) -> Result<Vec<JobEvent>, JobStoreError> {
        Ok(self
            .read()?
            .events
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use genforge_generation::{CostEstimate, JobEventType, JobStatus, OutputKind};
    use serde_json::json;

    fn new_job(user_id: UserId) -> NewJob {
        NewJob {
            user_id,
            provider_code: "freepik".to_string(),
            modality_code: "text-to-image".to_string(),
            model_slug: "mystic".to_string(),
            input_params: json!({"prompt": "a red fox"}),
            is_public: false,
            cost: CostEstimate::new("mystic", 5),
        }
    }

    #[tokio::test]
    async fn admit_rejects_when_user_is_at_limit() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();

        let first = store.admit(new_job(user), 1).await.unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        let err = store.admit(new_job(user), 1).await.unwrap_err();
        assert_eq!(err, JobStoreError::ConcurrencyLimitExceeded { limit: 1 });

        // Other users are unaffected.
        store.admit(new_job(UserId::new()), 1).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_jobs_free_a_slot() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();

        let mut job = store.admit(new_job(user), 1).await.unwrap();
        job.mark_failed("boom", Utc::now());
        store.save(&mut job).await.unwrap();

        store.admit(new_job(user), 1).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_never_exceed_limit() {
        let store = Arc::new(InMemoryJobStore::new());
        let user = UserId::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.admit(new_job(user), 4).await }));
        }

        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn provider_job_id_lookup_follows_save() {
        let store = InMemoryJobStore::new();
        let mut job = store.admit(new_job(UserId::new()), 4).await.unwrap();
        assert!(store.find_by_provider_job_id("task-1").await.unwrap().is_none());

        job.link_provider("task-1", Utc::now());
        store.save(&mut job).await.unwrap();

        let found = store.find_by_provider_job_id("task-1").await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
    }

    #[tokio::test]
    async fn stale_copy_cannot_overwrite_a_newer_save() {
        let store = InMemoryJobStore::new();
        let mut fresh = store.admit(new_job(UserId::new()), 4).await.unwrap();
        let mut stale = fresh.clone();

        fresh.mark_failed("provider said no", Utc::now());
        store.save(&mut fresh).await.unwrap();
        assert_eq!(fresh.revision, 1);

        stale.observe_provider_status("IN_PROGRESS", Utc::now());
        let err = store.save(&mut stale).await.unwrap_err();
        assert_eq!(err, JobStoreError::Conflict(stale.id));
        assert_eq!(stale.revision, 0);

        let stored = store.get(fresh.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn share_slug_is_set_once_and_survives_saves() {
        let store = InMemoryJobStore::new();
        let mut job = store.admit(new_job(UserId::new()), 4).await.unwrap();

        assert_eq!(store.set_share_slug(job.id, "first").await.unwrap(), "first");
        assert_eq!(store.set_share_slug(job.id, "second").await.unwrap(), "first");

        // The caller's copy never saw the slug; saving it must not erase it.
        job.mark_failed("x", Utc::now());
        store.save(&mut job).await.unwrap();
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.share_slug.as_deref(), Some("first"));

        let err = store.set_share_slug(JobId::new(), "x").await.unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_for_user_hides_other_users_jobs() {
        let store = InMemoryJobStore::new();
        let owner = UserId::new();
        let job = store.admit(new_job(owner), 4).await.unwrap();

        assert!(store.get_for_user(owner, job.id).await.unwrap().is_some());
        assert!(store.get_for_user(UserId::new(), job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_output_urls_are_skipped() {
        let store = InMemoryJobStore::new();
        let job = store.admit(new_job(UserId::new()), 4).await.unwrap();
        let now = Utc::now();

        let first = vec![
            JobOutput::new(job.id, 0, OutputKind::Image, "https://cdn/a.png", now),
            JobOutput::new(job.id, 1, OutputKind::Image, "https://cdn/b.png", now),
        ];
        assert_eq!(store.insert_outputs(first).await.unwrap(), 2);

        let again = vec![JobOutput::new(
            job.id,
            2,
            OutputKind::Image,
            "https://cdn/a.png",
            now,
        )];
        assert_eq!(store.insert_outputs(again).await.unwrap(), 0);
        assert_eq!(
            store.output_urls(job.id).await.unwrap(),
            vec!["https://cdn/a.png", "https://cdn/b.png"]
        );
    }

    #[tokio::test]
    async fn events_are_append_only_in_order() {
        let store = InMemoryJobStore::new();
        let job = store.admit(new_job(UserId::new()), 4).await.unwrap();
        let now = Utc::now();

        store
            .append_event(JobEvent::new(job.id, JobEventType::TaskCreated, json!({}), now))
            .await
            .unwrap();
        store
            .append_event(JobEvent::new(job.id, JobEventType::TaskCompleted, json!({}), now))
            .await
            .unwrap();

        let types: Vec<_> = store
            .events(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec![JobEventType::TaskCreated, JobEventType::TaskCompleted]);
    }

    #[tokio::test]
    async fn list_for_user_is_newest_first_and_limited() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut job = store.admit(new_job(user), 10).await.unwrap();
            ids.push(job.id);
            job.mark_failed("x", Utc::now());
            store.save(&mut job).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let listed = store.list_for_user(user, 2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
    }
}
