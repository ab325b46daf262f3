//! Job persistence seam

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::JobError;
use super::model::{GenerationJob, JobSummary};

pub type JobMutation<'a> = &'a (dyn Fn(&mut GenerationJob) -> Result<(), JobError> + Send + Sync);

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: GenerationJob) -> Result<(), JobError>;

    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, JobError>;

    /// Apply `mutation` atomically. Nothing is written when it fails.
    async fn update(&self, id: Uuid, mutation: JobMutation<'_>) -> Result<GenerationJob, JobError>;

    /// Remove a job, but only when `guard` accepts it
    async fn delete(&self, id: Uuid, guard: JobMutation<'_>) -> Result<(), JobError>;

    /// Summaries for one owner, newest first
    async fn list_for_owner(
        &self,
        owner: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobSummary>, JobError>;
}

/// In-memory job store (for testing/local development)
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, GenerationJob>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: GenerationJob) -> Result<(), JobError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<GenerationJob>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, id: Uuid, mutation: JobMutation<'_>) -> Result<GenerationJob, JobError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        let mut next = stored.clone();
        mutation(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn delete(&self, id: Uuid, guard: JobMutation<'_>) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        guard(stored)?;
        jobs.remove(&id);
        Ok(())
    }

    async fn list_for_owner(
        &self,
        owner: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobSummary>, JobError> {
        let jobs = self.jobs.read().await;
        let mut owned: Vec<&GenerationJob> = jobs.values().filter(|j| j.owner == owner).collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(owned
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(GenerationJob::summary)
            .collect())
    }
}
