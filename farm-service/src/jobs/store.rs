// Job Store
// Persistence for job documents with conditional replace semantics

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;

use crate::error::{ServiceError, ServiceResult};

use super::job::Job;
use super::types::{JobId, StreamId};

/// Storage for job documents.
///
/// Writes are conditional on the document's update index: a replace only
/// succeeds when the stored index matches the one the caller read, and each
/// successful write increments it. Callers that lose the race re-read and
/// reapply their change.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Add a new job
    async fn insert(&self, job: Job) -> ServiceResult<Job>;

    /// Fetch a job, failing if it does not exist
    async fn get(&self, job_id: &JobId) -> ServiceResult<Job>;

    /// Fetch a job if it exists
    async fn try_get(&self, job_id: &JobId) -> Option<Job>;

    /// Replace a job if the stored update index still matches the one in
    /// `job`. Returns the stored document with its new index on success, or
    /// `None` if another writer got there first.
    async fn try_replace(&self, job: Job) -> ServiceResult<Option<Job>>;

    /// Remove a job, failing if it does not exist
    async fn remove(&self, job_id: &JobId) -> ServiceResult<()>;

    /// All jobs in the given stream
    async fn find_by_stream(&self, stream_id: &StreamId) -> Vec<Job>;

    /// All jobs
    async fn list(&self) -> Vec<Job>;
}

/// In-memory job store
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    /// Number of upcoming replaces to fail as if a concurrent writer won
    forced_conflicts: AtomicU64,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            forced_conflicts: AtomicU64::new(0),
        }
    }

    /// Make the next `count` replaces fail with a version mismatch, as if
    /// another writer had updated the document in between
    pub fn inject_conflicts(&self, count: u64) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                if count > 0 {
                    Some(count - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> ServiceResult<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(ServiceError::internal(format!(
                "job {} already exists",
                job.id
            )));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &JobId) -> ServiceResult<Job> {
        self.try_get(job_id)
            .await
            .ok_or_else(|| ServiceError::not_found(format!("job {}", job_id)))
    }

    async fn try_get(&self, job_id: &JobId) -> Option<Job> {
        self.jobs.read().await.get(job_id).cloned()
    }

    async fn try_replace(&self, mut job: Job) -> ServiceResult<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| ServiceError::not_found(format!("job {}", job.id)))?;

        if stored.update_index != job.update_index {
            return Ok(None);
        }
        if self.take_forced_conflict() {
            // Simulate a concurrent writer by advancing the stored index
            // underneath the caller
            stored.update_index += 1;
            return Ok(None);
        }

        job.update_index += 1;
        job.update_time = SystemTime::now();
        *stored = job.clone();
        Ok(Some(job))
    }

    async fn remove(&self, job_id: &JobId) -> ServiceResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.remove(job_id).is_none() {
            return Err(ServiceError::not_found(format!("job {}", job_id)));
        }
        Ok(())
    }

    async fn find_by_stream(&self, stream_id: &StreamId) -> Vec<Job> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| &job.stream_id == stream_id)
            .cloned()
            .collect()
    }

    async fn list(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}
