//! Job store abstraction.
//!
//! A store keeps the canonical job, workflow and worker records plus the
//! pending index ordered by [`QueueScore`]. [`JobStore::remove_pending`] must
//! be atomic: of any number of concurrent callers for the same id, exactly one
//! observes `true`.
//!
//! Removal leaves a claim marker behind. The remover settles the job with
//! [`JobStore::commit_claim`], while [`JobStore::recover_orphan`] returns a job
//! whose marker went stale to the queue. Both consume the marker atomically,
//! so at most one of them takes effect.

#[cfg(test)]
pub(crate) mod gated;
mod memory;
mod redis;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use jobhub_core::{
    Job, JobEvent, JobId, QueueScore, WorkerId, WorkerRecord, Workflow, WorkflowId, WorkflowStatus,
};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::BrokerError;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of appending a member job to a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowAppend {
    Added,
    /// The workflow is terminal and accepts no more jobs.
    Closed(WorkflowStatus),
    Missing,
}

/// Persistent state behind the broker.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name, for logs and metrics.
    fn name(&self) -> &'static str;

    async fn put_job(&self, job: &Job) -> StoreResult<()>;
    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>>;
    async fn list_jobs(&self) -> StoreResult<Vec<Job>>;

    /// Write a whole workflow record. Only for records no one else can see
    /// yet; later changes go through the two calls below.
    async fn put_workflow(&self, workflow: &Workflow) -> StoreResult<()>;
    async fn get_workflow(&self, id: &WorkflowId) -> StoreResult<Option<Workflow>>;

    /// Atomically append a member job if the workflow is still active.
    async fn add_workflow_job(
        &self,
        id: &WorkflowId,
        job_id: &JobId,
    ) -> StoreResult<WorkflowAppend>;

    /// Store `workflow.status` and `workflow.updated_at` only if the stored
    /// status is still `from`. Member jobs are left as stored.
    async fn set_workflow_status(
        &self,
        workflow: &Workflow,
        from: WorkflowStatus,
    ) -> StoreResult<bool>;

    /// Add a job id to the pending index (idempotent).
    async fn enqueue(&self, id: &JobId, score: QueueScore) -> StoreResult<()>;

    /// Up to `n` pending ids, best first.
    async fn top_pending(&self, n: usize) -> StoreResult<Vec<JobId>>;

    /// Atomically remove an id from the pending index and stamp a claim
    /// marker on it. Returns true only for the caller that actually removed it.
    async fn remove_pending(&self, id: &JobId) -> StoreResult<bool>;

    /// Write the record of a job taken with [`Self::remove_pending`] and drop
    /// its claim marker. Returns false, writing nothing, when the marker is
    /// gone because recovery already put the job back in the queue.
    async fn commit_claim(&self, job: &Job) -> StoreResult<bool>;

    /// Put a pending job that is missing from the pending index back into it.
    /// Does nothing, returning false, if the job is queued, no longer pending,
    /// or carries a claim marker stamped after `claimed_before`.
    async fn recover_orphan(
        &self,
        job: &Job,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Zero-based rank of a pending id, best first.
    async fn pending_rank(&self, id: &JobId) -> StoreResult<Option<usize>>;

    async fn pending_count(&self) -> StoreResult<usize>;

    /// Write a pending job record and put it back in the pending index.
    ///
    /// Backends that can do both in one round trip should override this.
    async fn requeue(&self, job: &Job) -> StoreResult<()> {
        self.put_job(job).await?;
        self.enqueue(&job.id, job.score).await
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> StoreResult<()>;
    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Option<WorkerRecord>>;
    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>>;

    /// Track a job as held by a worker.
    async fn add_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<()>;
    async fn remove_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<bool>;
    async fn active_jobs(&self, worker: &WorkerId) -> StoreResult<Vec<JobId>>;

    /// Append to a job's lifecycle event stream.
    async fn append_event(&self, event: &JobEvent) -> StoreResult<()>;
    async fn job_events(&self, id: &JobId) -> StoreResult<Vec<JobEvent>>;
}

/// Run a store call under a deadline, mapping failures to [`BrokerError`].
pub async fn timed<T, F>(timeout: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(BrokerError::from),
        Err(_) => Err(StoreError::Timeout(timeout).into()),
    }
}
