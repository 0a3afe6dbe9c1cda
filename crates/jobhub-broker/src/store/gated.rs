//! Test store that can hold a caller at chosen points, for interleaving
//! concurrent broker calls deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use jobhub_core::{
    Job, JobEvent, JobId, QueueScore, WorkerId, WorkerRecord, Workflow, WorkflowId, WorkflowStatus,
};

use super::{JobStore, MemoryStore, StoreResult, WorkflowAppend};

/// Holds the first caller that passes once armed, until opened.
#[derive(Default)]
pub(crate) struct Gate {
    armed: AtomicBool,
    reached: Notify,
    released: Notify,
}

impl Gate {
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Wait until a caller is held at the gate.
    pub(crate) async fn reached(&self) {
        self.reached.notified().await;
    }

    pub(crate) fn open(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.reached.notify_one();
            self.released.notified().await;
        }
    }
}

/// [`MemoryStore`] with gates before claim commits and after workflow reads.
#[derive(Default)]
pub(crate) struct GatedStore {
    inner: MemoryStore,
    /// Passed before a claim is committed.
    pub(crate) claim: Gate,
    /// Passed after a workflow was read, before the result is returned.
    pub(crate) workflow_read: Gate,
    workflow_read_delay: Option<Duration>,
}

impl GatedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make every workflow read take at least `delay`.
    pub(crate) fn with_workflow_read_delay(mut self, delay: Duration) -> Self {
        self.workflow_read_delay = Some(delay);
        self
    }
}

#[async_trait]
impl JobStore for GatedStore {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.inner.put_job(job).await
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        self.inner.list_jobs().await
    }

    async fn put_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        self.inner.put_workflow(workflow).await
    }

    async fn get_workflow(&self, id: &WorkflowId) -> StoreResult<Option<Workflow>> {
        let workflow = self.inner.get_workflow(id).await?;
        if let Some(delay) = self.workflow_read_delay {
            tokio::time::sleep(delay).await;
        }
        self.workflow_read.pass().await;
        Ok(workflow)
    }

    async fn add_workflow_job(
        &self,
        id: &WorkflowId,
        job_id: &JobId,
    ) -> StoreResult<WorkflowAppend> {
        self.inner.add_workflow_job(id, job_id).await
    }

    async fn set_workflow_status(
        &self,
        workflow: &Workflow,
        from: WorkflowStatus,
    ) -> StoreResult<bool> {
        self.inner.set_workflow_status(workflow, from).await
    }

    async fn enqueue(&self, id: &JobId, score: QueueScore) -> StoreResult<()> {
        self.inner.enqueue(id, score).await
    }

    async fn top_pending(&self, n: usize) -> StoreResult<Vec<JobId>> {
        self.inner.top_pending(n).await
    }

    async fn remove_pending(&self, id: &JobId) -> StoreResult<bool> {
        self.inner.remove_pending(id).await
    }

    async fn commit_claim(&self, job: &Job) -> StoreResult<bool> {
        self.claim.pass().await;
        self.inner.commit_claim(job).await
    }

    async fn recover_orphan(
        &self,
        job: &Job,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner.recover_orphan(job, claimed_before).await
    }

    async fn pending_rank(&self, id: &JobId) -> StoreResult<Option<usize>> {
        self.inner.pending_rank(id).await
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        self.inner.pending_count().await
    }

    async fn requeue(&self, job: &Job) -> StoreResult<()> {
        self.inner.requeue(job).await
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> StoreResult<()> {
        self.inner.put_worker(worker).await
    }

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Option<WorkerRecord>> {
        self.inner.get_worker(id).await
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        self.inner.list_workers().await
    }

    async fn add_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<()> {
        self.inner.add_active_job(worker, job).await
    }

    async fn remove_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<bool> {
        self.inner.remove_active_job(worker, job).await
    }

    async fn active_jobs(&self, worker: &WorkerId) -> StoreResult<Vec<JobId>> {
        self.inner.active_jobs(worker).await
    }

    async fn append_event(&self, event: &JobEvent) -> StoreResult<()> {
        self.inner.append_event(event).await
    }

    async fn job_events(&self, id: &JobId) -> StoreResult<Vec<JobEvent>> {
        self.inner.job_events(id).await
    }
}
