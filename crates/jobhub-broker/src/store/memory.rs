//! In-process store.

use std::collections::{BTreeSet, HashMap};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use jobhub_core::{
    Job, JobEvent, JobId, JobStatus, QueueScore, WorkerId, WorkerRecord, Workflow, WorkflowId,
    WorkflowStatus,
};

use super::{JobStore, StoreResult, WorkflowAppend};
#[cfg(test)]
use super::StoreError;

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    workflows: HashMap<WorkflowId, Workflow>,
    pending: BTreeSet<(QueueScore, JobId)>,
    pending_scores: HashMap<JobId, QueueScore>,
    /// Claim markers: when each in-flight claim removed its job.
    claims: HashMap<JobId, DateTime<Utc>>,
    workers: HashMap<WorkerId, WorkerRecord>,
    active: HashMap<WorkerId, BTreeSet<JobId>>,
    events: HashMap<JobId, Vec<JobEvent>>,
}

/// Store backed by process memory. Every operation holds one lock, so
/// conditional removal is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    #[cfg(test)]
    failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a connection error.
    #[cfg(test)]
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_fault(&self) -> StoreResult<()> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            return Err(StoreError::Connection("injected failure".to_string()));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_fault(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        self.check_fault()?;
        self.inner.write().await.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.check_fault()?;
        Ok(self.inner.read().await.jobs.get(id).cloned())
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        self.check_fault()?;
        Ok(self.inner.read().await.jobs.values().cloned().collect())
    }

    async fn put_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        self.check_fault()?;
        self.inner
            .write()
            .await
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &WorkflowId) -> StoreResult<Option<Workflow>> {
        self.check_fault()?;
        Ok(self.inner.read().await.workflows.get(id).cloned())
    }

    async fn add_workflow_job(
        &self,
        id: &WorkflowId,
        job_id: &JobId,
    ) -> StoreResult<WorkflowAppend> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        let Some(workflow) = inner.workflows.get_mut(id) else {
            return Ok(WorkflowAppend::Missing);
        };
        if workflow.status.is_terminal() {
            return Ok(WorkflowAppend::Closed(workflow.status));
        }
        workflow.add_job(job_id.clone());
        Ok(WorkflowAppend::Added)
    }

    async fn set_workflow_status(
        &self,
        workflow: &Workflow,
        from: WorkflowStatus,
    ) -> StoreResult<bool> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        match inner.workflows.get_mut(&workflow.id) {
            Some(stored) if stored.status == from => {
                stored.status = workflow.status;
                stored.updated_at = workflow.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn enqueue(&self, id: &JobId, score: QueueScore) -> StoreResult<()> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.pending_scores.insert(id.clone(), score) {
            inner.pending.remove(&(old, id.clone()));
        }
        inner.pending.insert((score, id.clone()));
        Ok(())
    }

    async fn top_pending(&self, n: usize) -> StoreResult<Vec<JobId>> {
        self.check_fault()?;
        let inner = self.inner.read().await;
        Ok(inner.pending.iter().take(n).map(|(_, id)| id.clone()).collect())
    }

    async fn remove_pending(&self, id: &JobId) -> StoreResult<bool> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        match inner.pending_scores.remove(id) {
            Some(score) => {
                inner.pending.remove(&(score, id.clone()));
                inner.claims.insert(id.clone(), Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn commit_claim(&self, job: &Job) -> StoreResult<bool> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        if inner.claims.remove(&job.id).is_none() {
            return Ok(false);
        }
        inner.jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn recover_orphan(
        &self,
        job: &Job,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        if inner.pending_scores.contains_key(&job.id) {
            return Ok(false);
        }
        let stored_pending = inner
            .jobs
            .get(&job.id)
            .is_some_and(|stored| stored.status == JobStatus::Pending);
        if !stored_pending {
            return Ok(false);
        }
        if inner.claims.get(&job.id).is_some_and(|at| *at > claimed_before) {
            return Ok(false);
        }

        inner.claims.remove(&job.id);
        inner.pending_scores.insert(job.id.clone(), job.score);
        inner.pending.insert((job.score, job.id.clone()));
        Ok(true)
    }

    async fn pending_rank(&self, id: &JobId) -> StoreResult<Option<usize>> {
        self.check_fault()?;
        let inner = self.inner.read().await;
        let Some(score) = inner.pending_scores.get(id) else {
            return Ok(None);
        };
        Ok(Some(inner.pending.range(..(*score, id.clone())).count()))
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        self.check_fault()?;
        Ok(self.inner.read().await.pending.len())
    }

    async fn requeue(&self, job: &Job) -> StoreResult<()> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        inner.jobs.insert(job.id.clone(), job.clone());
        if let Some(old) = inner.pending_scores.insert(job.id.clone(), job.score) {
            inner.pending.remove(&(old, job.id.clone()));
        }
        inner.pending.insert((job.score, job.id.clone()));
        Ok(())
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> StoreResult<()> {
        self.check_fault()?;
        self.inner
            .write()
            .await
            .workers
            .insert(worker.worker_id.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Option<WorkerRecord>> {
        self.check_fault()?;
        Ok(self.inner.read().await.workers.get(id).cloned())
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        self.check_fault()?;
        Ok(self.inner.read().await.workers.values().cloned().collect())
    }

    async fn add_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<()> {
        self.check_fault()?;
        self.inner
            .write()
            .await
            .active
            .entry(worker.clone())
            .or_default()
            .insert(job.clone());
        Ok(())
    }

    async fn remove_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<bool> {
        self.check_fault()?;
        let mut inner = self.inner.write().await;
        Ok(inner
            .active
            .get_mut(worker)
            .map(|jobs| jobs.remove(job))
            .unwrap_or(false))
    }

    async fn active_jobs(&self, worker: &WorkerId) -> StoreResult<Vec<JobId>> {
        self.check_fault()?;
        let inner = self.inner.read().await;
        Ok(inner
            .active
            .get(worker)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn append_event(&self, event: &JobEvent) -> StoreResult<()> {
        self.check_fault()?;
        self.inner
            .write()
            .await
            .events
            .entry(event.job_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn job_events(&self, id: &JobId) -> StoreResult<Vec<JobEvent>> {
        self.check_fault()?;
        Ok(self
            .inner
            .read()
            .await
            .events
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_index_orders_by_score() {
        let store = MemoryStore::new();
        store.enqueue(&JobId::new("low"), QueueScore::new(1, 100, 0)).await.unwrap();
        store.enqueue(&JobId::new("high"), QueueScore::new(9, 200, 1)).await.unwrap();
        store.enqueue(&JobId::new("low2"), QueueScore::new(1, 300, 2)).await.unwrap();

        let top = store.top_pending(10).await.unwrap();
        assert_eq!(top, vec![JobId::new("high"), JobId::new("low"), JobId::new("low2")]);
        assert_eq!(store.pending_rank(&JobId::new("low2")).await.unwrap(), Some(2));
        assert_eq!(store.pending_rank(&JobId::new("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_pending_wins_once() {
        let store = MemoryStore::new();
        let id = JobId::new("j1");
        store.enqueue(&id, QueueScore::new(1, 1, 0)).await.unwrap();

        assert!(store.remove_pending(&id).await.unwrap());
        assert!(!store.remove_pending(&id).await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    fn pending_job(id: &str) -> Job {
        Job::new(JobId::new(id), WorkflowId::new("wf"), serde_json::Value::Null, 5, 0)
    }

    #[tokio::test]
    async fn test_commit_and_recovery_consume_one_claim() {
        let store = MemoryStore::new();
        let job = pending_job("j1");
        store.put_job(&job).await.unwrap();
        store.enqueue(&job.id, job.score).await.unwrap();
        assert!(store.remove_pending(&job.id).await.unwrap());

        // A claim stamped after the cutoff is left alone
        let cutoff = Utc::now() - chrono::Duration::seconds(30);
        assert!(!store.recover_orphan(&job, cutoff).await.unwrap());

        assert!(store.recover_orphan(&job, Utc::now()).await.unwrap());
        assert_eq!(store.pending_rank(&job.id).await.unwrap(), Some(0));

        let mut assigned = job.clone();
        assigned.assign(WorkerId::new("w1"));
        assert!(!store.commit_claim(&assigned).await.unwrap());
        let stored = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_recovery_skips_committed_claims() {
        let store = MemoryStore::new();
        let job = pending_job("j1");
        store.put_job(&job).await.unwrap();
        store.enqueue(&job.id, job.score).await.unwrap();
        assert!(store.remove_pending(&job.id).await.unwrap());

        let mut assigned = job.clone();
        assigned.assign(WorkerId::new("w1"));
        assert!(store.commit_claim(&assigned).await.unwrap());

        // The caller's snapshot is stale; the stored record decides
        assert!(!store.recover_orphan(&job, Utc::now()).await.unwrap());
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workflow_append_and_status_swap() {
        let store = MemoryStore::new();
        let workflow = Workflow::new(5, None);
        store.put_workflow(&workflow).await.unwrap();

        let appended = store
            .add_workflow_job(&workflow.id, &JobId::new("j1"))
            .await
            .unwrap();
        assert_eq!(appended, WorkflowAppend::Added);

        // The snapshot predates j1; swapping status must not drop it
        let mut completed = workflow.clone();
        completed.transition(WorkflowStatus::Completed).unwrap();
        assert!(store
            .set_workflow_status(&completed, WorkflowStatus::Active)
            .await
            .unwrap());
        assert!(!store
            .set_workflow_status(&completed, WorkflowStatus::Active)
            .await
            .unwrap());

        let stored = store.get_workflow(&workflow.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkflowStatus::Completed);
        assert_eq!(stored.job_ids, vec![JobId::new("j1")]);

        let appended = store
            .add_workflow_job(&workflow.id, &JobId::new("j2"))
            .await
            .unwrap();
        assert_eq!(appended, WorkflowAppend::Closed(WorkflowStatus::Completed));
        let missing = store
            .add_workflow_job(&WorkflowId::new("nope"), &JobId::new("j3"))
            .await
            .unwrap();
        assert_eq!(missing, WorkflowAppend::Missing);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let store = MemoryStore::new();
        let id = JobId::new("j1");
        store.enqueue(&id, QueueScore::new(1, 1, 0)).await.unwrap();
        store.enqueue(&id, QueueScore::new(1, 1, 0)).await.unwrap();
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(1);
        assert!(store.pending_count().await.is_err());
        assert!(store.pending_count().await.is_ok());
    }
}
