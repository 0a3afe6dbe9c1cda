//! Job broker - the job lifecycle on top of the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use jobhub_core::{
    CoreError, Job, JobEvent, JobEventType, JobId, JobRequirements, JobStatus, JobSubmission,
    WorkerCapabilities, WorkerId, WorkerRecord, WorkerStatus, Workflow, WorkflowId, WorkflowStatus,
};

use crate::config::{BrokerConfig, MalformedRequirementsPolicy};
use crate::events::EventPublisher;
use crate::matcher::CapabilityMatcher;
use crate::queue::PriorityQueue;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::{timed, JobStore, WorkflowAppend};
use crate::BrokerError;

/// A workflow together with a summary of its member jobs.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetadata {
    #[serde(flatten)]
    pub workflow: Workflow,
    pub job_count: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStatistics {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queue_depth: usize,
}

/// Worker counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatistics {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub draining: usize,
    pub offline: usize,
}

/// Accepts jobs, matches them to workers and tracks them to completion.
pub struct JobBroker {
    store: Arc<dyn JobStore>,
    queue: PriorityQueue,
    matcher: CapabilityMatcher,
    events: EventPublisher,
    config: BrokerConfig,
    retry: RetryPolicy,
    sequence: AtomicU64,
}

impl JobBroker {
    /// Create a broker over a store.
    pub fn new(store: Arc<dyn JobStore>, config: BrokerConfig) -> Self {
        let timeout = config.store_timeout();
        let queue = PriorityQueue::new(store.clone(), timeout);
        let events = EventPublisher::new(store.clone(), config.event_buffer, timeout);
        let matcher = CapabilityMatcher::new(
            store.clone(),
            queue.clone(),
            events.clone(),
            config.malformed_requirements,
            timeout,
        );
        let retry = RetryPolicy::new(config.retry_attempts, config.retry_base_delay());

        Self {
            store,
            queue,
            matcher,
            events,
            config,
            retry,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Name of the backing store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// Subscribe to job lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn timeout(&self) -> Duration {
        self.config.store_timeout()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit a job. Without a workflow id a new workflow is created for it;
    /// the job inherits the workflow's priority unless it overrides it.
    pub async fn submit_job(&self, submission: JobSubmission) -> Result<Job, BrokerError> {
        self.validate_requirements(&submission.requirements)?;
        if let Some(priority) = submission.priority {
            self.validate_priority(priority)?;
        }

        let (mut workflow, created) = match &submission.workflow_id {
            Some(id) => {
                let workflow = self.get_workflow(id).await?;
                if workflow.status.is_terminal() {
                    return Err(closed_workflow(id, workflow.status));
                }
                (workflow, false)
            }
            None => (
                Workflow::new(
                    submission.priority.unwrap_or(self.config.default_priority),
                    submission.customer_id.clone(),
                ),
                true,
            ),
        };

        let job_id = submission.id.clone().unwrap_or_else(JobId::generate);
        if timed(self.timeout(), self.store.get_job(&job_id)).await?.is_some() {
            return Err(BrokerError::InvalidRequest(format!(
                "job {} already exists",
                job_id
            )));
        }

        let priority = submission.priority.unwrap_or(workflow.priority);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut job = Job::new(
            job_id.clone(),
            workflow.id.clone(),
            submission.requirements,
            priority,
            sequence,
        );
        job.payload = submission.payload;
        job.customer_id = submission.customer_id.or_else(|| workflow.customer_id.clone());
        job.max_retries = submission
            .max_retries
            .unwrap_or(self.config.default_max_retries);

        if created {
            workflow.add_job(job_id.clone());
            timed(self.timeout(), self.store.put_workflow(&workflow)).await?;
        } else {
            let appended =
                timed(self.timeout(), self.store.add_workflow_job(&workflow.id, &job_id)).await?;
            match appended {
                WorkflowAppend::Added => {}
                WorkflowAppend::Closed(status) => return Err(closed_workflow(&workflow.id, status)),
                WorkflowAppend::Missing => return Err(BrokerError::WorkflowNotFound(workflow.id)),
            }
        }
        timed(self.timeout(), self.store.put_job(&job)).await?;
        self.queue.enqueue(&job.id, job.score).await?;

        info!(
            job_id = %job.id,
            workflow_id = %job.workflow_id,
            priority = job.priority,
            "Job submitted"
        );
        self.events
            .publish(JobEvent::submitted(job.id.clone(), job.priority))
            .await;

        Ok(job)
    }

    fn validate_requirements(&self, doc: &Value) -> Result<(), BrokerError> {
        match JobRequirements::parse(doc) {
            Ok(_) => Ok(()),
            Err(CoreError::MalformedRequirements(msg))
                if self.config.malformed_requirements == MalformedRequirementsPolicy::MatchAll =>
            {
                warn!(error = %msg, "Accepting malformed requirements; job will match any worker");
                Ok(())
            }
            Err(e) => Err(BrokerError::InvalidRequest(e.to_string())),
        }
    }

    fn validate_priority(&self, priority: i64) -> Result<(), BrokerError> {
        if !(0..=self.config.max_priority).contains(&priority) {
            return Err(BrokerError::InvalidRequest(format!(
                "priority {} outside 0..={}",
                priority, self.config.max_priority
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Matching and claiming
    // ========================================================================

    /// Claim the best pending job this worker can run, scanning the
    /// configured number of queue entries.
    pub async fn get_next_job_for_worker(
        &self,
        caps: &WorkerCapabilities,
    ) -> Result<Option<Job>, BrokerError> {
        self.get_next_job_with_scan(caps, self.config.max_scan).await
    }

    /// Like [`Self::get_next_job_for_worker`] with an explicit scan window.
    /// Transient store failures are retried with backoff.
    pub async fn get_next_job_with_scan(
        &self,
        caps: &WorkerCapabilities,
        max_scan: usize,
    ) -> Result<Option<Job>, BrokerError> {
        let job = with_backoff(self.retry, "get_next_job", || {
            self.matcher.find_matching_job(caps, max_scan)
        })
        .await?;

        if job.is_none() {
            debug!(worker_id = %caps.worker_id, max_scan, "No matching job");
        }
        Ok(job)
    }

    /// Claim a specific job for a worker. Returns `None` when the job is not
    /// pending or another caller claimed it first.
    pub async fn claim_job(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
    ) -> Result<Option<Job>, BrokerError> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Pending || !self.queue.remove(job_id).await? {
            return Ok(None);
        }
        self.matcher.finalize_claim(job, worker_id, None).await
    }

    /// Return an assigned or active job to the queue at its original position.
    pub async fn release_job(&self, job_id: &JobId) -> Result<Job, BrokerError> {
        let mut job = self.get_job(job_id).await?;
        match job.status {
            JobStatus::Assigned | JobStatus::Active => {}
            JobStatus::Pending => return Ok(job),
            other => return Err(transition(other, JobStatus::Pending)),
        }

        let holder = job.worker_id.clone();
        job.reset_to_pending();
        timed(self.timeout(), self.store.requeue(&job)).await?;
        if let Some(worker_id) = &holder {
            self.free_worker(worker_id, job_id).await?;
        }

        info!(job_id = %job_id, "Job released back to queue");
        self.events
            .publish(JobEvent::new(
                job_id.clone(),
                JobEventType::Released,
                holder,
                HashMap::new(),
            ))
            .await;

        Ok(job)
    }

    // ========================================================================
    // Execution lifecycle
    // ========================================================================

    /// Mark an assigned job as executing.
    pub async fn start_job(&self, job_id: &JobId, worker_id: &WorkerId) -> Result<Job, BrokerError> {
        let mut job = self.get_job(job_id).await?;
        ensure_holder(&job, worker_id)?;
        if job.status != JobStatus::Assigned {
            return Err(transition(job.status, JobStatus::Active));
        }

        job.start();
        timed(self.timeout(), self.store.put_job(&job)).await?;

        info!(job_id = %job_id, worker_id = %worker_id, "Job started");
        self.events
            .publish(JobEvent::new(
                job_id.clone(),
                JobEventType::Started,
                Some(worker_id.clone()),
                HashMap::new(),
            ))
            .await;

        Ok(job)
    }

    /// Record progress (0-100). The first report on an assigned job starts it.
    pub async fn update_job_progress(
        &self,
        job_id: &JobId,
        worker_id: &WorkerId,
        progress: u8,
        message: Option<String>,
    ) -> Result<Job, BrokerError> {
        if progress > 100 {
            return Err(BrokerError::InvalidRequest(format!(
                "progress {} outside 0..=100",
                progress
            )));
        }

        let mut job = self.get_job(job_id).await?;
        ensure_holder(&job, worker_id)?;
        if !job.status.is_in_flight() {
            return Err(transition(job.status, JobStatus::Active));
        }
        if job.status == JobStatus::Assigned {
            job.start();
            timed(self.timeout(), self.store.put_job(&job)).await?;
        }

        debug!(job_id = %job_id, worker_id = %worker_id, progress, "Job progress");
        self.events
            .publish(JobEvent::progress(
                job_id.clone(),
                worker_id.clone(),
                progress,
                message,
            ))
            .await;

        Ok(job)
    }

    /// Mark an in-flight job as completed.
    pub async fn complete_job(
        &self,
        job_id: &JobId,
        worker_id: Option<&WorkerId>,
    ) -> Result<Job, BrokerError> {
        let mut job = self.get_job(job_id).await?;
        if let Some(worker_id) = worker_id {
            ensure_holder(&job, worker_id)?;
        }
        if !job.status.is_in_flight() {
            return Err(transition(job.status, JobStatus::Completed));
        }

        let holder = job.worker_id.clone();
        job.finish(JobStatus::Completed, None);
        timed(self.timeout(), self.store.put_job(&job)).await?;
        if let Some(worker_id) = &holder {
            self.free_worker(worker_id, job_id).await?;
        }

        info!(job_id = %job_id, "Job completed");
        self.events
            .publish(JobEvent::new(
                job_id.clone(),
                JobEventType::Completed,
                holder,
                HashMap::new(),
            ))
            .await;

        Ok(job)
    }

    /// Mark an in-flight job as failed. A retryable failure with attempts
    /// left puts the job back in the queue at its original position.
    pub async fn fail_job(
        &self,
        job_id: &JobId,
        worker_id: Option<&WorkerId>,
        error: String,
        retryable: bool,
    ) -> Result<Job, BrokerError> {
        let mut job = self.get_job(job_id).await?;
        if let Some(worker_id) = worker_id {
            ensure_holder(&job, worker_id)?;
        }
        if !job.status.is_in_flight() {
            return Err(transition(job.status, JobStatus::Failed));
        }

        let holder = job.worker_id.clone();
        let will_retry = retryable && job.can_retry();
        job.error_message = Some(error.clone());

        if will_retry {
            job.retry_count += 1;
            job.reset_to_pending();
            timed(self.timeout(), self.store.requeue(&job)).await?;
        } else {
            job.finish(JobStatus::Failed, Some(error.clone()));
            timed(self.timeout(), self.store.put_job(&job)).await?;
        }
        if let Some(worker_id) = &holder {
            self.free_worker(worker_id, job_id).await?;
        }

        warn!(
            job_id = %job_id,
            retry_count = job.retry_count,
            will_retry,
            error = %error,
            "Job failed"
        );
        self.events
            .publish(JobEvent::failed(job_id.clone(), holder, error, will_retry))
            .await;

        Ok(job)
    }

    /// Cancel a job that has not finished.
    ///
    /// A pending job is cancelled only by the caller that takes it out of the
    /// queue. If a worker's claim got there first and has not been recorded
    /// yet, this fails with [`BrokerError::ClaimInProgress`].
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<Job, BrokerError> {
        let mut job = self.get_job(job_id).await?;
        if job.is_terminal() {
            return Err(transition(job.status, JobStatus::Cancelled));
        }

        if job.status == JobStatus::Pending {
            if self.queue.remove(job_id).await? {
                job.finish(JobStatus::Cancelled, None);
                if !timed(self.timeout(), self.store.commit_claim(&job)).await? {
                    return Err(BrokerError::ClaimInProgress(job_id.clone()));
                }
                self.announce_cancel(job_id, None).await;
                return Ok(job);
            }

            // Claimed between the read and the removal
            job = self.get_job(job_id).await?;
            match job.status {
                JobStatus::Pending => return Err(BrokerError::ClaimInProgress(job_id.clone())),
                status if status.is_terminal() => {
                    return Err(transition(status, JobStatus::Cancelled))
                }
                _ => {}
            }
        }

        let holder = job.worker_id.clone();
        job.finish(JobStatus::Cancelled, None);
        timed(self.timeout(), self.store.put_job(&job)).await?;
        if let Some(worker_id) = &holder {
            self.free_worker(worker_id, job_id).await?;
        }

        self.announce_cancel(job_id, holder).await;
        Ok(job)
    }

    async fn announce_cancel(&self, job_id: &JobId, holder: Option<WorkerId>) {
        info!(job_id = %job_id, "Job cancelled");
        self.events
            .publish(JobEvent::new(
                job_id.clone(),
                JobEventType::Cancelled,
                holder,
                HashMap::new(),
            ))
            .await;
    }

    /// Drop a finished job from a worker's active set, idling the worker
    /// when it holds nothing else.
    async fn free_worker(&self, worker_id: &WorkerId, job_id: &JobId) -> Result<(), BrokerError> {
        timed(self.timeout(), self.store.remove_active_job(worker_id, job_id)).await?;
        let remaining = timed(self.timeout(), self.store.active_jobs(worker_id)).await?;

        let Some(mut worker) = timed(self.timeout(), self.store.get_worker(worker_id)).await? else {
            return Ok(());
        };
        if worker.current_job_id.as_ref() == Some(job_id) {
            worker.current_job_id = remaining.last().cloned();
        }
        if remaining.is_empty() && worker.status == WorkerStatus::Busy {
            worker.set_status(WorkerStatus::Idle);
        }
        timed(self.timeout(), self.store.put_worker(&worker)).await
    }

    // ========================================================================
    // Workflows
    // ========================================================================

    /// Create an empty workflow.
    pub async fn create_workflow(
        &self,
        priority: Option<i64>,
        customer_id: Option<String>,
    ) -> Result<Workflow, BrokerError> {
        let priority = priority.unwrap_or(self.config.default_priority);
        self.validate_priority(priority)?;

        let workflow = Workflow::new(priority, customer_id);
        timed(self.timeout(), self.store.put_workflow(&workflow)).await?;

        info!(workflow_id = %workflow.id, priority, "Workflow created");
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Workflow, BrokerError> {
        timed(self.timeout(), self.store.get_workflow(id))
            .await?
            .ok_or_else(|| BrokerError::WorkflowNotFound(id.clone()))
    }

    /// Workflow record plus member job counts by status.
    pub async fn get_workflow_metadata(
        &self,
        id: &WorkflowId,
    ) -> Result<WorkflowMetadata, BrokerError> {
        let workflow = self.get_workflow(id).await?;

        let mut jobs_by_status = BTreeMap::new();
        for job_id in &workflow.job_ids {
            match timed(self.timeout(), self.store.get_job(job_id)).await? {
                Some(job) => *jobs_by_status.entry(job.status.to_string()).or_insert(0) += 1,
                None => warn!(workflow_id = %id, job_id = %job_id, "Workflow member job missing"),
            }
        }

        Ok(WorkflowMetadata {
            job_count: workflow.job_ids.len(),
            workflow,
            jobs_by_status,
        })
    }

    /// Move an active workflow to a terminal status.
    pub async fn update_workflow_status(
        &self,
        id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<Workflow, BrokerError> {
        let mut workflow = self.get_workflow(id).await?;
        let from = workflow.status;
        workflow.transition(status)?;

        if !timed(self.timeout(), self.store.set_workflow_status(&workflow, from)).await? {
            // Another update moved it first
            let current = self.get_workflow(id).await?;
            return Err(transition_workflow(current.status, status));
        }

        info!(workflow_id = %id, status = %status, "Workflow status updated");
        self.get_workflow(id).await
    }

    // ========================================================================
    // Workers
    // ========================================================================

    /// Register (or re-register) a worker with its capability document.
    pub async fn register_worker(
        &self,
        caps: WorkerCapabilities,
    ) -> Result<WorkerRecord, BrokerError> {
        let worker_id = caps.worker_id.clone();
        let mut worker = timed(self.timeout(), self.store.get_worker(&worker_id))
            .await?
            .unwrap_or_else(|| WorkerRecord::new(worker_id.clone()));

        if worker.status == WorkerStatus::Offline {
            worker.set_status(WorkerStatus::Idle);
        }
        worker.capabilities = Some(caps);
        worker.last_heartbeat = Utc::now();
        timed(self.timeout(), self.store.put_worker(&worker)).await?;

        info!(worker_id = %worker_id, status = %worker.status, "Worker registered");
        Ok(worker)
    }

    pub async fn update_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<WorkerRecord, BrokerError> {
        let mut worker = self.get_worker(worker_id).await?;
        worker.set_status(status);
        worker.last_heartbeat = Utc::now();
        timed(self.timeout(), self.store.put_worker(&worker)).await?;

        debug!(worker_id = %worker_id, status = %status, "Worker status updated");
        Ok(worker)
    }

    /// Refresh a worker's liveness timestamp. Unknown workers are created.
    pub async fn record_heartbeat(&self, worker_id: &WorkerId) -> Result<WorkerRecord, BrokerError> {
        let mut worker = timed(self.timeout(), self.store.get_worker(worker_id))
            .await?
            .unwrap_or_else(|| WorkerRecord::new(worker_id.clone()));
        worker.last_heartbeat = Utc::now();
        if worker.status == WorkerStatus::Offline {
            worker.set_status(WorkerStatus::Idle);
        }
        timed(self.timeout(), self.store.put_worker(&worker)).await?;
        Ok(worker)
    }

    /// Take a worker offline, releasing every job it holds. Returns the
    /// released job ids.
    pub async fn disconnect_worker(&self, worker_id: &WorkerId) -> Result<Vec<JobId>, BrokerError> {
        let held = timed(self.timeout(), self.store.active_jobs(worker_id)).await?;

        let mut released = Vec::new();
        for job_id in held {
            match self.release_job(&job_id).await {
                Ok(job) if job.status == JobStatus::Pending => released.push(job_id),
                Ok(_) => {}
                Err(BrokerError::InvalidTransition { .. }) | Err(BrokerError::JobNotFound(_)) => {
                    timed(self.timeout(), self.store.remove_active_job(worker_id, &job_id)).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(mut worker) = timed(self.timeout(), self.store.get_worker(worker_id)).await? {
            worker.set_status(WorkerStatus::Offline);
            worker.current_job_id = None;
            timed(self.timeout(), self.store.put_worker(&worker)).await?;
        }

        info!(worker_id = %worker_id, released = released.len(), "Worker disconnected");
        Ok(released)
    }

    pub async fn get_worker(&self, worker_id: &WorkerId) -> Result<WorkerRecord, BrokerError> {
        timed(self.timeout(), self.store.get_worker(worker_id))
            .await?
            .ok_or_else(|| BrokerError::WorkerNotFound(worker_id.clone()))
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRecord>, BrokerError> {
        let mut workers = timed(self.timeout(), self.store.list_workers()).await?;
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    pub async fn worker_statistics(&self) -> Result<WorkerStatistics, BrokerError> {
        let workers = timed(self.timeout(), self.store.list_workers()).await?;
        let mut stats = WorkerStatistics {
            total: workers.len(),
            ..WorkerStatistics::default()
        };
        for worker in &workers {
            match worker.status {
                WorkerStatus::Idle => stats.idle += 1,
                WorkerStatus::Busy => stats.busy += 1,
                WorkerStatus::Draining => stats.draining += 1,
                WorkerStatus::Offline => stats.offline += 1,
            }
        }
        Ok(stats)
    }

    // ========================================================================
    // Liveness
    // ========================================================================

    /// Disconnect workers whose last heartbeat is older than `timeout`.
    pub async fn reap_stale_workers(&self, timeout: Duration) -> Result<Vec<WorkerId>, BrokerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let workers = timed(self.timeout(), self.store.list_workers()).await?;

        let mut reaped = Vec::new();
        for worker in workers {
            if worker.status == WorkerStatus::Offline || worker.last_heartbeat >= cutoff {
                continue;
            }
            warn!(
                worker_id = %worker.worker_id,
                last_heartbeat = %worker.last_heartbeat,
                "Worker missed heartbeats, disconnecting"
            );
            self.disconnect_worker(&worker.worker_id).await?;
            reaped.push(worker.worker_id);
        }
        Ok(reaped)
    }

    /// Put pending jobs that are missing from the queue back into it.
    ///
    /// This recovers jobs whose claim removed them from the queue but whose
    /// assignment was never written. Claims younger than the grace period are
    /// still in flight and left alone. A claim older than that which does
    /// finish later finds the job recovered and gives it up.
    pub async fn requeue_orphaned_jobs(&self) -> Result<Vec<JobId>, BrokerError> {
        let grace = chrono::Duration::from_std(self.config.claim_grace())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let claimed_before = Utc::now() - grace;
        let jobs = timed(self.timeout(), self.store.list_jobs()).await?;

        let mut requeued = Vec::new();
        for job in jobs {
            if job.status != JobStatus::Pending {
                continue;
            }
            if timed(self.timeout(), self.store.recover_orphan(&job, claimed_before)).await? {
                warn!(job_id = %job.id, "Pending job missing from queue, re-queued");
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_job(&self, job_id: &JobId) -> Result<Job, BrokerError> {
        timed(self.timeout(), self.store.get_job(job_id))
            .await?
            .ok_or_else(|| BrokerError::JobNotFound(job_id.clone()))
    }

    /// Lifecycle events recorded for a job, oldest first.
    pub async fn job_events(&self, job_id: &JobId) -> Result<Vec<JobEvent>, BrokerError> {
        timed(self.timeout(), self.store.job_events(job_id)).await
    }

    /// One-based queue position of a pending job; `None` once it left the
    /// queue.
    pub async fn get_queue_position(&self, job_id: &JobId) -> Result<Option<usize>, BrokerError> {
        self.queue.position(job_id).await
    }

    pub async fn get_queue_depth(&self) -> Result<usize, BrokerError> {
        self.queue.depth().await
    }

    /// The best `limit` pending jobs in queue order.
    pub async fn pending_jobs(&self, limit: usize) -> Result<Vec<Job>, BrokerError> {
        let ids = self.queue.top_n(limit).await?;
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = timed(self.timeout(), self.store.get_job(&id)).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    pub async fn job_statistics(&self) -> Result<JobStatistics, BrokerError> {
        let jobs = timed(self.timeout(), self.store.list_jobs()).await?;
        let mut stats = JobStatistics {
            total: jobs.len(),
            queue_depth: self.queue.depth().await?,
            ..JobStatistics::default()
        };
        for job in &jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Assigned => stats.assigned += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }
}

fn transition(from: JobStatus, to: JobStatus) -> BrokerError {
    BrokerError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn transition_workflow(from: WorkflowStatus, to: WorkflowStatus) -> BrokerError {
    BrokerError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn closed_workflow(id: &WorkflowId, status: WorkflowStatus) -> BrokerError {
    BrokerError::InvalidRequest(format!("workflow {} is {}", id, status))
}

fn ensure_holder(job: &Job, worker_id: &WorkerId) -> Result<(), BrokerError> {
    if job.worker_id.as_ref() != Some(worker_id) {
        return Err(BrokerError::InvalidRequest(format!(
            "job {} is not held by worker {}",
            job.id, worker_id
        )));
    }
    Ok(())
}
