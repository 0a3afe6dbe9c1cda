//! Job records, submissions and queue scores.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, JobStatus, WorkerId, WorkflowId};

/// Position of a pending job in the priority queue.
///
/// Orders by service precedence: the *smallest* score is served first.
/// Higher priority wins; within a priority the earlier submission wins, and
/// `sequence` breaks ties between submissions in the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueScore {
    pub priority: i64,
    pub submitted_at_ms: i64,
    pub sequence: u64,
}

impl QueueScore {
    pub fn new(priority: i64, submitted_at_ms: i64, sequence: u64) -> Self {
        Self {
            priority,
            submitted_at_ms,
            sequence,
        }
    }

    /// Encode as a sorted-set score where a higher value is served first.
    ///
    /// Exact as long as `priority` stays below ~900 (f64 mantissa).
    pub fn as_sorted_set_score(&self) -> f64 {
        (self.priority as f64) * 1e13 - (self.submitted_at_ms as f64)
    }
}

impl Ord for QueueScore {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.submitted_at_ms.cmp(&other.submitted_at_ms))
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for QueueScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Request to submit a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub id: Option<JobId>,

    /// Opaque job payload, passed through to the worker.
    #[serde(default)]
    pub payload: Value,

    /// Requirement document.
    #[serde(default)]
    pub requirements: Value,

    /// Existing workflow to submit under; a new workflow is created when absent.
    #[serde(default)]
    pub workflow_id: Option<WorkflowId>,

    /// Overrides the inherited workflow priority.
    #[serde(default)]
    pub priority: Option<i64>,

    #[serde(default)]
    pub customer_id: Option<String>,

    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSubmission {
    /// Create a submission with a requirement document.
    pub fn new(requirements: Value) -> Self {
        Self {
            requirements,
            ..Self::default()
        }
    }

    /// Builder method to submit under an existing workflow.
    pub fn in_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Builder method to override the priority.
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Builder method to set the customer.
    pub fn with_customer(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    /// Builder method to set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A Job represents one unit of work for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub workflow_id: WorkflowId,
    pub payload: Value,

    /// Requirement document as submitted.
    pub requirements: Value,

    pub customer_id: Option<String>,
    pub priority: i64,
    pub status: JobStatus,
    pub worker_id: Option<WorkerId>,

    /// Queue position; kept so a released job re-enters where it was.
    pub score: QueueScore,

    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
}

impl Job {
    /// Create a pending job.
    pub fn new(
        id: JobId,
        workflow_id: WorkflowId,
        requirements: Value,
        priority: i64,
        sequence: u64,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            workflow_id,
            payload: Value::Null,
            requirements,
            customer_id: None,
            priority,
            status: JobStatus::Pending,
            worker_id: None,
            score: QueueScore::new(priority, created_at.timestamp_millis(), sequence),
            created_at,
            assigned_at: None,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 0,
            error_message: None,
        }
    }

    /// Mark the job as assigned to a worker.
    pub fn assign(&mut self, worker_id: WorkerId) {
        self.status = JobStatus::Assigned;
        self.worker_id = Some(worker_id);
        self.assigned_at = Some(Utc::now());
    }

    /// Mark the job as executing.
    pub fn start(&mut self) {
        self.status = JobStatus::Active;
        self.started_at = Some(Utc::now());
    }

    /// Return the job to the pending state.
    pub fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.assigned_at = None;
        self.started_at = None;
    }

    /// Mark the job as finished with a terminal status.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        self.status = status;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.error_message = error;
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}
