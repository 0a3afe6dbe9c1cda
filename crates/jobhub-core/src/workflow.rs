//! Workflow records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, JobId, WorkflowId, WorkflowStatus};

/// A Workflow groups jobs and lends them its priority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub priority: i64,
    pub customer_id: Option<String>,
    pub status: WorkflowStatus,

    /// Member jobs in submission order.
    pub job_ids: Vec<JobId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    /// Create an active workflow.
    pub fn new(priority: i64, customer_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::generate(),
            priority,
            customer_id,
            status: WorkflowStatus::Active,
            job_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: WorkflowId) -> Self {
        self.id = id;
        self
    }

    /// Record a member job.
    pub fn add_job(&mut self, job_id: JobId) {
        self.job_ids.push(job_id);
        self.updated_at = Utc::now();
    }

    /// Move to a new status, rejecting anything but `active -> terminal`.
    pub fn transition(&mut self, next: WorkflowStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
