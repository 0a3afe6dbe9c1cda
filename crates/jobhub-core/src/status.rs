//! Status enums for Jobs, Workflows, and Workers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Status of a Job in the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting in the pending queue.
    #[default]
    Pending,
    /// Job was claimed by a worker but has not started.
    Assigned,
    /// Job is executing on its worker.
    Active,
    /// Job completed successfully.
    Completed,
    /// Job failed and will not be retried.
    Failed,
    /// Job was cancelled.
    Cancelled,
}

impl JobStatus {
    /// Returns true if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a worker currently holds the job.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(CoreError::InvalidInput(format!("unknown job status '{other}'"))),
        }
    }
}

/// Status of a Workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is accepting and running jobs.
    #[default]
    Active,
    /// All jobs finished successfully.
    Completed,
    /// The workflow was marked failed.
    Failed,
}

impl WorkflowStatus {
    /// Returns true if the workflow can no longer change status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// `active -> {completed, failed}`; terminal states accept nothing.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Completed) | (Self::Active, Self::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

/// Status of a Worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Worker is idle and ready to accept jobs.
    #[default]
    Idle,
    /// Worker holds at least one job.
    Busy,
    /// Worker is draining (not accepting new jobs).
    Draining,
    /// Worker disconnected.
    Offline,
}

impl WorkerStatus {
    /// Returns true if the worker can accept new jobs.
    pub fn can_accept_jobs(&self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "draining" => Ok(Self::Draining),
            "offline" => Ok(Self::Offline),
            other => Err(CoreError::InvalidInput(format!(
                "unknown worker status '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_transitions() {
        assert!(WorkflowStatus::Active.can_transition_to(WorkflowStatus::Completed));
        assert!(WorkflowStatus::Active.can_transition_to(WorkflowStatus::Failed));
        assert!(!WorkflowStatus::Completed.can_transition_to(WorkflowStatus::Failed));
        assert!(!WorkflowStatus::Failed.can_transition_to(WorkflowStatus::Active));
        assert!(!WorkflowStatus::Active.can_transition_to(WorkflowStatus::Active));
    }

    #[test]
    fn test_job_status_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Assigned,
            JobStatus::Active,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }
}
