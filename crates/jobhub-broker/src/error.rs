//! Broker errors.

use thiserror::Error;

use jobhub_core::{CoreError, JobId, WorkerId, WorkflowId};

use crate::store::StoreError;

/// Errors returned by broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The store could not be reached or timed out; the caller may retry.
    #[error("Store unavailable: {0}")]
    TransientStore(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The job was taken out of the queue but its assignment could not be
    /// written. Not retried: a second scan would claim another job.
    #[error("Job {job_id} claimed but assignment not recorded: {reason}")]
    AssignmentNotRecorded { job_id: JobId, reason: String },

    /// Another caller removed the job from the queue and has not recorded
    /// its assignment yet.
    #[error("Job {0} is being claimed")]
    ClaimInProgress(JobId),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BrokerError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::TransientStore(_))
    }
}

impl From<StoreError> for BrokerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(msg) => BrokerError::Serialization(msg),
            other => BrokerError::TransientStore(other.to_string()),
        }
    }
}

impl From<CoreError> for BrokerError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidStateTransition { from, to } => {
                BrokerError::InvalidTransition { from, to }
            }
            CoreError::Serialization(msg) => BrokerError::Serialization(msg),
            CoreError::InvalidInput(msg) | CoreError::MalformedRequirements(msg) => {
                BrokerError::InvalidRequest(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_errors_are_transient() {
        let err = BrokerError::from(StoreError::Timeout(Duration::from_millis(5)));
        assert!(err.is_transient());

        let err = BrokerError::from(StoreError::Serialization("bad".into()));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_core_transition_error_maps() {
        let err = BrokerError::from(CoreError::InvalidStateTransition {
            from: "completed".into(),
            to: "failed".into(),
        });
        assert!(matches!(err, BrokerError::InvalidTransition { .. }));
    }
}
