//! Job lifecycle events.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ids::{EventId, JobId, WorkerId};
use crate::message::{BaseMessage, MessageType, SourceKind};

/// A lifecycle event appended to a job's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Unique event identifier.
    pub id: EventId,
    /// Job this event belongs to.
    pub job_id: JobId,
    /// Type of event.
    pub event_type: JobEventType,
    /// Worker involved, if any.
    pub worker_id: Option<WorkerId>,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (priority, progress, error, etc.).
    pub metadata: HashMap<String, String>,
}

impl JobEvent {
    /// Create a new job event.
    pub fn new(
        job_id: JobId,
        event_type: JobEventType,
        worker_id: Option<WorkerId>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: EventId::generate(),
            job_id,
            event_type,
            worker_id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    /// Create a Submitted event.
    pub fn submitted(job_id: JobId, priority: i64) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("priority".to_string(), priority.to_string());
        Self::new(job_id, JobEventType::Submitted, None, metadata)
    }

    /// Create an Assigned event.
    pub fn assigned(job_id: JobId, worker_id: WorkerId) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("old_status".to_string(), "pending".to_string());
        metadata.insert("new_status".to_string(), "assigned".to_string());
        Self::new(job_id, JobEventType::Assigned, Some(worker_id), metadata)
    }

    /// Create a Progress event.
    pub fn progress(job_id: JobId, worker_id: WorkerId, progress: u8, message: Option<String>) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("progress".to_string(), progress.to_string());
        if let Some(m) = message {
            metadata.insert("message".to_string(), m);
        }
        Self::new(job_id, JobEventType::Progress, Some(worker_id), metadata)
    }

    /// Create a Failed or Retried event.
    pub fn failed(job_id: JobId, worker_id: Option<WorkerId>, error: String, will_retry: bool) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("error".to_string(), error);
        let event_type = if will_retry {
            JobEventType::Retried
        } else {
            JobEventType::Failed
        };
        Self::new(job_id, event_type, worker_id, metadata)
    }

    /// Wire message announcing this event to workers, clients and monitors.
    pub fn to_message(&self) -> BaseMessage {
        let mut payload = json!({
            "job_id": self.job_id.as_str(),
            "event": self.event_type.as_str(),
        });
        if let Value::Object(map) = &mut payload {
            if let Some(worker_id) = &self.worker_id {
                map.insert("worker_id".to_string(), json!(worker_id.as_str()));
            }
            for (k, v) in &self.metadata {
                map.entry(k.clone()).or_insert_with(|| json!(v));
            }
        }
        BaseMessage::new(self.event_type.message_type(), payload, SourceKind::Hub)
            .with_timestamp(self.timestamp_ms)
    }
}

/// Type of job lifecycle event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Submitted,
    Assigned,
    Released,
    Started,
    Progress,
    Completed,
    /// Failed and re-queued for another attempt.
    Retried,
    Failed,
    Cancelled,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Assigned => "assigned",
            Self::Released => "released",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Retried => "retried",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Wire message type used to announce this event.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Assigned => MessageType::JobAssigned,
            Self::Progress => MessageType::UpdateJobProgress,
            Self::Completed => MessageType::CompleteJob,
            Self::Failed => MessageType::JobFailed,
            Self::Cancelled => MessageType::CancelJob,
            Self::Submitted | Self::Released | Self::Started | Self::Retried => {
                MessageType::JobStatusChanged
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assigned_event() {
        let event = JobEvent::assigned(JobId::new("j1"), WorkerId::new("w1"));

        assert_eq!(event.event_type, JobEventType::Assigned);
        assert_eq!(event.worker_id, Some(WorkerId::new("w1")));
        assert_eq!(event.metadata.get("new_status"), Some(&"assigned".to_string()));
        assert!(event.timestamp_ms > 0);
    }

    #[test]
    fn test_failed_event_with_retry() {
        let event = JobEvent::failed(JobId::new("j1"), None, "oom".to_string(), true);
        assert_eq!(event.event_type, JobEventType::Retried);
        assert_eq!(event.metadata.get("error"), Some(&"oom".to_string()));
    }

    #[test]
    fn test_event_to_message() {
        let event = JobEvent::assigned(JobId::new("j1"), WorkerId::new("w1"));
        let msg = event.to_message();

        assert_eq!(msg.message_type, MessageType::JobAssigned);
        assert_eq!(msg.source_kind, SourceKind::Hub);
        assert_eq!(msg.payload["job_id"], "j1");
        assert_eq!(msg.payload["worker_id"], "w1");
        assert_eq!(msg.timestamp, event.timestamp_ms);
    }
}
