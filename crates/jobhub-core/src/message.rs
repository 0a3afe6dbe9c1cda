//! Wire message envelope.
//!
//! Every message on the wire is a JSON object
//! `{ "type", "payload", "sourceKind", "sourceId"?, "timestamp" }`.
//! Field order is fixed and payload key order is preserved, so a message in
//! compact canonical form serializes back to the exact bytes it was parsed from.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::capability::lookup_path;
use crate::CoreError;

/// Discriminates wire messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Job lifecycle
    SubmitJob,
    UpdateJobProgress,
    CompleteJob,
    JobFailed,
    CancelJob,
    JobAssigned,
    JobStatusChanged,

    // Worker lifecycle
    RegisterWorker,
    WorkerStatus,
    #[serde(rename = "heartbeat")]
    WorkerHeartbeat,
    WorkerDisconnect,

    // System / service
    ServiceRequest,
    SystemStatus,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 14] = [
        MessageType::SubmitJob,
        MessageType::UpdateJobProgress,
        MessageType::CompleteJob,
        MessageType::JobFailed,
        MessageType::CancelJob,
        MessageType::JobAssigned,
        MessageType::JobStatusChanged,
        MessageType::RegisterWorker,
        MessageType::WorkerStatus,
        MessageType::WorkerHeartbeat,
        MessageType::WorkerDisconnect,
        MessageType::ServiceRequest,
        MessageType::SystemStatus,
        MessageType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubmitJob => "submit_job",
            Self::UpdateJobProgress => "update_job_progress",
            Self::CompleteJob => "complete_job",
            Self::JobFailed => "job_failed",
            Self::CancelJob => "cancel_job",
            Self::JobAssigned => "job_assigned",
            Self::JobStatusChanged => "job_status_changed",
            Self::RegisterWorker => "register_worker",
            Self::WorkerStatus => "worker_status",
            Self::WorkerHeartbeat => "heartbeat",
            Self::WorkerDisconnect => "worker_disconnect",
            Self::ServiceRequest => "service_request",
            Self::SystemStatus => "system_status",
            Self::Error => "error",
        }
    }

    /// Returns true for job lifecycle messages.
    pub fn is_job_message(&self) -> bool {
        matches!(
            self,
            Self::SubmitJob
                | Self::UpdateJobProgress
                | Self::CompleteJob
                | Self::JobFailed
                | Self::CancelJob
                | Self::JobAssigned
                | Self::JobStatusChanged
        )
    }

    /// Returns true for worker lifecycle messages.
    pub fn is_worker_message(&self) -> bool {
        matches!(
            self,
            Self::RegisterWorker
                | Self::WorkerStatus
                | Self::WorkerHeartbeat
                | Self::WorkerDisconnect
        )
    }

    /// Payload keys a message of this type must carry.
    pub fn required_payload_fields(&self) -> &'static [&'static str] {
        match self {
            Self::SubmitJob => &[],
            Self::UpdateJobProgress => &["job_id", "progress"],
            Self::CompleteJob | Self::CancelJob | Self::JobAssigned | Self::JobStatusChanged => {
                &["job_id"]
            }
            Self::JobFailed => &["job_id", "error"],
            Self::RegisterWorker => &["capabilities"],
            Self::WorkerStatus => &["status"],
            Self::WorkerHeartbeat | Self::WorkerDisconnect => &[],
            Self::ServiceRequest => &["service"],
            Self::SystemStatus => &[],
            Self::Error => &["error"],
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::InvalidInput(format!("unknown message type '{s}'")))
    }
}

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Worker,
    Client,
    Hub,
    System,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Client => "client",
            Self::Hub => "hub",
            Self::System => "system",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    pub payload: Value,

    #[serde(rename = "sourceKind")]
    pub source_kind: SourceKind,

    /// Absent on the wire when unset; an explicit `null` does not parse.
    #[serde(
        rename = "sourceId",
        default,
        deserialize_with = "present_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_id: Option<String>,

    /// Unix timestamp (milliseconds).
    pub timestamp: i64,
}

impl BaseMessage {
    /// Create a message stamped with the current time.
    pub fn new(message_type: MessageType, payload: Value, source_kind: SourceKind) -> Self {
        Self {
            message_type,
            payload,
            source_kind,
            source_id: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Builder method to set the sender id.
    pub fn with_source_id(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    /// Builder method to set the timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = timestamp_ms;
        self
    }

    /// Parse a raw wire message. Returns `None` for anything that is not a
    /// complete, well-typed envelope.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }

    /// Serialize to compact wire form.
    pub fn to_json(&self) -> Result<String, CoreError> {
        Ok(serde_json::to_string(self)?)
    }

    /// String field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Resolve a dot-path over the wire form (`"type"`, `"payload.job_id"`).
    pub fn field(&self, path: &str) -> Option<Value> {
        let doc = serde_json::to_value(self).ok()?;
        lookup_path(&doc, path).cloned()
    }
}

fn present_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_is_exact() {
        let raws = [
            r#"{"type":"submit_job","payload":{"requirements":{"service":"image"},"priority":5},"sourceKind":"client","sourceId":"c1","timestamp":1700000000000}"#,
            r#"{"type":"heartbeat","payload":{},"sourceKind":"worker","sourceId":"w1","timestamp":1700000000001}"#,
            r#"{"type":"system_status","payload":{"zeta":1,"alpha":[1,2,{"b":null,"a":true}]},"sourceKind":"system","timestamp":1}"#,
        ];
        for raw in raws {
            let msg = BaseMessage::parse(raw).expect("well-formed message");
            assert_eq!(msg.to_json().unwrap(), raw);
        }
    }

    #[test]
    fn test_parse_rejects_invalid_input() {
        let full = r#"{"type":"heartbeat","payload":{},"sourceKind":"worker","timestamp":1}"#;
        for cut in [1, 10, full.len() / 2, full.len() - 1] {
            assert!(BaseMessage::parse(&full[..cut]).is_none());
        }
        assert!(BaseMessage::parse("").is_none());
        assert!(BaseMessage::parse("not json").is_none());
        assert!(BaseMessage::parse(
            r#"{"type":"teleport","payload":{},"sourceKind":"worker","timestamp":1}"#
        )
        .is_none());
        assert!(BaseMessage::parse(
            r#"{"type":"heartbeat","payload":{},"sourceKind":"worker","timestamp":1,"extra":1}"#
        )
        .is_none());
        assert!(BaseMessage::parse(r#"{"type":"heartbeat","payload":{}}"#).is_none());
    }

    #[test]
    fn test_null_source_id_does_not_parse() {
        let raw = r#"{"type":"heartbeat","payload":{},"sourceKind":"worker","sourceId":null,"timestamp":1}"#;
        assert!(BaseMessage::parse(raw).is_none());

        let raw = r#"{"type":"heartbeat","payload":{},"sourceKind":"worker","timestamp":1}"#;
        let msg = BaseMessage::parse(raw).unwrap();
        assert_eq!(msg.source_id, None);
        assert_eq!(msg.to_json().unwrap(), raw);
    }

    #[test]
    fn test_message_type_strings() {
        for t in MessageType::ALL {
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
    }

    #[test]
    fn test_field_lookup() {
        let msg = BaseMessage::new(
            MessageType::JobFailed,
            json!({"job_id": "j1", "error": "oom"}),
            SourceKind::Worker,
        )
        .with_source_id("w1");

        assert_eq!(msg.field("type"), Some(json!("job_failed")));
        assert_eq!(msg.field("sourceId"), Some(json!("w1")));
        assert_eq!(msg.field("payload.error"), Some(json!("oom")));
        assert_eq!(msg.field("payload.missing"), None);
        assert_eq!(msg.payload_str("job_id"), Some("j1"));
    }
}
