//! jobhub Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - The job store
//! - Runtime specifics
//!
//! Jobs, workflows, worker capability documents, job requirement documents,
//! lifecycle events and the wire message envelope all live here.

pub mod capability;
pub mod error;
pub mod event;
pub mod ids;
pub mod job;
pub mod message;
pub mod requirements;
pub mod status;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use capability::{lookup_path, CapabilityValue};
pub use error::CoreError;
pub use event::{JobEvent, JobEventType};
pub use ids::{EventId, JobId, WorkerId, WorkflowId};
pub use job::{Job, JobSubmission, QueueScore};
pub use message::{BaseMessage, MessageType, SourceKind};
pub use requirements::{Floor, HardwareRequirements, JobRequirements, ModelRequirement};
pub use status::{JobStatus, WorkerStatus, WorkflowStatus};
pub use worker::{
    Capacity, CustomerAccess, HardwareProfile, IsolationLevel, WorkerCapabilities, WorkerRecord,
};
pub use workflow::Workflow;
