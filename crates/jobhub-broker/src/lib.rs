//! jobhub Broker
//!
//! Persists jobs, workflows and workers behind the [`JobStore`] trait,
//! orders pending jobs in a priority queue and hands each one to at most one
//! capable worker.
//!
//! The only atomic primitive the broker relies on is conditional removal from
//! the pending index: whoever removes a job id first owns the job.

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod queue;
pub mod retry;
pub mod store;

pub use broker::{JobBroker, JobStatistics, WorkerStatistics, WorkflowMetadata};
pub use config::{BrokerConfig, MalformedRequirementsPolicy};
pub use error::BrokerError;
pub use events::EventPublisher;
pub use matcher::{matches, CapabilityMatcher};
pub use queue::PriorityQueue;
pub use store::{JobStore, MemoryStore, RedisStore, StoreError, WorkflowAppend};
