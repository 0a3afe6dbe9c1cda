//! Broker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What to do with a requirement document whose known sections are malformed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedRequirementsPolicy {
    /// Accept the job and treat the document as empty (matches any worker).
    #[default]
    MatchAll,
    /// Reject the submission.
    Reject,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Default number of top pending jobs inspected per match request.
    pub max_scan: usize,

    /// Priority given to workflows created without one.
    pub default_priority: i64,

    /// Highest accepted priority.
    pub max_priority: i64,

    /// Attempts allowed after the first failure.
    pub default_max_retries: u32,

    /// Deadline for every store round trip.
    pub store_timeout_ms: u64,

    /// Attempts for match requests that hit a transient store error.
    pub retry_attempts: u32,

    /// Base delay for exponential backoff between attempts.
    pub retry_base_delay_ms: u64,

    pub malformed_requirements: MalformedRequirementsPolicy,

    /// Capacity of the lifecycle event broadcast channel.
    pub event_buffer: usize,

    /// How long a claim may go unrecorded before orphan recovery returns its
    /// job to the queue.
    pub claim_grace_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_scan: 100,
            default_priority: 50,
            max_priority: 100,
            default_max_retries: 3,
            store_timeout_ms: 2000,
            retry_attempts: 3,
            retry_base_delay_ms: 50,
            malformed_requirements: MalformedRequirementsPolicy::MatchAll,
            event_buffer: 1024,
            claim_grace_ms: 30_000,
        }
    }
}

impl BrokerConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn claim_grace(&self) -> Duration {
        Duration::from_millis(self.claim_grace_ms)
    }
}
