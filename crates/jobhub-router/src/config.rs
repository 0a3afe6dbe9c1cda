//! Router configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens when a message is queued into a full queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOverflowPolicy {
    /// Evict the lowest-priority message (possibly the incoming one).
    #[default]
    DropLowest,
    /// Refuse the incoming message.
    Reject,
}

/// Router configuration. Keys are camelCase on the wire and in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RouterConfig {
    /// Deadline for a single delivery to one target.
    pub routing_timeout_ms: u64,

    pub max_queue_size: usize,
    pub queue_overflow: QueueOverflowPolicy,

    /// How long dead letters are kept before cleanup removes them.
    pub dead_letter_retention_hours: u64,

    /// Queue ruled messages and deliver them in batches instead of inline.
    pub enable_batching: bool,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,

    /// Periodically log routing statistics.
    pub enable_metrics: bool,
    pub metrics_interval_ms: u64,

    pub log_level: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_timeout_ms: 5000,
            max_queue_size: 1000,
            queue_overflow: QueueOverflowPolicy::DropLowest,
            dead_letter_retention_hours: 24,
            enable_batching: false,
            batch_size: 10,
            batch_timeout_ms: 100,
            enable_metrics: true,
            metrics_interval_ms: 30_000,
            log_level: "info".to_string(),
        }
    }
}

impl RouterConfig {
    pub fn routing_timeout(&self) -> Duration {
        Duration::from_millis(self.routing_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn dead_letter_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dead_letter_retention_hours as i64)
    }
}
