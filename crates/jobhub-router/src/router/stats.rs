//! Routing statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Snapshot of routing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingStatistics {
    /// Messages delivered to at least one target.
    pub routed: u64,
    /// Individual delivery failures.
    pub failed: u64,
    pub queued: u64,
    pub dead_lettered: u64,
    /// Messages denied by a filter or evicted from a full queue.
    pub dropped: u64,
    /// Deliveries made, counting each target.
    pub deliveries: u64,
    /// Enabled routing rules.
    pub active_routes: usize,
    pub subscribed_channels: usize,
    pub queue_depth: usize,
    pub dead_letter_count: usize,
    pub average_latency_ms: f64,
    pub max_latency_ms: f64,
    pub last_routed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    routed: u64,
    failed: u64,
    queued: u64,
    dead_lettered: u64,
    dropped: u64,
    deliveries: u64,
    latency_total: Duration,
    latency_samples: u64,
    latency_max: Duration,
    last_routed_at: Option<DateTime<Utc>>,
}

/// Lock-protected routing counters.
#[derive(Default)]
pub(crate) struct RoutingCounters {
    inner: Mutex<Counters>,
}

impl RoutingCounters {
    pub async fn record_delivered(&self, targets: usize, latency: Duration) {
        let mut c = self.inner.lock().await;
        if targets > 0 {
            c.routed += 1;
        }
        c.deliveries += targets as u64;
        c.latency_total += latency;
        c.latency_samples += 1;
        c.latency_max = c.latency_max.max(latency);
        c.last_routed_at = Some(Utc::now());
    }

    pub async fn record_failed(&self, n: usize) {
        self.inner.lock().await.failed += n as u64;
    }

    pub async fn record_queued(&self) {
        self.inner.lock().await.queued += 1;
    }

    pub async fn record_dead_lettered(&self) {
        self.inner.lock().await.dead_lettered += 1;
    }

    pub async fn record_dropped(&self) {
        self.inner.lock().await.dropped += 1;
    }

    /// Counter fields of a snapshot; the caller fills in the gauges.
    pub async fn snapshot(&self) -> RoutingStatistics {
        let c = self.inner.lock().await;
        let average = if c.latency_samples == 0 {
            0.0
        } else {
            c.latency_total.as_secs_f64() * 1000.0 / c.latency_samples as f64
        };
        RoutingStatistics {
            routed: c.routed,
            failed: c.failed,
            queued: c.queued,
            dead_lettered: c.dead_lettered,
            dropped: c.dropped,
            deliveries: c.deliveries,
            average_latency_ms: average,
            max_latency_ms: c.latency_max.as_secs_f64() * 1000.0,
            last_routed_at: c.last_routed_at,
            ..RoutingStatistics::default()
        }
    }

    pub async fn reset(&self) {
        *self.inner.lock().await = Counters::default();
    }
}
