//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use jobhub_router::TargetKind;
use tracing::warn;

use crate::hub::Hub;

/// Collect all metrics from the hub and format as Prometheus text.
pub async fn collect_metrics(hub: &Hub) -> String {
    let mut output = String::new();

    collect_job_metrics(hub, &mut output).await;
    collect_worker_metrics(hub, &mut output).await;
    collect_routing_metrics(hub, &mut output).await;
    collect_message_metrics(hub, &mut output).await;
    collect_connection_metrics(hub, &mut output).await;

    output
}

/// Collect job metrics by status, plus the queue depth.
async fn collect_job_metrics(hub: &Hub, output: &mut String) {
    let stats = match hub.broker.job_statistics().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "Skipping job metrics");
            return;
        }
    };

    writeln!(output, "# HELP jobhub_jobs Number of jobs by status").ok();
    writeln!(output, "# TYPE jobhub_jobs gauge").ok();
    for (status, count) in [
        ("pending", stats.pending),
        ("assigned", stats.assigned),
        ("active", stats.active),
        ("completed", stats.completed),
        ("failed", stats.failed),
        ("cancelled", stats.cancelled),
    ] {
        writeln!(output, "jobhub_jobs{{status=\"{status}\"}} {count}").ok();
    }

    writeln!(output, "# HELP jobhub_queue_depth Jobs waiting in the priority queue").ok();
    writeln!(output, "# TYPE jobhub_queue_depth gauge").ok();
    writeln!(output, "jobhub_queue_depth {}", stats.queue_depth).ok();
}

/// Collect worker metrics by status.
async fn collect_worker_metrics(hub: &Hub, output: &mut String) {
    let stats = match hub.broker.worker_statistics().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "Skipping worker metrics");
            return;
        }
    };

    writeln!(output, "# HELP jobhub_workers Number of registered workers by status").ok();
    writeln!(output, "# TYPE jobhub_workers gauge").ok();
    writeln!(output, "jobhub_workers{{status=\"idle\"}} {}", stats.idle).ok();
    writeln!(output, "jobhub_workers{{status=\"busy\"}} {}", stats.busy).ok();
    writeln!(output, "jobhub_workers{{status=\"draining\"}} {}", stats.draining).ok();
    writeln!(output, "jobhub_workers{{status=\"offline\"}} {}", stats.offline).ok();
}

async fn collect_routing_metrics(hub: &Hub, output: &mut String) {
    let stats = hub.router.statistics().await;

    writeln!(output, "# HELP jobhub_routing_messages_total Messages by routing outcome").ok();
    writeln!(output, "# TYPE jobhub_routing_messages_total counter").ok();
    for (outcome, count) in [
        ("routed", stats.routed),
        ("failed", stats.failed),
        ("queued", stats.queued),
        ("dead_lettered", stats.dead_lettered),
        ("dropped", stats.dropped),
    ] {
        writeln!(
            output,
            "jobhub_routing_messages_total{{outcome=\"{outcome}\"}} {count}"
        )
        .ok();
    }

    writeln!(output, "# HELP jobhub_routing_deliveries_total Successful per-target deliveries").ok();
    writeln!(output, "# TYPE jobhub_routing_deliveries_total counter").ok();
    writeln!(output, "jobhub_routing_deliveries_total {}", stats.deliveries).ok();

    writeln!(output, "# HELP jobhub_routing_latency_ms Delivery latency in milliseconds").ok();
    writeln!(output, "# TYPE jobhub_routing_latency_ms gauge").ok();
    writeln!(
        output,
        "jobhub_routing_latency_ms{{stat=\"average\"}} {:.3}",
        stats.average_latency_ms
    )
    .ok();
    writeln!(
        output,
        "jobhub_routing_latency_ms{{stat=\"max\"}} {:.3}",
        stats.max_latency_ms
    )
    .ok();

    writeln!(output, "# HELP jobhub_routing_queue_depth Messages waiting in the batching queue").ok();
    writeln!(output, "# TYPE jobhub_routing_queue_depth gauge").ok();
    writeln!(output, "jobhub_routing_queue_depth {}", stats.queue_depth).ok();

    writeln!(output, "# HELP jobhub_dead_letters Messages held in the dead-letter store").ok();
    writeln!(output, "# TYPE jobhub_dead_letters gauge").ok();
    writeln!(output, "jobhub_dead_letters {}", stats.dead_letter_count).ok();
}

async fn collect_message_metrics(hub: &Hub, output: &mut String) {
    let stats = hub.handler.statistics().await;

    writeln!(output, "# HELP jobhub_inbound_messages_total Inbound wire messages handled").ok();
    writeln!(output, "# TYPE jobhub_inbound_messages_total counter").ok();
    writeln!(
        output,
        "jobhub_inbound_messages_total{{result=\"processed\"}} {}",
        stats.processed
    )
    .ok();
    writeln!(
        output,
        "jobhub_inbound_messages_total{{result=\"failed\"}} {}",
        stats.failed
    )
    .ok();
}

async fn collect_connection_metrics(hub: &Hub, output: &mut String) {
    let counts = hub.connections.counts().await;

    writeln!(output, "# HELP jobhub_connections Open push connections by kind").ok();
    writeln!(output, "# TYPE jobhub_connections gauge").ok();
    for kind in [TargetKind::Worker, TargetKind::Client, TargetKind::Monitor] {
        let count = counts.get(&kind).copied().unwrap_or(0);
        writeln!(output, "jobhub_connections{{kind=\"{kind}\"}} {count}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use jobhub_broker::{BrokerConfig, JobBroker, MemoryStore};
    use jobhub_core::JobSubmission;
    use jobhub_router::{RouterConfig, Target};
    use serde_json::json;

    #[tokio::test]
    async fn test_collect_metrics() {
        let broker = Arc::new(JobBroker::new(
            Arc::new(MemoryStore::new()),
            BrokerConfig::default(),
        ));
        let hub = Hub::new(broker, RouterConfig::default(), 8).await.unwrap();

        hub.broker
            .submit_job(JobSubmission::new(json!({"service": "image"})))
            .await
            .unwrap();
        let _worker = hub.connections.connect(Target::worker("w1")).await;
        let _monitor = hub.connections.connect(Target::monitor("m1")).await;

        let text = collect_metrics(&hub).await;
        assert!(text.contains("# TYPE jobhub_jobs gauge"));
        assert!(text.contains("jobhub_jobs{status=\"pending\"} 1"));
        assert!(text.contains("jobhub_queue_depth 1"));
        assert!(text.contains("jobhub_workers{status=\"idle\"} 0"));
        assert!(text.contains("jobhub_routing_messages_total{outcome=\"routed\"} 0"));
        assert!(text.contains("jobhub_inbound_messages_total{result=\"failed\"} 0"));
        assert!(text.contains("jobhub_connections{kind=\"worker\"} 1"));
        assert!(text.contains("jobhub_connections{kind=\"monitor\"} 1"));
        assert!(text.contains("jobhub_connections{kind=\"client\"} 0"));
    }
}
