//! Background loops run alongside the HTTP server.
//!
//! Every loop stops when the shared cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::hub::Hub;

/// Spawn the event forwarder and every periodic loop the config enables.
pub fn spawn_background(
    hub: Arc<Hub>,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = vec![tokio::spawn(hub.clone().forward_events(cancel.clone()))];

    let heartbeat_timeout = config.heartbeat_timeout();
    handles.push(spawn_periodic(
        "maintenance",
        config.maintenance_interval(),
        cancel.clone(),
        {
            let hub = hub.clone();
            move || {
                let hub = hub.clone();
                async move { maintenance_pass(&hub, heartbeat_timeout).await }
            }
        },
    ));

    handles.push(spawn_periodic(
        "dead-letter-cleanup",
        config.dead_letter_cleanup_interval(),
        cancel.clone(),
        {
            let hub = hub.clone();
            move || {
                let hub = hub.clone();
                async move {
                    hub.router.cleanup_dead_letters().await;
                }
            }
        },
    ));

    if config.router.enable_batching {
        let batch_size = config.router.batch_size;
        handles.push(spawn_periodic(
            "batch-drain",
            config.router.batch_timeout(),
            cancel.clone(),
            {
                let hub = hub.clone();
                move || {
                    let hub = hub.clone();
                    async move {
                        let processed = hub.router.process_batch(batch_size).await;
                        if processed > 0 {
                            debug!(processed, "Drained routing batch");
                        }
                    }
                }
            },
        ));
    }

    if config.router.enable_metrics {
        handles.push(spawn_periodic(
            "metrics-report",
            config.router.metrics_interval(),
            cancel,
            move || {
                let hub = hub.clone();
                async move { hub.router.log_statistics().await }
            },
        ));
    }

    handles
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => tick().await,
            }
        }
        info!(task = name, "Background task stopped");
    })
}

/// Reap silent workers, recover orphaned jobs, then offer freed work to the
/// workers still connected.
pub async fn maintenance_pass(hub: &Hub, heartbeat_timeout: Duration) {
    match hub.broker.reap_stale_workers(heartbeat_timeout).await {
        Ok(reaped) if !reaped.is_empty() => info!(count = reaped.len(), "Reaped stale workers"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Worker reaper failed"),
    }

    match hub.broker.requeue_orphaned_jobs().await {
        Ok(requeued) if !requeued.is_empty() => {
            info!(count = requeued.len(), "Re-queued orphaned jobs")
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Orphan recovery failed"),
    }

    if let Err(e) = hub.dispatch_pending().await {
        warn!(error = %e, "Dispatch after maintenance failed");
    }

    let pruned = hub.connections.prune_closed().await;
    if pruned > 0 {
        debug!(pruned, "Pruned closed connections");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use jobhub_broker::{BrokerConfig, JobBroker, MemoryStore};
    use jobhub_core::{JobStatus, JobSubmission, WorkerCapabilities, WorkerId, WorkerStatus};
    use jobhub_router::{RouterConfig, Target};
    use serde_json::json;

    async fn hub() -> Arc<Hub> {
        let broker = Arc::new(JobBroker::new(
            Arc::new(MemoryStore::new()),
            BrokerConfig::default(),
        ));
        Hub::new(broker, RouterConfig::default(), 8).await.unwrap()
    }

    #[tokio::test]
    async fn test_maintenance_reaps_and_requeues() {
        let hub = hub().await;
        let worker_id = WorkerId::new("w1");
        hub.broker
            .register_worker(WorkerCapabilities::new(worker_id.clone()))
            .await
            .unwrap();
        let job = hub
            .broker
            .submit_job(JobSubmission::new(json!({})))
            .await
            .unwrap();
        hub.broker
            .claim_job(&job.id, &worker_id)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        maintenance_pass(&hub, Duration::ZERO).await;

        let worker = hub.broker.get_worker(&worker_id).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Offline);
        let job = hub.broker.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(hub.broker.get_queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_prunes_closed_connections() {
        let hub = hub().await;
        let receiver = hub.connections.connect(Target::client("c1")).await;
        drop(receiver);

        maintenance_pass(&hub, Duration::from_secs(60)).await;
        assert!(!hub.connections.is_connected(&Target::client("c1")).await);
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_cancel() {
        let hub = hub().await;
        let mut config = ServerConfig::default();
        config.maintenance_interval_secs = 1;
        config.router.enable_batching = true;
        config.router.enable_metrics = true;

        let cancel = CancellationToken::new();
        let handles = spawn_background(hub, &config, cancel.clone());
        assert_eq!(handles.len(), 5);

        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("task stops after cancel")
                .unwrap();
        }
    }
}
