//! Lifecycle event fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use jobhub_core::JobEvent;

use crate::store::{timed, JobStore};

/// Appends lifecycle events to the store and broadcasts them in-process.
#[derive(Clone)]
pub struct EventPublisher {
    store: Arc<dyn JobStore>,
    sender: broadcast::Sender<JobEvent>,
    timeout: Duration,
}

impl EventPublisher {
    pub fn new(store: Arc<dyn JobStore>, capacity: usize, timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            sender,
            timeout,
        }
    }

    /// Subscribe to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Record and broadcast an event. Store failures are logged, not returned:
    /// the state change the event describes has already happened.
    pub async fn publish(&self, event: JobEvent) {
        if let Err(e) = timed(self.timeout, self.store.append_event(&event)).await {
            warn!(
                job_id = %event.job_id,
                event = event.event_type.as_str(),
                error = %e,
                "Failed to append job event"
            );
        }

        debug!(job_id = %event.job_id, event = event.event_type.as_str(), "Job event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}
