//! Priority queue over the store's pending index.

use std::sync::Arc;
use std::time::Duration;

use jobhub_core::{JobId, QueueScore};

use crate::store::{timed, JobStore};
use crate::BrokerError;

/// Ordered view of pending jobs: higher priority first, then earlier
/// submission first.
#[derive(Clone)]
pub struct PriorityQueue {
    store: Arc<dyn JobStore>,
    timeout: Duration,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn JobStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn enqueue(&self, id: &JobId, score: QueueScore) -> Result<(), BrokerError> {
        timed(self.timeout, self.store.enqueue(id, score)).await
    }

    /// The best `n` pending ids.
    pub async fn top_n(&self, n: usize) -> Result<Vec<JobId>, BrokerError> {
        timed(self.timeout, self.store.top_pending(n)).await
    }

    /// Try to take a job out of the queue. Returns true only for the single
    /// caller that removed it.
    pub async fn remove(&self, id: &JobId) -> Result<bool, BrokerError> {
        timed(self.timeout, self.store.remove_pending(id)).await
    }

    /// One-based position of a pending job, or `None` if it is not pending.
    pub async fn position(&self, id: &JobId) -> Result<Option<usize>, BrokerError> {
        let rank = timed(self.timeout, self.store.pending_rank(id)).await?;
        Ok(rank.map(|r| r + 1))
    }

    pub async fn depth(&self) -> Result<usize, BrokerError> {
        timed(self.timeout, self.store.pending_count()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[tokio::test]
    async fn test_position_is_one_based() {
        let queue = PriorityQueue::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));
        queue.enqueue(&JobId::new("a"), QueueScore::new(1, 10, 0)).await.unwrap();
        queue.enqueue(&JobId::new("b"), QueueScore::new(1, 20, 1)).await.unwrap();

        assert_eq!(queue.position(&JobId::new("a")).await.unwrap(), Some(1));
        assert_eq!(queue.position(&JobId::new("b")).await.unwrap(), Some(2));
        assert_eq!(queue.depth().await.unwrap(), 2);

        assert!(queue.remove(&JobId::new("a")).await.unwrap());
        assert_eq!(queue.position(&JobId::new("b")).await.unwrap(), Some(1));
        assert_eq!(queue.position(&JobId::new("a")).await.unwrap(), None);
    }
}
