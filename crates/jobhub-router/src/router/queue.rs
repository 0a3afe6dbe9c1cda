//! Bounded priority queue for outbound messages.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use jobhub_core::BaseMessage;

use crate::config::QueueOverflowPolicy;
use crate::transport::TargetKind;
use crate::RoutingError;

/// A queued message awaiting delivery.
#[derive(Debug, Clone)]
pub(crate) struct QueuedMessage {
    pub message: BaseMessage,
    pub target: Option<TargetKind>,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
}

type Key = (Reverse<i32>, u64);

#[derive(Default)]
struct Inner {
    items: BTreeMap<Key, QueuedMessage>,
    next_seq: u64,
    evicted: u64,
}

/// Highest priority first, FIFO within a priority. Items are removed from the
/// queue before they are acted on, so concurrent drains never share one.
pub(crate) struct MessageQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    overflow: QueueOverflowPolicy,
}

impl MessageQueue {
    pub fn new(capacity: usize, overflow: QueueOverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            overflow,
        }
    }

    /// Admit a message. When full, either the lowest-priority message is
    /// evicted or the admission fails, per the overflow policy.
    pub async fn push(&self, item: QueuedMessage) -> Result<(), RoutingError> {
        let mut inner = self.inner.lock().await;

        if inner.items.len() >= self.capacity {
            match self.overflow {
                QueueOverflowPolicy::Reject => return Err(RoutingError::QueueFull(self.capacity)),
                QueueOverflowPolicy::DropLowest => {
                    let lowest = inner.items.keys().next_back().copied();
                    match lowest {
                        Some(key) if key.0 .0 < item.priority => {
                            inner.items.remove(&key);
                            inner.evicted += 1;
                        }
                        _ => {
                            inner.evicted += 1;
                            return Err(RoutingError::QueueFull(self.capacity));
                        }
                    }
                }
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.insert((Reverse(item.priority), seq), item);
        Ok(())
    }

    /// Claim up to `n` messages, best first.
    pub async fn take(&self, n: usize) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock().await;
        let mut taken = Vec::with_capacity(n.min(inner.items.len()));
        while taken.len() < n {
            match inner.items.pop_first() {
                Some((_, item)) => taken.push(item),
                None => break,
            }
        }
        taken
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }

    /// Messages dropped because the queue was full.
    pub async fn evicted(&self) -> u64 {
        self.inner.lock().await.evicted
    }
}
