//! Dead-letter store for messages that could not be delivered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use jobhub_core::BaseMessage;

use crate::transport::{Target, TargetKind};

/// A message that failed delivery, with failure context.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub id: String,
    pub message: BaseMessage,
    /// Target kind the message was routed for.
    pub target_kind: Option<TargetKind>,
    /// The target that failed, when the failure was a delivery.
    pub target: Option<Target>,
    pub error: String,
    pub attempts: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message: BaseMessage,
        target_kind: Option<TargetKind>,
        target: Option<Target>,
        error: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            target_kind,
            target,
            error,
            attempts: 1,
            first_failed_at: now,
            last_failed_at: now,
        }
    }
}

#[derive(Default)]
pub(crate) struct DeadLetterQueue {
    entries: Mutex<HashMap<String, DeadLetter>>,
}

impl DeadLetterQueue {
    pub async fn insert(&self, entry: DeadLetter) {
        self.entries.lock().await.insert(entry.id.clone(), entry);
    }

    /// Oldest first.
    pub async fn list(&self) -> Vec<DeadLetter> {
        let mut entries: Vec<_> = self.entries.lock().await.values().cloned().collect();
        entries.sort_by(|a, b| a.first_failed_at.cmp(&b.first_failed_at).then(a.id.cmp(&b.id)));
        entries
    }

    /// Remove an entry so that only one caller can act on it.
    pub async fn claim(&self, id: &str) -> Option<DeadLetter> {
        self.entries.lock().await.remove(id)
    }

    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let count = entries.len();
        entries.clear();
        count
    }

    /// Drop entries whose last failure is older than `cutoff`.
    pub async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| e.last_failed_at >= cutoff);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
