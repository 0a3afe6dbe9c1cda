//! Topic channels: publish/subscribe independent of rule-based routing.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use jobhub_core::BaseMessage;

const CHANNEL_CAPACITY: usize = 256;

/// Per-channel statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatistics {
    pub channel: String,
    pub subscriber_count: usize,
    pub published: u64,
    /// Sum of subscribers reached over all publishes.
    pub received: u64,
    pub last_activity: DateTime<Utc>,
}

struct Channel {
    sender: broadcast::Sender<BaseMessage>,
    subscribers: HashSet<String>,
    published: u64,
    received: u64,
    last_activity: DateTime<Utc>,
}

impl Channel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            subscribers: HashSet::new(),
            published: 0,
            received: 0,
            last_activity: Utc::now(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ChannelRegistry {
    channels: RwLock<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub async fn subscribe(&self, channel: &str, subscriber_id: &str) -> broadcast::Receiver<BaseMessage> {
        let mut channels = self.channels.write().await;
        let entry = channels
            .entry(channel.to_string())
            .or_insert_with(Channel::new);
        entry.subscribers.insert(subscriber_id.to_string());
        entry.last_activity = Utc::now();
        entry.sender.subscribe()
    }

    /// Returns false if the subscriber was not on the channel. Channels with no
    /// subscribers left are removed.
    pub async fn unsubscribe(&self, channel: &str, subscriber_id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let Some(entry) = channels.get_mut(channel) else {
            return false;
        };
        let removed = entry.subscribers.remove(subscriber_id);
        entry.last_activity = Utc::now();
        if entry.subscribers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Publish to a channel; returns how many receivers got the message.
    pub async fn publish(&self, channel: &str, message: BaseMessage) -> usize {
        let mut channels = self.channels.write().await;
        let Some(entry) = channels.get_mut(channel) else {
            return 0;
        };
        let reached = entry.sender.send(message).unwrap_or(0);
        entry.published += 1;
        entry.received += reached as u64;
        entry.last_activity = Utc::now();
        reached
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn statistics(&self) -> Vec<ChannelStatistics> {
        let channels = self.channels.read().await;
        let mut stats: Vec<_> = channels
            .iter()
            .map(|(name, c)| ChannelStatistics {
                channel: name.clone(),
                subscriber_count: c.subscribers.len(),
                published: c.published,
                received: c.received,
                last_activity: c.last_activity,
            })
            .collect();
        stats.sort_by(|a, b| a.channel.cmp(&b.channel));
        stats
    }
}
