//! Lifecycle observers, invoked synchronously at each transition.

use std::sync::Arc;

use tokio::sync::RwLock;

use jobhub_core::BaseMessage;

use super::{DeadLetter, RoutingOutcome};

pub type MessageRoutedHook = Arc<dyn Fn(&BaseMessage, &RoutingOutcome) + Send + Sync>;
pub type RoutingErrorHook = Arc<dyn Fn(&DeadLetter) + Send + Sync>;
/// Called with `(channel, subscriber_id)`.
pub type ChannelHook = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    message_routed: RwLock<Vec<MessageRoutedHook>>,
    routing_error: RwLock<Vec<RoutingErrorHook>>,
    channel_subscribed: RwLock<Vec<ChannelHook>>,
    channel_unsubscribed: RwLock<Vec<ChannelHook>>,
}

impl Hooks {
    pub async fn add_message_routed(&self, hook: MessageRoutedHook) {
        self.message_routed.write().await.push(hook);
    }

    pub async fn add_routing_error(&self, hook: RoutingErrorHook) {
        self.routing_error.write().await.push(hook);
    }

    pub async fn add_channel_subscribed(&self, hook: ChannelHook) {
        self.channel_subscribed.write().await.push(hook);
    }

    pub async fn add_channel_unsubscribed(&self, hook: ChannelHook) {
        self.channel_unsubscribed.write().await.push(hook);
    }

    pub async fn message_routed(&self, message: &BaseMessage, outcome: &RoutingOutcome) {
        let hooks = self.message_routed.read().await.clone();
        for hook in hooks {
            hook(message, outcome);
        }
    }

    pub async fn routing_error(&self, entry: &DeadLetter) {
        let hooks = self.routing_error.read().await.clone();
        for hook in hooks {
            hook(entry);
        }
    }

    pub async fn channel_subscribed(&self, channel: &str, subscriber_id: &str) {
        let hooks = self.channel_subscribed.read().await.clone();
        for hook in hooks {
            hook(channel, subscriber_id);
        }
    }

    pub async fn channel_unsubscribed(&self, channel: &str, subscriber_id: &str) {
        let hooks = self.channel_unsubscribed.read().await.clone();
        for hook in hooks {
            hook(channel, subscriber_id);
        }
    }
}
