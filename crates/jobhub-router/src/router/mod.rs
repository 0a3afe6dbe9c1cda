//! Outbound message routing.
//!
//! Every message goes `received -> filtered -> transformed -> ruled` and ends
//! up delivered, queued or dead-lettered (or dropped by a filter). Delivery
//! itself is delegated to a [`DeliveryTransport`].

mod channels;
mod dead_letter;
mod filter;
mod hooks;
mod queue;
mod rules;
mod stats;
mod transform;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use jobhub_core::{lookup_path, BaseMessage};

pub use self::channels::ChannelStatistics;
pub use self::dead_letter::DeadLetter;
pub use self::filter::{FilterDecision, FnFilter, MessageFilter};
pub use self::hooks::{ChannelHook, MessageRoutedHook, RoutingErrorHook};
pub use self::rules::{ConditionOperator, RouteTarget, RoutingRule, RuleAction, RuleCondition};
pub use self::stats::RoutingStatistics;
pub use self::transform::{FnTransformer, MessageTransformer};

use self::channels::ChannelRegistry;
use self::dead_letter::DeadLetterQueue;
use self::hooks::Hooks;
use self::queue::{MessageQueue, QueuedMessage};
use self::rules::CompiledRule;
use self::stats::RoutingCounters;
use crate::config::RouterConfig;
use crate::transport::{DeliveryTransport, Target, TargetKind};
use crate::RoutingError;

/// Final state of one routed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingOutcome {
    /// Delivered to this many targets.
    Delivered(usize),
    /// Denied by a filter.
    Dropped,
    /// Admitted to the batching queue.
    Queued,
    /// Every delivery failed; see the dead-letter queue.
    DeadLettered,
}

struct Registered<T: ?Sized> {
    inner: Arc<T>,
    enabled: bool,
}

impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            enabled: self.enabled,
        }
    }
}

/// Result of rule evaluation for one message.
struct RulePlan {
    message: BaseMessage,
    routes: Vec<RouteTarget>,
}

/// Routes outbound messages to workers, clients and monitors.
pub struct MessageRouter {
    config: RouterConfig,
    transport: Arc<dyn DeliveryTransport>,
    filters: RwLock<Vec<Registered<dyn MessageFilter>>>,
    transformers: RwLock<Vec<Registered<dyn MessageTransformer>>>,
    rules: RwLock<Vec<CompiledRule>>,
    queue: MessageQueue,
    dead_letters: DeadLetterQueue,
    channels: ChannelRegistry,
    counters: RoutingCounters,
    hooks: Hooks,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, transport: Arc<dyn DeliveryTransport>) -> Self {
        let queue = MessageQueue::new(config.max_queue_size, config.queue_overflow);
        Self {
            config,
            transport,
            filters: RwLock::new(Vec::new()),
            transformers: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            queue,
            dead_letters: DeadLetterQueue::default(),
            channels: ChannelRegistry::default(),
            counters: RoutingCounters::default(),
            hooks: Hooks::default(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Add a filter, replacing any filter with the same name.
    pub async fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        let mut filters = self.filters.write().await;
        filters.retain(|f| f.inner.name() != filter.name());
        filters.push(Registered {
            inner: filter,
            enabled: true,
        });
        filters.sort_by_key(|f| std::cmp::Reverse(f.inner.priority()));
    }

    pub async fn remove_filter(&self, name: &str) -> bool {
        let mut filters = self.filters.write().await;
        let before = filters.len();
        filters.retain(|f| f.inner.name() != name);
        filters.len() != before
    }

    pub async fn set_filter_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut filters = self.filters.write().await;
        match filters.iter_mut().find(|f| f.inner.name() == name) {
            Some(f) => {
                f.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Add a transformer, replacing any transformer with the same name.
    pub async fn add_transformer(&self, transformer: Arc<dyn MessageTransformer>) {
        let mut transformers = self.transformers.write().await;
        transformers.retain(|t| t.inner.name() != transformer.name());
        transformers.push(Registered {
            inner: transformer,
            enabled: true,
        });
        transformers.sort_by_key(|t| std::cmp::Reverse(t.inner.priority()));
    }

    pub async fn remove_transformer(&self, name: &str) -> bool {
        let mut transformers = self.transformers.write().await;
        let before = transformers.len();
        transformers.retain(|t| t.inner.name() != name);
        transformers.len() != before
    }

    pub async fn set_transformer_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut transformers = self.transformers.write().await;
        match transformers.iter_mut().find(|t| t.inner.name() == name) {
            Some(t) => {
                t.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Add a rule, replacing any rule with the same id. Fails if a regex
    /// condition does not compile.
    pub async fn add_rule(&self, rule: RoutingRule) -> Result<(), RoutingError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.rules.write().await;
        rules.retain(|r| r.rule.id != compiled.rule.id);
        debug!(rule_id = %compiled.rule.id, name = %compiled.rule.name, "Routing rule added");
        rules.push(compiled);
        rules.sort_by_key(|r| std::cmp::Reverse(r.rule.priority));
        Ok(())
    }

    pub async fn remove_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().await;
        let before = rules.len();
        rules.retain(|r| r.rule.id != id);
        rules.len() != before
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.rule.id == id) {
            Some(r) => {
                r.rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Rules in evaluation order.
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.iter().map(|r| r.rule.clone()).collect()
    }

    // ========================================================================
    // Routing pipeline
    // ========================================================================

    /// Route a message through the full pipeline. `target` is the kind of
    /// recipient the producer intends, matched against rule target kinds.
    pub async fn route_message(
        &self,
        message: BaseMessage,
        target: Option<TargetKind>,
    ) -> RoutingOutcome {
        let started = Instant::now();

        let Some(message) = self.apply_filters(message).await else {
            self.counters.record_dropped().await;
            return RoutingOutcome::Dropped;
        };
        let message = self.apply_transformers(message).await;

        if self.config.enable_batching {
            return match self.queue_message(message.clone(), None, target).await {
                Ok(()) => RoutingOutcome::Queued,
                Err(e) => {
                    self.handle_routing_error(message, target, None, &e).await;
                    RoutingOutcome::DeadLettered
                }
            };
        }

        self.rule_and_deliver(message, target, started).await
    }

    async fn apply_filters(&self, mut message: BaseMessage) -> Option<BaseMessage> {
        let filters = self.filters.read().await.clone();
        for filter in filters.iter().filter(|f| f.enabled) {
            match filter.inner.apply(&message) {
                FilterDecision::Allow => {}
                FilterDecision::Deny(reason) => {
                    debug!(
                        filter = filter.inner.name(),
                        message_type = %message.message_type,
                        reason = %reason,
                        "Message denied"
                    );
                    return None;
                }
                FilterDecision::Modify(replacement) => message = replacement,
            }
        }
        Some(message)
    }

    async fn apply_transformers(&self, mut message: BaseMessage) -> BaseMessage {
        let transformers = self.transformers.read().await.clone();
        for transformer in transformers.iter().filter(|t| t.enabled) {
            if let Some(replacement) = transformer.inner.transform(&message) {
                message = replacement;
            }
        }
        message
    }

    /// Evaluate rules in priority order. Transform, filter, log and alert
    /// actions of every matching rule apply; route actions come only from the
    /// first matching rule that has any. `None` means a filter action denied
    /// the message. With no route action, the message goes to all monitors.
    async fn apply_rules(
        &self,
        mut message: BaseMessage,
        target: Option<TargetKind>,
    ) -> Option<RulePlan> {
        let rules = self.rules.read().await.clone();
        let mut routes = Vec::new();

        for compiled in &rules {
            if !compiled.matches(&message, target) {
                continue;
            }
            let rule = &compiled.rule;
            let routes_taken = !routes.is_empty();
            for action in &rule.actions {
                match action {
                    RuleAction::Route(route) => {
                        if !routes_taken {
                            routes.push(route.clone());
                        }
                    }
                    RuleAction::Transform { transformer } => {
                        if let Some(replacement) = self.run_transformer(transformer, &message).await {
                            message = replacement;
                        }
                    }
                    RuleAction::Filter { filter } => {
                        match self.run_filter(filter, &message).await {
                            FilterDecision::Allow => {}
                            FilterDecision::Deny(reason) => {
                                debug!(rule_id = %rule.id, reason = %reason, "Message denied by rule");
                                return None;
                            }
                            FilterDecision::Modify(replacement) => message = replacement,
                        }
                    }
                    RuleAction::Log { message: note } => {
                        info!(
                            target: "jobhub::routing",
                            rule_id = %rule.id,
                            message_type = %message.message_type,
                            source_kind = %message.source_kind,
                            note = note.as_deref().unwrap_or(""),
                            "Rule matched"
                        );
                    }
                    RuleAction::Alert { message: alert } => {
                        warn!(
                            target: "jobhub::alert",
                            rule_id = %rule.id,
                            message_type = %message.message_type,
                            "{}",
                            alert
                        );
                    }
                }
            }
        }

        if routes.is_empty() {
            routes.push(RouteTarget::all(TargetKind::Monitor));
        }
        Some(RulePlan { message, routes })
    }

    async fn run_transformer(&self, name: &str, message: &BaseMessage) -> Option<BaseMessage> {
        let transformer = self
            .transformers
            .read()
            .await
            .iter()
            .find(|t| t.inner.name() == name)
            .map(|t| t.inner.clone());
        match transformer {
            Some(t) => t.transform(message),
            None => {
                warn!(transformer = name, "Rule references unknown transformer");
                None
            }
        }
    }

    async fn run_filter(&self, name: &str, message: &BaseMessage) -> FilterDecision {
        let filter = self
            .filters
            .read()
            .await
            .iter()
            .find(|f| f.inner.name() == name)
            .map(|f| f.inner.clone());
        match filter {
            Some(f) => f.apply(message),
            None => {
                warn!(filter = name, "Rule references unknown filter");
                FilterDecision::Allow
            }
        }
    }

    /// Resolve route actions into concrete, de-duplicated targets.
    async fn resolve_targets(&self, message: &BaseMessage, routes: &[RouteTarget]) -> Vec<Target> {
        let mut targets = BTreeSet::new();
        for route in routes {
            if let Some(path) = &route.id_field {
                let Ok(doc) = serde_json::to_value(message) else {
                    continue;
                };
                match lookup_path(&doc, path).and_then(|v| v.as_str()) {
                    Some(id) => {
                        targets.insert(Target::new(route.kind, id));
                    }
                    None => debug!(path = %path, "Route id field missing from message"),
                }
                continue;
            }
            let ids = match &route.ids {
                Some(ids) => ids.clone(),
                None => self.transport.connected(route.kind).await,
            };
            targets.extend(ids.into_iter().map(|id| Target::new(route.kind, id)));
        }
        targets.into_iter().collect()
    }

    async fn deliver_one(&self, target: &Target, message: &BaseMessage) -> Result<(), RoutingError> {
        let timeout = self.config.routing_timeout();
        match tokio::time::timeout(timeout, self.transport.deliver(target, message)).await {
            Ok(result) => result,
            Err(_) => Err(RoutingError::Timeout {
                target: target.clone(),
                timeout,
            }),
        }
    }

    async fn deliver_all(
        &self,
        message: &BaseMessage,
        targets: &[Target],
    ) -> (usize, Vec<(Target, RoutingError)>) {
        let mut delivered = 0;
        let mut failures = Vec::new();
        for target in targets {
            match self.deliver_one(target, message).await {
                Ok(()) => delivered += 1,
                Err(e) => failures.push((target.clone(), e)),
            }
        }
        (delivered, failures)
    }

    async fn rule_and_deliver(
        &self,
        message: BaseMessage,
        target: Option<TargetKind>,
        started: Instant,
    ) -> RoutingOutcome {
        let Some(plan) = self.apply_rules(message, target).await else {
            self.counters.record_dropped().await;
            return RoutingOutcome::Dropped;
        };
        let targets = self.resolve_targets(&plan.message, &plan.routes).await;
        let (delivered, failures) = self.deliver_all(&plan.message, &targets).await;

        let outcome = if delivered == 0 && !failures.is_empty() {
            RoutingOutcome::DeadLettered
        } else {
            self.counters.record_delivered(delivered, started.elapsed()).await;
            RoutingOutcome::Delivered(delivered)
        };

        self.counters.record_failed(failures.len()).await;
        for (failed, error) in failures {
            self.handle_routing_error(plan.message.clone(), target, Some(failed), &error)
                .await;
        }

        self.hooks.message_routed(&plan.message, &outcome).await;
        outcome
    }

    /// Move a message that could not be delivered to the dead-letter queue.
    pub async fn handle_routing_error(
        &self,
        message: BaseMessage,
        target_kind: Option<TargetKind>,
        target: Option<Target>,
        error: &RoutingError,
    ) -> DeadLetter {
        warn!(
            message_type = %message.message_type,
            to = target.as_ref().map(|t| t.to_string()).unwrap_or_default(),
            error = %error,
            "Routing failed, dead-lettering message"
        );
        let entry = DeadLetter::new(message, target_kind, target, error.to_string());
        self.dead_letters.insert(entry.clone()).await;
        self.counters.record_dead_lettered().await;
        self.hooks.routing_error(&entry).await;
        entry
    }

    // ========================================================================
    // Delivery primitives
    // ========================================================================

    /// Broadcast to workers, optionally only the given ids. Returns the number
    /// of successful deliveries.
    pub async fn route_to_workers(&self, message: &BaseMessage, ids: Option<&[String]>) -> usize {
        self.route_to_kind(TargetKind::Worker, message, ids).await
    }

    pub async fn route_to_clients(&self, message: &BaseMessage, ids: Option<&[String]>) -> usize {
        self.route_to_kind(TargetKind::Client, message, ids).await
    }

    pub async fn route_to_monitors(&self, message: &BaseMessage, ids: Option<&[String]>) -> usize {
        self.route_to_kind(TargetKind::Monitor, message, ids).await
    }

    async fn route_to_kind(
        &self,
        kind: TargetKind,
        message: &BaseMessage,
        ids: Option<&[String]>,
    ) -> usize {
        let started = Instant::now();
        let route = RouteTarget {
            kind,
            ids: ids.map(<[String]>::to_vec),
            id_field: None,
        };
        let targets = self.resolve_targets(message, &[route]).await;
        let (delivered, failures) = self.deliver_all(message, &targets).await;

        self.counters.record_delivered(delivered, started.elapsed()).await;
        self.counters.record_failed(failures.len()).await;
        for (failed, error) in failures {
            self.handle_routing_error(message.clone(), Some(kind), Some(failed), &error)
                .await;
        }
        delivered
    }

    /// Deliver to exactly one target. A failure is dead-lettered.
    pub async fn route_to_specific_target(&self, target: &Target, message: &BaseMessage) -> bool {
        let started = Instant::now();
        match self.deliver_one(target, message).await {
            Ok(()) => {
                self.counters.record_delivered(1, started.elapsed()).await;
                true
            }
            Err(e) => {
                self.counters.record_failed(1).await;
                self.handle_routing_error(message.clone(), Some(target.kind), Some(target.clone()), &e)
                    .await;
                false
            }
        }
    }

    // ========================================================================
    // Channels
    // ========================================================================

    /// Publish on a topic channel; returns the number of subscribers reached.
    pub async fn publish_message(&self, channel: &str, message: BaseMessage) -> usize {
        self.channels.publish(channel, message).await
    }

    pub async fn subscribe_to_channel(
        &self,
        channel: &str,
        subscriber_id: &str,
    ) -> broadcast::Receiver<BaseMessage> {
        let receiver = self.channels.subscribe(channel, subscriber_id).await;
        debug!(channel, subscriber_id, "Channel subscribed");
        self.hooks.channel_subscribed(channel, subscriber_id).await;
        receiver
    }

    pub async fn unsubscribe_from_channel(&self, channel: &str, subscriber_id: &str) -> bool {
        let removed = self.channels.unsubscribe(channel, subscriber_id).await;
        if removed {
            debug!(channel, subscriber_id, "Channel unsubscribed");
            self.hooks.channel_unsubscribed(channel, subscriber_id).await;
        }
        removed
    }

    pub async fn channel_statistics(&self) -> Vec<ChannelStatistics> {
        self.channels.statistics().await
    }

    // ========================================================================
    // Queueing
    // ========================================================================

    /// Admit a message to the bounded queue for later delivery.
    pub async fn queue_message(
        &self,
        message: BaseMessage,
        priority: Option<i32>,
        target: Option<TargetKind>,
    ) -> Result<(), RoutingError> {
        let item = QueuedMessage {
            message,
            target,
            priority: priority.unwrap_or(0),
            queued_at: Utc::now(),
        };
        match self.queue.push(item).await {
            Ok(()) => {
                self.counters.record_queued().await;
                Ok(())
            }
            Err(e) => {
                self.counters.record_dropped().await;
                Err(e)
            }
        }
    }

    /// Drain everything currently queued. Returns how many messages were
    /// delivered; failures go to the dead-letter queue.
    pub async fn process_message_queue(&self) -> usize {
        let pending = self.queue.len().await;
        self.process_batch(pending).await
    }

    /// Drain up to `n` queued messages.
    pub async fn process_batch(&self, n: usize) -> usize {
        let mut processed = 0;
        for item in self.queue.take(n).await {
            let wait_ms = (Utc::now() - item.queued_at).num_milliseconds();
            debug!(message_type = %item.message.message_type, wait_ms, "Delivering queued message");
            let outcome = self
                .rule_and_deliver(item.message, item.target, Instant::now())
                .await;
            if matches!(outcome, RoutingOutcome::Delivered(_)) {
                processed += 1;
            }
        }
        processed
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.len().await
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Dead letters, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list().await
    }

    /// Send a dead letter back through the ruling stage. An entry that
    /// recorded the connection it failed on is retried on that connection
    /// only; otherwise the rules pick the targets again.
    ///
    /// The entry is claimed before delivery, so concurrent reprocessing of the
    /// same id acts once. Returns `Ok(true)` when it was delivered and is gone,
    /// `Ok(false)` when delivery failed again. Each target that failed is then
    /// held in its own entry, the first under the original id, so targets
    /// that did receive the message are not sent it again.
    pub async fn reprocess_dead_letter(&self, id: &str) -> Result<bool, RoutingError> {
        let Some(mut entry) = self.dead_letters.claim(id).await else {
            return Err(RoutingError::DeadLetterNotFound(id.to_string()));
        };

        let Some(plan) = self.apply_rules(entry.message.clone(), entry.target_kind).await else {
            info!(dead_letter_id = %id, "Dead letter now denied by rules, discarding");
            return Ok(true);
        };

        let targets = match &entry.target {
            Some(original) => vec![original.clone()],
            None => self.resolve_targets(&plan.message, &plan.routes).await,
        };

        let started = Instant::now();
        let (delivered, failures) = self.deliver_all(&plan.message, &targets).await;
        if delivered > 0 {
            self.counters.record_delivered(delivered, started.elapsed()).await;
        }
        if failures.is_empty() {
            info!(dead_letter_id = %id, delivered, "Dead letter reprocessed");
            return Ok(true);
        }

        self.counters.record_failed(failures.len()).await;
        entry.attempts += 1;
        entry.last_failed_at = Utc::now();
        let mut failures = failures.into_iter();
        if let Some((target, error)) = failures.next() {
            warn!(
                dead_letter_id = %id,
                attempts = entry.attempts,
                to = %target,
                error = %error,
                "Dead letter reprocessing failed"
            );
            entry.target = Some(target);
            entry.error = error.to_string();
        }
        for (target, error) in failures {
            let mut split = entry.clone();
            split.id = uuid::Uuid::new_v4().to_string();
            split.target = Some(target);
            split.error = error.to_string();
            self.dead_letters.insert(split).await;
        }
        self.dead_letters.insert(entry).await;
        Ok(false)
    }

    pub async fn clear_dead_letters(&self) -> usize {
        let cleared = self.dead_letters.clear().await;
        info!(cleared, "Dead letters cleared");
        cleared
    }

    /// Remove dead letters older than the retention window.
    pub async fn cleanup_dead_letters(&self) -> usize {
        let cutoff = Utc::now() - self.config.dead_letter_retention();
        let removed = self.dead_letters.remove_older_than(cutoff).await;
        if removed > 0 {
            info!(removed, "Expired dead letters removed");
        }
        removed
    }

    // ========================================================================
    // Statistics and hooks
    // ========================================================================

    pub async fn statistics(&self) -> RoutingStatistics {
        let mut stats = self.counters.snapshot().await;
        stats.active_routes = self
            .rules
            .read()
            .await
            .iter()
            .filter(|r| r.rule.enabled)
            .count();
        stats.subscribed_channels = self.channels.count().await;
        stats.queue_depth = self.queue.len().await;
        stats.dead_letter_count = self.dead_letters.len().await;
        stats
    }

    pub async fn reset_statistics(&self) {
        self.counters.reset().await;
    }

    /// Emit a statistics summary to the log.
    pub async fn log_statistics(&self) {
        let stats = self.statistics().await;
        info!(
            routed = stats.routed,
            failed = stats.failed,
            queued = stats.queued,
            dead_lettered = stats.dead_lettered,
            dropped = stats.dropped,
            queue_depth = stats.queue_depth,
            dead_letters = stats.dead_letter_count,
            avg_latency_ms = stats.average_latency_ms,
            "Routing statistics"
        );
    }

    pub async fn on_message_routed(&self, hook: MessageRoutedHook) {
        self.hooks.add_message_routed(hook).await;
    }

    pub async fn on_routing_error(&self, hook: RoutingErrorHook) {
        self.hooks.add_routing_error(hook).await;
    }

    pub async fn on_channel_subscribed(&self, hook: ChannelHook) {
        self.hooks.add_channel_subscribed(hook).await;
    }

    pub async fn on_channel_unsubscribed(&self, hook: ChannelHook) {
        self.hooks.add_channel_unsubscribed(hook).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use jobhub_core::{MessageType, SourceKind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn setup(config: RouterConfig) -> (Arc<RecordingTransport>, MessageRouter) {
        let transport = Arc::new(RecordingTransport::new());
        let router = MessageRouter::new(config, transport.clone());
        (transport, router)
    }

    fn assigned(worker_id: &str) -> BaseMessage {
        BaseMessage::new(
            MessageType::JobAssigned,
            json!({"job_id": "j1", "worker_id": worker_id}),
            SourceKind::Hub,
        )
    }

    fn to_named_worker() -> RoutingRule {
        RoutingRule::new("assign", "assignments to their worker")
            .for_types(&[MessageType::JobAssigned])
            .with_action(RuleAction::Route(RouteTarget::from_field(
                TargetKind::Worker,
                "payload.worker_id",
            )))
    }

    #[tokio::test]
    async fn test_unrouted_message_goes_to_monitors() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::monitor("m1"));
        transport.connect(Target::monitor("m2"));
        transport.connect(Target::worker("w1"));

        let outcome = router.route_message(assigned("w1"), None).await;
        assert_eq!(outcome, RoutingOutcome::Delivered(2));
        assert_eq!(transport.delivered_to(&Target::worker("w1")), 0);
    }

    #[tokio::test]
    async fn test_rule_routes_to_worker_named_in_payload() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::worker("w1"));
        transport.connect(Target::worker("w2"));
        router.add_rule(to_named_worker()).await.unwrap();

        let outcome = router.route_message(assigned("w2"), None).await;
        assert_eq!(outcome, RoutingOutcome::Delivered(1));
        assert_eq!(transport.delivered_to(&Target::worker("w2")), 1);
        assert_eq!(transport.delivered_to(&Target::worker("w1")), 0);

        let stats = router.statistics().await;
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.active_routes, 1);
    }

    #[tokio::test]
    async fn test_only_first_routing_rule_routes() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::client("c1"));
        transport.connect(Target::monitor("m1"));
        router
            .add_rule(RoutingRule::new("monitors", "low").with_priority(1).route_to(TargetKind::Monitor))
            .await
            .unwrap();
        router
            .add_rule(RoutingRule::new("clients", "high").with_priority(5).route_to(TargetKind::Client))
            .await
            .unwrap();

        assert_eq!(
            router.route_message(assigned("w1"), None).await,
            RoutingOutcome::Delivered(1)
        );
        assert_eq!(transport.delivered_to(&Target::client("c1")), 1);
        assert_eq!(transport.delivered_to(&Target::monitor("m1")), 0);
    }

    #[tokio::test]
    async fn test_rules_run_in_priority_order_and_can_be_toggled() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::client("c1"));
        router
            .add_filter(Arc::new(FnFilter::new("block-all", 0, |_: &BaseMessage| {
                FilterDecision::Deny("blocked".into())
            })))
            .await;
        router.set_filter_enabled("block-all", false).await;

        router
            .add_rule(
                RoutingRule::new("deny", "deny via filter")
                    .with_priority(10)
                    .with_action(RuleAction::Filter { filter: "block-all".into() }),
            )
            .await
            .unwrap();
        router
            .add_rule(RoutingRule::new("clients", "to clients").route_to(TargetKind::Client))
            .await
            .unwrap();

        // The rule action still applies the filter by name even though it is
        // disabled for the filtering stage
        assert_eq!(router.route_message(assigned("w1"), None).await, RoutingOutcome::Dropped);

        router.set_rule_enabled("deny", false).await;
        assert_eq!(
            router.route_message(assigned("w1"), None).await,
            RoutingOutcome::Delivered(1)
        );
        assert!(router.remove_rule("deny").await);
        assert_eq!(router.rules().await.len(), 1);
    }

    #[tokio::test]
    async fn test_filter_deny_drops_without_dead_letter() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::monitor("m1"));
        router
            .add_filter(Arc::new(FnFilter::new("no-heartbeats", 5, |m: &BaseMessage| {
                if m.message_type == MessageType::WorkerHeartbeat {
                    FilterDecision::Deny("noise".into())
                } else {
                    FilterDecision::Allow
                }
            })))
            .await;

        let heartbeat = BaseMessage::new(MessageType::WorkerHeartbeat, json!({}), SourceKind::Worker);
        assert_eq!(router.route_message(heartbeat, None).await, RoutingOutcome::Dropped);
        assert!(router.dead_letters().await.is_empty());
        assert_eq!(router.statistics().await.dropped, 1);
        assert!(transport.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_transformers_apply_in_priority_order() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::monitor("m1"));

        let stamp = |name: &'static str, priority: i32| {
            Arc::new(FnTransformer::new(name, priority, move |m: &BaseMessage| {
                let mut m = m.clone();
                let trail = m.payload["trail"].as_str().unwrap_or("").to_string();
                m.payload["trail"] = json!(format!("{trail}{name}"));
                Some(m)
            }))
        };
        router.add_transformer(stamp("b", 1)).await;
        router.add_transformer(stamp("a", 9)).await;
        router.add_transformer(stamp("c", 0)).await;
        router.set_transformer_enabled("c", false).await;

        router.route_message(assigned("w1"), None).await;
        let (_, delivered) = &transport.delivered()[0];
        assert_eq!(delivered.payload["trail"], "ab");
    }

    #[tokio::test]
    async fn test_failed_delivery_is_dead_lettered() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::worker("w1"));
        transport.set_failing(Target::worker("w1"), true);
        router.add_rule(to_named_worker()).await.unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();
        router
            .on_routing_error(Arc::new(move |_entry: &DeadLetter| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let outcome = router.route_message(assigned("w1"), None).await;
        assert_eq!(outcome, RoutingOutcome::DeadLettered);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let letters = router.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].target, Some(Target::worker("w1")));
        assert_eq!(letters[0].attempts, 1);

        let stats = router.statistics().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(stats.dead_letter_count, 1);
    }

    #[tokio::test]
    async fn test_slow_delivery_times_out() {
        let config = RouterConfig {
            routing_timeout_ms: 10,
            ..RouterConfig::default()
        };
        let (transport, router) = setup(config);
        transport.connect(Target::monitor("m1"));
        transport.set_delay(Duration::from_millis(200));

        let outcome = router.route_message(assigned("w1"), None).await;
        assert_eq!(outcome, RoutingOutcome::DeadLettered);
        assert!(router.dead_letters().await[0].error.contains("timed out"));
    }

    #[tokio::test]
    async fn test_reprocess_dead_letter_once() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::worker("w1"));
        transport.set_failing(Target::worker("w1"), true);
        router.add_rule(to_named_worker()).await.unwrap();

        router.route_message(assigned("w1"), None).await;
        let id = router.dead_letters().await[0].id.clone();

        // Still failing: entry restored with another attempt
        assert!(!router.reprocess_dead_letter(&id).await.unwrap());
        let letters = router.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 2);

        transport.set_failing(Target::worker("w1"), false);
        assert!(router.reprocess_dead_letter(&id).await.unwrap());
        assert!(router.dead_letters().await.is_empty());
        assert_eq!(transport.delivered_to(&Target::worker("w1")), 1);

        let err = router.reprocess_dead_letter(&id).await.unwrap_err();
        assert!(matches!(err, RoutingError::DeadLetterNotFound(_)));
        assert_eq!(transport.delivered_to(&Target::worker("w1")), 1);
    }

    #[tokio::test]
    async fn test_partial_reprocess_keeps_only_failed_targets() {
        let (transport, router) = setup(RouterConfig::default());
        for id in ["m1", "m2", "m3"] {
            transport.connect(Target::monitor(id));
        }
        let entry = router
            .handle_routing_error(assigned("w1"), None, None, &RoutingError::QueueFull(1))
            .await;

        transport.set_failing(Target::monitor("m2"), true);
        transport.set_failing(Target::monitor("m3"), true);
        assert!(!router.reprocess_dead_letter(&entry.id).await.unwrap());
        assert_eq!(transport.delivered_to(&Target::monitor("m1")), 1);

        let letters = router.dead_letters().await;
        assert_eq!(letters.len(), 2);
        let mut pinned: Vec<_> = letters.iter().filter_map(|l| l.target.clone()).collect();
        pinned.sort();
        assert_eq!(pinned, vec![Target::monitor("m2"), Target::monitor("m3")]);
        assert!(letters.iter().all(|l| l.attempts == 2));
        assert!(letters.iter().any(|l| l.id == entry.id));

        transport.set_failing(Target::monitor("m2"), false);
        transport.set_failing(Target::monitor("m3"), false);
        for letter in letters {
            assert!(router.reprocess_dead_letter(&letter.id).await.unwrap());
        }
        assert!(router.dead_letters().await.is_empty());
        for id in ["m1", "m2", "m3"] {
            assert_eq!(transport.delivered_to(&Target::monitor(id)), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reprocess_delivers_once() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::worker("w1"));
        transport.set_failing(Target::worker("w1"), true);
        router.add_rule(to_named_worker()).await.unwrap();
        router.route_message(assigned("w1"), None).await;
        transport.set_failing(Target::worker("w1"), false);

        let router = Arc::new(router);
        let id = router.dead_letters().await[0].id.clone();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let router = router.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { router.reprocess_dead_letter(&id).await }));
        }

        let mut successes = 0;
        for handle in handles {
            if let Ok(true) = handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(transport.delivered_to(&Target::worker("w1")), 1);
    }

    #[tokio::test]
    async fn test_clear_and_cleanup_dead_letters() {
        let config = RouterConfig {
            dead_letter_retention_hours: 0,
            ..RouterConfig::default()
        };
        let (transport, router) = setup(config);
        transport.connect(Target::monitor("m1"));
        transport.set_failing(Target::monitor("m1"), true);

        router.route_message(assigned("w1"), None).await;
        router.route_message(assigned("w2"), None).await;
        assert_eq!(router.dead_letters().await.len(), 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(router.cleanup_dead_letters().await, 2);

        router.route_message(assigned("w3"), None).await;
        assert_eq!(router.clear_dead_letters().await, 1);
        assert!(router.dead_letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_batching_queues_then_drains() {
        let config = RouterConfig {
            enable_batching: true,
            ..RouterConfig::default()
        };
        let (transport, router) = setup(config);
        transport.connect(Target::monitor("m1"));

        for _ in 0..3 {
            assert_eq!(router.route_message(assigned("w1"), None).await, RoutingOutcome::Queued);
        }
        assert!(transport.delivered().is_empty());
        assert_eq!(router.queue_depth().await, 3);

        assert_eq!(router.process_batch(2).await, 2);
        assert_eq!(router.process_message_queue().await, 1);
        assert_eq!(transport.delivered().len(), 3);
        assert_eq!(router.statistics().await.queued, 3);
    }

    #[tokio::test]
    async fn test_queue_overflow_rejects() {
        let config = RouterConfig {
            max_queue_size: 1,
            queue_overflow: crate::QueueOverflowPolicy::Reject,
            ..RouterConfig::default()
        };
        let (_transport, router) = setup(config);

        router.queue_message(assigned("w1"), Some(1), None).await.unwrap();
        let err = router
            .queue_message(assigned("w2"), Some(5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::QueueFull(1)));
    }

    #[tokio::test]
    async fn test_delivery_primitives() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::worker("w1"));
        transport.connect(Target::worker("w2"));
        transport.connect(Target::client("c1"));
        let msg = assigned("w1");

        assert_eq!(router.route_to_workers(&msg, None).await, 2);
        assert_eq!(router.route_to_workers(&msg, Some(&["w2".to_string()])).await, 1);
        assert_eq!(router.route_to_clients(&msg, None).await, 1);
        assert_eq!(router.route_to_monitors(&msg, None).await, 0);

        assert!(router.route_to_specific_target(&Target::client("c1"), &msg).await);
        transport.set_failing(Target::client("c1"), true);
        assert!(!router.route_to_specific_target(&Target::client("c1"), &msg).await);
        assert_eq!(router.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_channels_and_hooks() {
        let (_transport, router) = setup(RouterConfig::default());
        let subscribed = Arc::new(AtomicUsize::new(0));
        let counter = subscribed.clone();
        router
            .on_channel_subscribed(Arc::new(move |_channel: &str, _id: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await;

        let mut rx = router.subscribe_to_channel("gpu-pool", "c1").await;
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);

        let reached = router.publish_message("gpu-pool", assigned("w1")).await;
        assert_eq!(reached, 1);
        assert_eq!(rx.recv().await.unwrap().message_type, MessageType::JobAssigned);
        assert_eq!(router.publish_message("nobody", assigned("w1")).await, 0);

        let stats = router.channel_statistics().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].subscriber_count, 1);
        assert_eq!(stats[0].published, 1);
        assert_eq!(stats[0].received, 1);
        assert_eq!(router.statistics().await.subscribed_channels, 1);

        assert!(router.unsubscribe_from_channel("gpu-pool", "c1").await);
        assert!(!router.unsubscribe_from_channel("gpu-pool", "c1").await);
        assert_eq!(router.statistics().await.subscribed_channels, 0);
    }

    #[tokio::test]
    async fn test_message_routed_hook_and_reset() {
        let (transport, router) = setup(RouterConfig::default());
        transport.connect(Target::monitor("m1"));
        let routed = Arc::new(AtomicUsize::new(0));
        let counter = routed.clone();
        router
            .on_message_routed(Arc::new(move |_m: &BaseMessage, outcome: &RoutingOutcome| {
                if matches!(outcome, RoutingOutcome::Delivered(_)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .await;

        router.route_message(assigned("w1"), None).await;
        assert_eq!(routed.load(Ordering::SeqCst), 1);

        router.reset_statistics().await;
        let stats = router.statistics().await;
        assert_eq!(stats.routed, 0);
        assert_eq!(stats.deliveries, 0);
    }

    #[tokio::test]
    async fn test_invalid_rule_rejected() {
        let (_transport, router) = setup(RouterConfig::default());
        let rule = RoutingRule::new("bad", "bad").with_condition(RuleCondition::new(
            "type",
            ConditionOperator::Regex,
            json!("[unclosed"),
        ));
        assert!(router.add_rule(rule).await.is_err());
        assert!(router.rules().await.is_empty());
    }
}
