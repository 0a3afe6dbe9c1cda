//! Inbound message validation and dispatch.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use jobhub_core::{BaseMessage, MessageType, SourceKind};

use crate::HandlerError;

/// Window used for the messages-per-second rate.
const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Who sent an inbound message, as established by the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub source_kind: SourceKind,
    pub source_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl MessageContext {
    pub fn new(source_kind: SourceKind, source_id: Option<String>) -> Self {
        Self {
            source_kind,
            source_id,
            received_at: Utc::now(),
        }
    }

    pub fn worker(worker_id: impl Into<String>) -> Self {
        Self::new(SourceKind::Worker, Some(worker_id.into()))
    }

    pub fn client(client_id: impl Into<String>) -> Self {
        Self::new(SourceKind::Client, Some(client_id.into()))
    }
}

/// Handles one message type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(BaseMessage, MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError> {
        (self.0)(message, ctx).await
    }
}

/// Snapshot of handler counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageStatistics {
    pub processed: u64,
    pub failed: u64,
    pub by_type: HashMap<String, u64>,
    pub messages_per_second: f64,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    failed: u64,
    by_type: HashMap<MessageType, u64>,
    recent: VecDeque<Instant>,
}

impl Counters {
    fn prune(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) > window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Registry of per-type handlers plus running statistics.
pub struct MessageHandler {
    handlers: RwLock<HashMap<MessageType, Arc<dyn Handler>>>,
    counters: Mutex<Counters>,
    rate_window: Duration,
}

impl Default for MessageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler {
    pub fn new() -> Self {
        Self::with_rate_window(DEFAULT_RATE_WINDOW)
    }

    pub fn with_rate_window(rate_window: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            rate_window,
        }
    }

    /// Register a handler, replacing any previous handler for the type.
    pub async fn register_handler(&self, message_type: MessageType, handler: Arc<dyn Handler>) {
        let replaced = self
            .handlers
            .write()
            .await
            .insert(message_type, handler)
            .is_some();
        debug!(message_type = %message_type, replaced, "Registered message handler");
    }

    pub async fn unregister_handler(&self, message_type: MessageType) -> bool {
        self.handlers.write().await.remove(&message_type).is_some()
    }

    pub async fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.read().await.contains_key(&message_type)
    }

    /// Parse a raw wire message; `None` when it cannot be interpreted.
    pub fn parse_message(raw: &str) -> Option<BaseMessage> {
        BaseMessage::parse(raw)
    }

    /// Shape checks beyond parsing: an object payload carrying every key the
    /// type requires, a positive timestamp and a non-empty sender id.
    pub fn validate_message(message: &BaseMessage) -> bool {
        let Some(payload) = message.payload.as_object() else {
            return false;
        };
        if message.timestamp <= 0 {
            return false;
        }
        if message.source_id.as_deref() == Some("") {
            return false;
        }
        message
            .message_type
            .required_payload_fields()
            .iter()
            .all(|key| !matches!(payload.get(*key), None | Some(Value::Null)))
    }

    /// Dispatch a message to its handler. Every outcome is counted; missing
    /// handlers and invalid messages count as failures.
    pub async fn handle_message(
        &self,
        mut message: BaseMessage,
        ctx: MessageContext,
    ) -> Result<(), HandlerError> {
        let message_type = message.message_type;

        if !Self::validate_message(&message) {
            self.record(message_type, false).await;
            return Err(HandlerError::Invalid(format!(
                "{} message failed validation",
                message_type
            )));
        }

        // The connection is authoritative for who sent the message
        message.source_kind = ctx.source_kind;
        if ctx.source_id.is_some() {
            message.source_id = ctx.source_id.clone();
        }

        let handler = self.handlers.read().await.get(&message_type).cloned();
        let Some(handler) = handler else {
            warn!(message_type = %message_type, "No handler registered");
            self.record(message_type, false).await;
            return Err(HandlerError::NoHandler(message_type));
        };

        let result = handler.handle(message, ctx).await;
        if let Err(e) = &result {
            warn!(message_type = %message_type, error = %e, "Message handler failed");
        }
        self.record(message_type, result.is_ok()).await;
        result
    }

    /// Parse and dispatch a raw message.
    pub async fn handle_raw(&self, raw: &str, ctx: MessageContext) -> Result<(), HandlerError> {
        match Self::parse_message(raw) {
            Some(message) => self.handle_message(message, ctx).await,
            None => {
                let mut counters = self.counters.lock().await;
                counters.failed += 1;
                Err(HandlerError::Malformed)
            }
        }
    }

    pub async fn handle_worker_message(
        &self,
        worker_id: &str,
        message: BaseMessage,
    ) -> Result<(), HandlerError> {
        self.handle_message(message, MessageContext::worker(worker_id))
            .await
    }

    pub async fn handle_client_message(
        &self,
        client_id: &str,
        message: BaseMessage,
    ) -> Result<(), HandlerError> {
        self.handle_message(message, MessageContext::client(client_id))
            .await
    }

    async fn record(&self, message_type: MessageType, ok: bool) {
        let mut counters = self.counters.lock().await;
        if ok {
            counters.processed += 1;
        } else {
            counters.failed += 1;
        }
        *counters.by_type.entry(message_type).or_insert(0) += 1;
        counters.recent.push_back(Instant::now());
        counters.prune(self.rate_window);
    }

    pub async fn statistics(&self) -> MessageStatistics {
        let mut counters = self.counters.lock().await;
        counters.prune(self.rate_window);
        MessageStatistics {
            processed: counters.processed,
            failed: counters.failed,
            by_type: counters
                .by_type
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            messages_per_second: counters.recent.len() as f64
                / self.rate_window.as_secs_f64().max(f64::EPSILON),
        }
    }

    /// Zero every counter.
    pub async fn reset_statistics(&self) {
        *self.counters.lock().await = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn heartbeat() -> BaseMessage {
        BaseMessage::new(MessageType::WorkerHeartbeat, json!({}), SourceKind::Worker)
    }

    fn counting_handler(count: Arc<AtomicUsize>) -> Arc<dyn Handler> {
        Arc::new(FnHandler::new(move |_msg: BaseMessage, _ctx: MessageContext| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }))
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let handler = MessageHandler::new();
        let count = Arc::new(AtomicUsize::new(0));
        handler
            .register_handler(MessageType::WorkerHeartbeat, counting_handler(count.clone()))
            .await;

        assert!(handler.has_handler(MessageType::WorkerHeartbeat).await);
        handler.handle_worker_message("w1", heartbeat()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stats = handler.statistics().await;
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.by_type.get("heartbeat"), Some(&1));
        assert!(stats.messages_per_second > 0.0);
    }

    #[tokio::test]
    async fn test_context_stamps_sender() {
        let handler = MessageHandler::new();
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let sink = seen.clone();
        handler
            .register_handler(
                MessageType::WorkerHeartbeat,
                Arc::new(FnHandler::new(move |msg: BaseMessage, _ctx: MessageContext| {
                    let sink = sink.clone();
                    async move {
                        *sink.lock().await = msg.source_id.clone();
                        Ok::<(), HandlerError>(())
                    }
                })),
            )
            .await;

        handler.handle_worker_message("w9", heartbeat()).await.unwrap();
        assert_eq!(seen.lock().await.as_deref(), Some("w9"));
    }

    #[tokio::test]
    async fn test_unregistered_type_counts_as_failure() {
        let handler = MessageHandler::new();
        let err = handler
            .handle_client_message("c1", heartbeat())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::NoHandler(MessageType::WorkerHeartbeat)));

        let stats = handler.statistics().await;
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces() {
        let handler = MessageHandler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        handler
            .register_handler(MessageType::WorkerHeartbeat, counting_handler(first.clone()))
            .await;
        handler
            .register_handler(MessageType::WorkerHeartbeat, counting_handler(second.clone()))
            .await;

        handler.handle_worker_message("w1", heartbeat()).await.unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(handler.unregister_handler(MessageType::WorkerHeartbeat).await);
        assert!(!handler.has_handler(MessageType::WorkerHeartbeat).await);
    }

    #[tokio::test]
    async fn test_validation() {
        let valid = BaseMessage::new(
            MessageType::JobFailed,
            json!({"job_id": "j1", "error": "oom"}),
            SourceKind::Worker,
        );
        assert!(MessageHandler::validate_message(&valid));

        let missing = BaseMessage::new(MessageType::JobFailed, json!({"job_id": "j1"}), SourceKind::Worker);
        assert!(!MessageHandler::validate_message(&missing));

        let not_object = BaseMessage::new(MessageType::WorkerHeartbeat, json!([1]), SourceKind::Worker);
        assert!(!MessageHandler::validate_message(&not_object));

        let empty_sender = heartbeat().with_source_id("");
        assert!(!MessageHandler::validate_message(&empty_sender));

        let handler = MessageHandler::new();
        let err = handler
            .handle_worker_message("w1", missing)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_raw_parse_failure_and_reset() {
        let handler = MessageHandler::new();
        let err = handler
            .handle_raw("{\"type\":", MessageContext::client("c1"))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed));
        assert_eq!(handler.statistics().await.failed, 1);

        handler.reset_statistics().await;
        assert_eq!(handler.statistics().await, MessageStatistics::default());
    }
}
