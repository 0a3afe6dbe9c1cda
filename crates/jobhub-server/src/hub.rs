//! Hub wiring.
//!
//! Inbound wire messages are dispatched by the [`MessageHandler`] to handlers
//! that call into the [`JobBroker`]. Broker lifecycle events flow the other
//! way: each one becomes a wire message routed through the [`MessageRouter`]
//! to the connected workers, clients and monitors.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobhub_broker::{BrokerError, JobBroker};
use jobhub_core::{
    BaseMessage, JobId, JobSubmission, MessageType, SourceKind, WorkerCapabilities, WorkerId,
    WorkerStatus,
};
use jobhub_router::{
    ConditionOperator, Handler, HandlerError, MessageContext, MessageHandler, MessageRouter,
    RouteTarget, RouterConfig, RoutingError, RoutingRule, RuleAction, RuleCondition, Target,
    TargetKind,
};

use crate::connections::ConnectionRegistry;

/// The broker, the inbound handler registry and the outbound router.
pub struct Hub {
    pub broker: Arc<JobBroker>,
    pub handler: MessageHandler,
    pub router: Arc<MessageRouter>,
    pub connections: Arc<ConnectionRegistry>,
}

impl Hub {
    /// Build a hub with the standard handlers and routing rules installed.
    pub async fn new(
        broker: Arc<JobBroker>,
        router_config: RouterConfig,
        connection_buffer: usize,
    ) -> Result<Arc<Self>, RoutingError> {
        let connections = Arc::new(ConnectionRegistry::new(connection_buffer));
        let router = Arc::new(MessageRouter::new(router_config, connections.clone()));

        let hub = Arc::new(Self {
            broker,
            handler: MessageHandler::new(),
            router,
            connections,
        });

        for rule in default_rules() {
            hub.router.add_rule(rule).await?;
        }
        hub.install_handlers().await;
        Ok(hub)
    }

    async fn install_handlers(self: &Arc<Self>) {
        let jobs = Arc::new(JobMessages { hub: Arc::downgrade(self) });
        for message_type in [
            MessageType::SubmitJob,
            MessageType::UpdateJobProgress,
            MessageType::CompleteJob,
            MessageType::JobFailed,
            MessageType::CancelJob,
        ] {
            self.handler.register_handler(message_type, jobs.clone()).await;
        }

        let workers = Arc::new(WorkerMessages { hub: Arc::downgrade(self) });
        for message_type in [
            MessageType::RegisterWorker,
            MessageType::WorkerStatus,
            MessageType::WorkerHeartbeat,
            MessageType::WorkerDisconnect,
        ] {
            self.handler.register_handler(message_type, workers.clone()).await;
        }

        let system = Arc::new(SystemMessages { hub: Arc::downgrade(self) });
        for message_type in [
            MessageType::ServiceRequest,
            MessageType::SystemStatus,
            MessageType::Error,
        ] {
            self.handler.register_handler(message_type, system.clone()).await;
        }
    }

    /// Dispatch an inbound message. A failure is reported back to the sender
    /// as an `error` message and returned to the caller.
    pub async fn receive(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError> {
        let message_type = message.message_type;
        let reply_to = reply_target(&ctx);
        let result = self.handler.handle_message(message, ctx).await;

        if let (Err(e), Some(target)) = (&result, reply_to) {
            let error = BaseMessage::new(
                MessageType::Error,
                json!({"error": e.to_string(), "message_type": message_type.as_str()}),
                SourceKind::Hub,
            );
            self.router.route_to_specific_target(&target, &error).await;
        }
        result
    }

    /// Parse and dispatch a raw wire message. Unparseable input is counted
    /// as a failed message.
    pub async fn receive_raw(&self, raw: &str, ctx: MessageContext) -> Result<(), HandlerError> {
        match MessageHandler::parse_message(raw) {
            Some(message) => self.receive(message, ctx).await,
            None => self.handler.handle_raw(raw, ctx).await,
        }
    }

    /// Offer pending work to every connected idle worker until the queue
    /// yields nothing more. Returns the ids of the jobs assigned.
    pub async fn dispatch_pending(&self) -> Result<Vec<JobId>, BrokerError> {
        let mut assigned = Vec::new();
        for worker in self.broker.list_workers().await? {
            if worker.status != WorkerStatus::Idle {
                continue;
            }
            let Some(caps) = worker.capabilities else {
                continue;
            };
            if !self
                .connections
                .is_connected(&Target::worker(caps.worker_id.as_str()))
                .await
            {
                continue;
            }
            if let Some(job) = self.broker.get_next_job_for_worker(&caps).await? {
                assigned.push(job.id);
            }
            if self.broker.get_queue_depth().await? == 0 {
                break;
            }
        }
        if !assigned.is_empty() {
            debug!(count = assigned.len(), "Dispatched pending jobs");
        }
        Ok(assigned)
    }

    /// Route every broker lifecycle event until cancelled.
    pub async fn forward_events(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.broker.subscribe_events();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        let outcome = self.router.route_message(event.to_message(), None).await;
                        debug!(
                            job_id = %event.job_id,
                            event = event.event_type.as_str(),
                            outcome = ?outcome,
                            "Lifecycle event routed"
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Event forwarder lagged, skipping events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("Event forwarder stopped");
    }

    /// Reply to the sender of `ctx` with a `system_status` message.
    async fn reply_status(&self, ctx: &MessageContext, payload: Value) {
        if let Some(target) = reply_target(ctx) {
            let reply = BaseMessage::new(MessageType::SystemStatus, payload, SourceKind::Hub);
            self.router.route_to_specific_target(&target, &reply).await;
        }
    }
}

/// Where replies to the sender of a message go.
fn reply_target(ctx: &MessageContext) -> Option<Target> {
    let id = ctx.source_id.clone()?;
    let kind = match ctx.source_kind {
        SourceKind::Worker => TargetKind::Worker,
        SourceKind::Client => TargetKind::Client,
        SourceKind::Hub | SourceKind::System => TargetKind::Monitor,
    };
    Some(Target::new(kind, id))
}

/// Routing rules installed on every hub.
///
/// Assignments and cancellations reach the worker named in the payload; job
/// updates reach clients; permanent failures raise an alert. Monitors see
/// everything, explicitly or through the default route.
pub fn default_rules() -> Vec<RoutingRule> {
    vec![
        RoutingRule::new("job-assigned", "Assignments to their worker")
            .with_priority(100)
            .for_types(&[MessageType::JobAssigned])
            .with_action(RuleAction::Route(RouteTarget::from_field(
                TargetKind::Worker,
                "payload.worker_id",
            )))
            .route_to(TargetKind::Monitor),
        RoutingRule::new("job-cancelled", "Cancellations to the holding worker")
            .with_priority(90)
            .for_types(&[MessageType::CancelJob])
            .with_condition(RuleCondition::new(
                "payload.worker_id",
                ConditionOperator::Exists,
                Value::Null,
            ))
            .with_action(RuleAction::Route(RouteTarget::from_field(
                TargetKind::Worker,
                "payload.worker_id",
            )))
            .route_to(TargetKind::Client)
            .route_to(TargetKind::Monitor),
        RoutingRule::new("job-failed-alert", "Alert on permanent failures")
            .with_priority(80)
            .for_types(&[MessageType::JobFailed])
            .with_condition(RuleCondition::new(
                "payload.event",
                ConditionOperator::Equals,
                json!("failed"),
            ))
            .with_action(RuleAction::Alert {
                message: "Job failed permanently".to_string(),
            }),
        RoutingRule::new("job-updates", "Job updates to clients")
            .with_priority(10)
            .for_types(&[
                MessageType::UpdateJobProgress,
                MessageType::CompleteJob,
                MessageType::JobFailed,
                MessageType::CancelJob,
                MessageType::JobStatusChanged,
            ])
            .from_sources(&[SourceKind::Hub])
            .route_to(TargetKind::Client)
            .route_to(TargetKind::Monitor),
    ]
}

fn payload_job_id(message: &BaseMessage) -> Result<JobId, HandlerError> {
    message
        .payload_str("job_id")
        .map(JobId::new)
        .ok_or_else(|| HandlerError::Invalid("job_id must be a string".to_string()))
}

fn sender_worker(ctx: &MessageContext) -> Option<WorkerId> {
    match ctx.source_kind {
        SourceKind::Worker => ctx.source_id.as_deref().map(WorkerId::new),
        _ => None,
    }
}

fn require_worker(ctx: &MessageContext) -> Result<WorkerId, HandlerError> {
    sender_worker(ctx).ok_or_else(|| HandlerError::Invalid("sender is not a worker".to_string()))
}

fn broker_failure(e: BrokerError) -> HandlerError {
    match e {
        BrokerError::InvalidRequest(msg) => HandlerError::Invalid(msg),
        other => HandlerError::Failed(other.to_string()),
    }
}

fn upgrade(hub: &std::sync::Weak<Hub>) -> Result<Arc<Hub>, HandlerError> {
    hub.upgrade()
        .ok_or_else(|| HandlerError::Failed("hub is shutting down".to_string()))
}

// ============================================================================
// Job messages
// ============================================================================

struct JobMessages {
    hub: std::sync::Weak<Hub>,
}

#[async_trait]
impl Handler for JobMessages {
    async fn handle(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError> {
        let hub = upgrade(&self.hub)?;
        let broker = &hub.broker;

        match message.message_type {
            MessageType::SubmitJob => {
                let submission: JobSubmission = serde_json::from_value(message.payload)
                    .map_err(|e| HandlerError::Invalid(format!("bad submission: {e}")))?;
                let job = broker.submit_job(submission).await.map_err(broker_failure)?;
                hub.reply_status(
                    &ctx,
                    json!({"job_id": job.id.as_str(), "workflow_id": job.workflow_id.as_str(), "status": "pending"}),
                )
                .await;
                hub.dispatch_pending().await.map_err(broker_failure)?;
            }
            MessageType::UpdateJobProgress => {
                let job_id = payload_job_id(&message)?;
                let worker_id = require_worker(&ctx)?;
                let progress = message
                    .payload
                    .get("progress")
                    .and_then(Value::as_u64)
                    .and_then(|p| u8::try_from(p).ok())
                    .ok_or_else(|| HandlerError::Invalid("progress must be 0-100".to_string()))?;
                let note = message.payload_str("message").map(str::to_string);
                broker
                    .update_job_progress(&job_id, &worker_id, progress, note)
                    .await
                    .map_err(broker_failure)?;
            }
            MessageType::CompleteJob => {
                let job_id = payload_job_id(&message)?;
                broker
                    .complete_job(&job_id, sender_worker(&ctx).as_ref())
                    .await
                    .map_err(broker_failure)?;
                hub.dispatch_pending().await.map_err(broker_failure)?;
            }
            MessageType::JobFailed => {
                let job_id = payload_job_id(&message)?;
                let error = message.payload_str("error").unwrap_or("unknown error").to_string();
                let retryable = message
                    .payload
                    .get("retryable")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                broker
                    .fail_job(&job_id, sender_worker(&ctx).as_ref(), error, retryable)
                    .await
                    .map_err(broker_failure)?;
                hub.dispatch_pending().await.map_err(broker_failure)?;
            }
            MessageType::CancelJob => {
                let job_id = payload_job_id(&message)?;
                broker.cancel_job(&job_id).await.map_err(broker_failure)?;
            }
            other => return Err(HandlerError::NoHandler(other)),
        }
        Ok(())
    }
}

// ============================================================================
// Worker messages
// ============================================================================

struct WorkerMessages {
    hub: std::sync::Weak<Hub>,
}

#[async_trait]
impl Handler for WorkerMessages {
    async fn handle(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError> {
        let hub = upgrade(&self.hub)?;
        let broker = &hub.broker;
        let worker_id = require_worker(&ctx)?;

        match message.message_type {
            MessageType::RegisterWorker => {
                let mut doc = message.payload.get("capabilities").cloned().unwrap_or(Value::Null);
                if let Value::Object(map) = &mut doc {
                    map.insert("worker_id".to_string(), json!(worker_id.as_str()));
                }
                let caps: WorkerCapabilities = serde_json::from_value(doc)
                    .map_err(|e| HandlerError::Invalid(format!("bad capabilities: {e}")))?;
                broker.register_worker(caps).await.map_err(broker_failure)?;
                hub.dispatch_pending().await.map_err(broker_failure)?;
            }
            MessageType::WorkerStatus => {
                let status: WorkerStatus = message
                    .payload_str("status")
                    .ok_or_else(|| HandlerError::Invalid("status must be a string".to_string()))?
                    .parse()
                    .map_err(|e: jobhub_core::CoreError| HandlerError::Invalid(e.to_string()))?;
                broker
                    .update_worker_status(&worker_id, status)
                    .await
                    .map_err(broker_failure)?;
                if status == WorkerStatus::Idle {
                    hub.dispatch_pending().await.map_err(broker_failure)?;
                }
            }
            MessageType::WorkerHeartbeat => {
                broker.record_heartbeat(&worker_id).await.map_err(broker_failure)?;
            }
            MessageType::WorkerDisconnect => {
                let released = broker.disconnect_worker(&worker_id).await.map_err(broker_failure)?;
                hub.connections.disconnect(&Target::worker(worker_id.as_str())).await;
                if !released.is_empty() {
                    hub.dispatch_pending().await.map_err(broker_failure)?;
                }
            }
            other => return Err(HandlerError::NoHandler(other)),
        }
        Ok(())
    }
}

// ============================================================================
// Service and system messages
// ============================================================================

struct SystemMessages {
    hub: std::sync::Weak<Hub>,
}

#[async_trait]
impl Handler for SystemMessages {
    async fn handle(&self, message: BaseMessage, ctx: MessageContext) -> Result<(), HandlerError> {
        let hub = upgrade(&self.hub)?;
        let broker = &hub.broker;

        match message.message_type {
            MessageType::ServiceRequest => {
                let service = message
                    .payload_str("service")
                    .ok_or_else(|| HandlerError::Invalid("service must be a string".to_string()))?
                    .to_string();
                let workers = broker.list_workers().await.map_err(broker_failure)?;
                let capable = workers
                    .iter()
                    .filter(|w| {
                        w.status != WorkerStatus::Offline
                            && w.capabilities
                                .as_ref()
                                .is_some_and(|c| c.supports_service(&service))
                    })
                    .collect::<Vec<_>>();
                let idle = capable
                    .iter()
                    .filter(|w| w.status == WorkerStatus::Idle)
                    .count();
                let queue_depth = broker.get_queue_depth().await.map_err(broker_failure)?;
                hub.reply_status(
                    &ctx,
                    json!({
                        "service": service,
                        "workers": capable.len(),
                        "idle_workers": idle,
                        "queue_depth": queue_depth,
                    }),
                )
                .await;
            }
            MessageType::SystemStatus => {
                let jobs = broker.job_statistics().await.map_err(broker_failure)?;
                let workers = broker.worker_statistics().await.map_err(broker_failure)?;
                let routing = hub.router.statistics().await;
                hub.reply_status(
                    &ctx,
                    json!({"jobs": jobs, "workers": workers, "routing": routing}),
                )
                .await;
            }
            MessageType::Error => {
                warn!(
                    source_kind = %ctx.source_kind,
                    source_id = ctx.source_id.as_deref().unwrap_or(""),
                    error = message.payload_str("error").unwrap_or(""),
                    "Error reported by peer"
                );
            }
            other => return Err(HandlerError::NoHandler(other)),
        }
        Ok(())
    }
}
