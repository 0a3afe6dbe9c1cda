//! In-process connection registry.
//!
//! Each connected worker, client or monitor owns the receiving half of a
//! bounded channel; the router delivers by sending on the other half.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use jobhub_core::BaseMessage;
use jobhub_router::{DeliveryTransport, RoutingError, Target, TargetKind};

/// Connected targets and their outbound channels.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Target, mpsc::Sender<BaseMessage>>>,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a target. A second connection for the same target replaces
    /// the first, whose receiver then sees the channel close.
    pub async fn connect(&self, target: Target) -> mpsc::Receiver<BaseMessage> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let replaced = self.connections.write().await.insert(target.clone(), tx);
        if replaced.is_some() {
            info!(connection = %target, "Connection replaced");
        } else {
            info!(connection = %target, "Connection opened");
        }
        rx
    }

    pub async fn disconnect(&self, target: &Target) -> bool {
        let removed = self.connections.write().await.remove(target).is_some();
        if removed {
            info!(connection = %target, "Connection closed");
        }
        removed
    }

    pub async fn is_connected(&self, target: &Target) -> bool {
        self.connections
            .read()
            .await
            .get(target)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of open connections of each kind.
    pub async fn counts(&self) -> HashMap<TargetKind, usize> {
        let mut counts = HashMap::new();
        for target in self.connections.read().await.keys() {
            *counts.entry(target.kind).or_insert(0) += 1;
        }
        counts
    }

    /// Drop registrations whose receivers are gone.
    pub async fn prune_closed(&self) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|target, tx| {
            let open = !tx.is_closed();
            if !open {
                debug!(connection = %target, "Pruning closed connection");
            }
            open
        });
        before - connections.len()
    }
}

#[async_trait]
impl DeliveryTransport for ConnectionRegistry {
    async fn deliver(&self, target: &Target, message: &BaseMessage) -> Result<(), RoutingError> {
        let tx = self
            .connections
            .read()
            .await
            .get(target)
            .cloned()
            .ok_or_else(|| RoutingError::NotConnected(target.clone()))?;

        tx.send(message.clone())
            .await
            .map_err(|_| RoutingError::DeliveryFailed {
                target: target.clone(),
                reason: "connection closed".to_string(),
            })
    }

    async fn connected(&self, kind: TargetKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(target, tx)| target.kind == kind && !tx.is_closed())
            .map(|(target, _)| target.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
