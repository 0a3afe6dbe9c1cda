//! Delivery transport abstraction.
//!
//! The router never owns connections. Whoever does (the server's connection
//! registry, a test double) implements [`DeliveryTransport`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobhub_core::BaseMessage;

use crate::RoutingError;

/// Kind of delivery target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Worker,
    Client,
    Monitor,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Client => "client",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(Self::Worker),
            "client" => Ok(Self::Client),
            "monitor" => Ok(Self::Monitor),
            other => Err(format!("unknown target kind '{other}'")),
        }
    }
}

/// A single delivery target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub id: String,
}

impl Target {
    pub fn new(kind: TargetKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn worker(id: impl Into<String>) -> Self {
        Self::new(TargetKind::Worker, id)
    }

    pub fn client(id: impl Into<String>) -> Self {
        Self::new(TargetKind::Client, id)
    }

    pub fn monitor(id: impl Into<String>) -> Self {
        Self::new(TargetKind::Monitor, id)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Delivers messages to connected targets.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Deliver one message to one target.
    async fn deliver(&self, target: &Target, message: &BaseMessage) -> Result<(), RoutingError>;

    /// Ids of the currently connected targets of a kind.
    async fn connected(&self, kind: TargetKind) -> Vec<String>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    /// Records deliveries; targets can be marked failing or slow.
    #[derive(Default)]
    pub struct RecordingTransport {
        connected: Mutex<HashMap<TargetKind, Vec<String>>>,
        delivered: Mutex<Vec<(Target, BaseMessage)>>,
        failing: Mutex<HashSet<Target>>,
        delay: Mutex<Option<Duration>>,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn connect(&self, target: Target) {
            self.connected
                .lock()
                .unwrap()
                .entry(target.kind)
                .or_default()
                .push(target.id);
        }

        pub fn set_failing(&self, target: Target, failing: bool) {
            let mut set = self.failing.lock().unwrap();
            if failing {
                set.insert(target);
            } else {
                set.remove(&target);
            }
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn delivered(&self) -> Vec<(Target, BaseMessage)> {
            self.delivered.lock().unwrap().clone()
        }

        pub fn delivered_to(&self, target: &Target) -> usize {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .filter(|(t, _)| t == target)
                .count()
        }
    }

    #[async_trait]
    impl DeliveryTransport for RecordingTransport {
        async fn deliver(&self, target: &Target, message: &BaseMessage) -> Result<(), RoutingError> {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.lock().unwrap().contains(target) {
                return Err(RoutingError::DeliveryFailed {
                    target: target.clone(),
                    reason: "connection reset".to_string(),
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((target.clone(), message.clone()));
            Ok(())
        }

        async fn connected(&self, kind: TargetKind) -> Vec<String> {
            self.connected
                .lock()
                .unwrap()
                .get(&kind)
                .cloned()
                .unwrap_or_default()
        }
    }
}
