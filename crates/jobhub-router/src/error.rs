//! Router and handler errors.

use std::time::Duration;

use thiserror::Error;

use jobhub_core::MessageType;

use crate::transport::Target;

/// Why a message could not be routed.
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    #[error("Delivery to {target} failed: {reason}")]
    DeliveryFailed { target: Target, reason: String },

    #[error("Delivery to {target} timed out after {timeout:?}")]
    Timeout { target: Target, timeout: Duration },

    #[error("Target not connected: {0}")]
    NotConnected(Target),

    #[error("Message queue is full ({0} messages)")]
    QueueFull(usize),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Invalid routing rule: {0}")]
    InvalidRule(String),
}

/// Why an inbound message was not handled.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Malformed message")]
    Malformed,

    #[error("Invalid message: {0}")]
    Invalid(String),

    #[error("No handler registered for message type: {0}")]
    NoHandler(MessageType),

    #[error("Handler failed: {0}")]
    Failed(String),
}
