//! Core domain errors.

use thiserror::Error;

/// Core domain errors for jobhub.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input that cannot be interpreted at all.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A requirement document whose known sections have the wrong shape.
    #[error("Malformed requirements: {0}")]
    MalformedRequirements(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
