//! Mapping of broker and router errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use jobhub_broker::BrokerError;
use jobhub_router::{HandlerError, RoutingError};

use crate::http::responses::ErrorResponse;

/// Error returned by API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        let status = match &e {
            BrokerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::JobNotFound(_)
            | BrokerError::WorkflowNotFound(_)
            | BrokerError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::InvalidTransition { .. } | BrokerError::ClaimInProgress(_) => {
                StatusCode::CONFLICT
            }
            BrokerError::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::AssignmentNotRecorded { .. } | BrokerError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, e.to_string())
    }
}

impl From<RoutingError> for ApiError {
    fn from(e: RoutingError) -> Self {
        let status = match &e {
            RoutingError::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            RoutingError::InvalidRule(_) => StatusCode::BAD_REQUEST,
            RoutingError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl From<HandlerError> for ApiError {
    fn from(e: HandlerError) -> Self {
        let status = match &e {
            HandlerError::Malformed | HandlerError::Invalid(_) | HandlerError::NoHandler(_) => {
                StatusCode::BAD_REQUEST
            }
            HandlerError::Failed(_) => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
