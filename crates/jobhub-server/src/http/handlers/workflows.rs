//! Workflow handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use jobhub_core::WorkflowId;

use crate::http::error::ApiError;
use crate::http::responses::{CreateWorkflowRequest, WorkflowStatusRequest};
use crate::hub::Hub;

pub async fn create_workflow(
    State(hub): State<Arc<Hub>>,
    body: Option<Json<CreateWorkflowRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let workflow = hub
        .broker
        .create_workflow(request.priority, request.customer_id)
        .await?;
    Ok((StatusCode::CREATED, Json(workflow)))
}

/// Workflow record with member job counts.
pub async fn get_workflow(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let metadata = hub.broker.get_workflow_metadata(&WorkflowId::new(id)).await?;
    Ok(Json(metadata))
}

pub async fn update_workflow_status(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
    Json(request): Json<WorkflowStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = hub
        .broker
        .update_workflow_status(&WorkflowId::new(id), request.status)
        .await?;
    Ok(Json(workflow))
}
