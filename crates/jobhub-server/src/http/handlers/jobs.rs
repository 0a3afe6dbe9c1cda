//! Job and queue handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::warn;

use jobhub_core::{JobId, JobSubmission, WorkerId};

use crate::http::error::ApiError;
use crate::http::responses::{ClaimRequest, ClaimResponse, PositionResponse, QueueQuery, QueueResponse};
use crate::hub::Hub;

const DEFAULT_QUEUE_LIMIT: usize = 20;

/// Submit a job.
pub async fn submit_job(
    State(hub): State<Arc<Hub>>,
    Json(submission): Json<JobSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    let job = hub.broker.submit_job(submission).await?;
    dispatch(&hub).await;
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn get_job(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = hub.broker.get_job(&JobId::new(id)).await?;
    Ok(Json(job))
}

pub async fn get_position(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = JobId::new(id);
    // Unknown ids are a 404 rather than "not queued"
    hub.broker.get_job(&job_id).await?;
    let position = hub.broker.get_queue_position(&job_id).await?;
    Ok(Json(PositionResponse {
        job_id: job_id.into_inner(),
        position,
    }))
}

pub async fn get_events(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = JobId::new(id);
    hub.broker.get_job(&job_id).await?;
    let events = hub.broker.job_events(&job_id).await?;
    Ok(Json(events))
}

/// Claim a specific pending job for a worker.
pub async fn claim_job(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.worker_id.is_empty() {
        return Err(ApiError::bad_request("worker_id must not be empty"));
    }
    let job = hub
        .broker
        .claim_job(&JobId::new(id), &WorkerId::new(request.worker_id))
        .await?;
    Ok(Json(ClaimResponse {
        claimed: job.is_some(),
        job,
    }))
}

/// Return an assigned or active job to the queue.
pub async fn release_job(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = hub.broker.release_job(&JobId::new(id)).await?;
    dispatch(&hub).await;
    Ok(Json(job))
}

pub async fn cancel_job(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = hub.broker.cancel_job(&JobId::new(id)).await?;
    Ok(Json(job))
}

/// Queue depth, job statistics and the head of the queue.
pub async fn get_queue(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<QueueQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let statistics = hub.broker.job_statistics().await?;
    let pending = hub
        .broker
        .pending_jobs(query.limit.unwrap_or(DEFAULT_QUEUE_LIMIT))
        .await?;
    Ok(Json(QueueResponse {
        depth: statistics.queue_depth,
        statistics,
        pending,
    }))
}

/// Push work to connected workers. Failures here do not fail the request.
async fn dispatch(hub: &Hub) {
    if let Err(e) = hub.dispatch_pending().await {
        warn!(error = %e, "Dispatch after HTTP request failed");
    }
}
