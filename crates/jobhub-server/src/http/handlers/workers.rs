//! Worker handlers.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::http::error::ApiError;
use crate::http::responses::{NextJobRequest, NextJobResponse, WorkersResponse};
use crate::hub::Hub;

/// Match request: claim the best pending job the worker can run.
pub async fn next_job(
    State(hub): State<Arc<Hub>>,
    Json(request): Json<NextJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let max_scan = request.max_scan.unwrap_or(hub.broker.config().max_scan);
    let job = hub
        .broker
        .get_next_job_with_scan(&request.capabilities, max_scan)
        .await?;

    Ok(Json(NextJobResponse {
        job_id: job.as_ref().map(|j| j.id.to_string()),
        job,
    }))
}

pub async fn list_workers(State(hub): State<Arc<Hub>>) -> Result<impl IntoResponse, ApiError> {
    let statistics = hub.broker.worker_statistics().await?;
    let workers = hub.broker.list_workers().await?;
    Ok(Json(WorkersResponse {
        statistics,
        workers,
    }))
}
