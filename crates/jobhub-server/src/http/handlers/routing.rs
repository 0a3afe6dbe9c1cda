//! Routing statistics and dead-letter handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use tracing::info;

use crate::http::error::ApiError;
use crate::http::responses::{ClearedResponse, ReprocessResponse, RoutingStatsResponse};
use crate::hub::Hub;

pub async fn routing_stats(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(RoutingStatsResponse {
        routing: hub.router.statistics().await,
        channels: hub.router.channel_statistics().await,
        messages: hub.handler.statistics().await,
    })
}

pub async fn list_dead_letters(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(hub.router.dead_letters().await)
}

/// Send a dead letter back through routing. Reprocessing an id that is gone
/// (already delivered, or cleared) is a 404.
pub async fn reprocess_dead_letter(
    State(hub): State<Arc<Hub>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let delivered = hub.router.reprocess_dead_letter(&id).await?;
    info!(dead_letter_id = %id, delivered, "Dead letter reprocess requested");
    Ok(Json(ReprocessResponse { id, delivered }))
}

pub async fn clear_dead_letters(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(ClearedResponse {
        cleared: hub.router.clear_dead_letters().await,
    })
}
