//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, Json};

use crate::hub::Hub;

/// Health check endpoint.
pub async fn health_check(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "store": hub.broker.store_name() }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&hub).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
