//! HTTP API for the hub.
//!
//! Provides endpoints for:
//! - Jobs and the queue (`/v1/jobs`, `/v1/queue`)
//! - Worker match requests and the worker list (`/v1/workers`)
//! - Workflows (`/v1/workflows`)
//! - Wire message ingress and SSE connections (`/v1/messages`, `/v1/connections`)
//! - Lifecycle event stream (`/v1/events`)
//! - Routing statistics and dead letters (`/v1/routing`, `/v1/dead-letters`)
//! - Health check (`/health`) and Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::Hub;

pub mod error;
mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Jobs
        .route("/v1/jobs", post(handlers::submit_job))
        .route("/v1/jobs/:id", get(handlers::get_job))
        .route("/v1/jobs/:id/position", get(handlers::get_position))
        .route("/v1/jobs/:id/events", get(handlers::get_events))
        .route("/v1/jobs/:id/claim", post(handlers::claim_job))
        .route("/v1/jobs/:id/release", post(handlers::release_job))
        .route("/v1/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/v1/queue", get(handlers::get_queue))
        // Workers
        .route("/v1/workers", get(handlers::list_workers))
        .route("/v1/workers/next", post(handlers::next_job))
        // Workflows
        .route("/v1/workflows", post(handlers::create_workflow))
        .route("/v1/workflows/:id", get(handlers::get_workflow))
        .route("/v1/workflows/:id/status", put(handlers::update_workflow_status))
        // Messaging
        .route("/v1/messages", post(handlers::post_message))
        .route("/v1/connections/:kind/:id", get(handlers::connection_stream))
        .route("/v1/events", get(handlers::events_stream))
        // Routing
        .route("/v1/routing/stats", get(handlers::routing_stats))
        .route(
            "/v1/dead-letters",
            get(handlers::list_dead_letters).delete(handlers::clear_dead_letters),
        )
        .route("/v1/dead-letters/:id/reprocess", post(handlers::reprocess_dead_letter))
        // Observability
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(hub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use jobhub_broker::{BrokerConfig, JobBroker, MemoryStore};
    use jobhub_router::RouterConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> (Arc<Hub>, Router) {
        let broker = Arc::new(JobBroker::new(
            Arc::new(MemoryStore::new()),
            BrokerConfig::default(),
        ));
        let hub = Hub::new(broker, RouterConfig::default(), 16).await.unwrap();
        (hub.clone(), create_router(hub))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_hub, app) = app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "memory");
    }

    #[tokio::test]
    async fn test_submit_match_and_position() {
        let (_hub, app) = app().await;

        let (status, first) = send(
            &app,
            "POST",
            "/v1/jobs",
            Some(json!({"requirements": {"service": "image"}, "priority": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (_, second) = send(
            &app,
            "POST",
            "/v1/jobs",
            Some(json!({"requirements": {"service": "image"}, "priority": 1})),
        )
        .await;
        let first_id = first["id"].as_str().unwrap().to_string();
        let second_id = second["id"].as_str().unwrap().to_string();

        let (_, position) = send(&app, "GET", &format!("/v1/jobs/{second_id}/position"), None).await;
        assert_eq!(position["position"], 2);

        let (status, matched) = send(
            &app,
            "POST",
            "/v1/workers/next",
            Some(json!({"capabilities": {"worker_id": "w1", "services": ["image"]}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(matched["job_id"], first_id.as_str());
        assert_eq!(matched["job"]["status"], "assigned");

        let (_, position) = send(&app, "GET", &format!("/v1/jobs/{first_id}/position"), None).await;
        assert_eq!(position["position"], Value::Null);

        let (_, queue) = send(&app, "GET", "/v1/queue", None).await;
        assert_eq!(queue["depth"], 1);
        assert_eq!(queue["pending"][0]["id"], second_id.as_str());
    }

    #[tokio::test]
    async fn test_no_match_is_explicit() {
        let (_hub, app) = app().await;
        send(&app, "POST", "/v1/jobs", Some(json!({"requirements": {"service": "audio"}}))).await;

        let (status, matched) = send(
            &app,
            "POST",
            "/v1/workers/next",
            Some(json!({"capabilities": {"worker_id": "w1", "services": ["image"]}, "max_scan": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(matched["job_id"], Value::Null);
        assert_eq!(matched["job"], Value::Null);
    }

    #[tokio::test]
    async fn test_error_status_codes() {
        let (_hub, app) = app().await;

        let (status, body) = send(&app, "GET", "/v1/jobs/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("missing"));

        let (status, _) = send(&app, "POST", "/v1/jobs", Some(json!({"requirements": {}, "priority": 500}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, job) = send(&app, "POST", "/v1/jobs", Some(json!({"requirements": {}}))).await;
        let id = job["id"].as_str().unwrap();
        let (status, _) = send(&app, "POST", &format!("/v1/jobs/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "POST", &format!("/v1/jobs/{id}/release"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_claim_and_release() {
        let (_hub, app) = app().await;
        let (_, job) = send(&app, "POST", "/v1/jobs", Some(json!({"requirements": {}}))).await;
        let id = job["id"].as_str().unwrap();

        let (_, claim) = send(
            &app,
            "POST",
            &format!("/v1/jobs/{id}/claim"),
            Some(json!({"worker_id": "w1"})),
        )
        .await;
        assert_eq!(claim["claimed"], true);

        let (_, again) = send(
            &app,
            "POST",
            &format!("/v1/jobs/{id}/claim"),
            Some(json!({"worker_id": "w2"})),
        )
        .await;
        assert_eq!(again["claimed"], false);

        let (status, released) = send(&app, "POST", &format!("/v1/jobs/{id}/release"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(released["status"], "pending");

        let (_, events) = send(&app, "GET", &format!("/v1/jobs/{id}/events"), None).await;
        let kinds: Vec<&str> = events
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["submitted", "assigned", "released"]);
    }

    #[tokio::test]
    async fn test_workflow_endpoints() {
        let (_hub, app) = app().await;
        let (status, workflow) = send(&app, "POST", "/v1/workflows", Some(json!({"priority": 7}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = workflow["id"].as_str().unwrap();

        send(
            &app,
            "POST",
            "/v1/jobs",
            Some(json!({"requirements": {}, "workflow_id": id})),
        )
        .await;

        let (_, metadata) = send(&app, "GET", &format!("/v1/workflows/{id}"), None).await;
        assert_eq!(metadata["job_count"], 1);
        assert_eq!(metadata["priority"], 7);

        let (status, updated) = send(
            &app,
            "PUT",
            &format!("/v1/workflows/{id}/status"),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["status"], "completed");

        let (status, _) = send(
            &app,
            "POST",
            "/v1/jobs",
            Some(json!({"requirements": {}, "workflow_id": id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_message_and_dead_letters() {
        let (hub, app) = app().await;

        // A malformed envelope is rejected and counted
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages?source=client&id=c1")
                    .body(Body::from(r#"{"type":"submit_job""#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hub.handler.statistics().await.failed, 1);

        // A valid submission is accepted; the ack to the unconnected client
        // is dead-lettered
        let raw = r#"{"type":"submit_job","payload":{"requirements":{}},"sourceKind":"client","sourceId":"c1","timestamp":1700000000000}"#;
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages?source=client&id=c1")
                    .body(Body::from(raw))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(hub.broker.get_queue_depth().await.unwrap(), 1);

        let (_, letters) = send(&app, "GET", "/v1/dead-letters", None).await;
        let letters = letters.as_array().unwrap().clone();
        assert_eq!(letters.len(), 1);
        let id = letters[0]["id"].as_str().unwrap();

        // Still not connected: reprocess keeps the entry
        let (status, outcome) = send(&app, "POST", &format!("/v1/dead-letters/{id}/reprocess"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["delivered"], false);

        let (_, cleared) = send(&app, "DELETE", "/v1/dead-letters", None).await;
        assert_eq!(cleared["cleared"], 1);

        let (status, _) = send(&app, "POST", &format!("/v1/dead-letters/{id}/reprocess"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, stats) = send(&app, "GET", "/v1/routing/stats", None).await;
        assert_eq!(stats["messages"]["processed"], 1);
        assert!(stats["routing"]["dead_lettered"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (_hub, app) = app().await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("jobhub_jobs{status=\"pending\"} 0"));
    }
}
