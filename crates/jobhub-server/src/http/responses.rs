//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use jobhub_broker::{JobStatistics, WorkerStatistics};
use jobhub_core::{Job, WorkerCapabilities, WorkerRecord, WorkflowStatus};
use jobhub_router::{ChannelStatistics, MessageStatistics, RoutingStatistics};

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Job types
// ============================================================================

/// Request body for an explicit claim.
#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

/// Response for a claim. `job` is null when the race was lost.
#[derive(Debug, Serialize)]
pub struct ClaimResponse {
    pub claimed: bool,
    pub job: Option<Job>,
}

/// Queue position of a job; `position` is 1-based and null when the job is
/// not pending.
#[derive(Debug, Serialize)]
pub struct PositionResponse {
    pub job_id: String,
    pub position: Option<usize>,
}

/// Query for the queue endpoint.
#[derive(Debug, Deserialize)]
pub struct QueueQuery {
    /// How many of the top pending jobs to include.
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub depth: usize,
    pub statistics: JobStatistics,
    pub pending: Vec<Job>,
}

// ============================================================================
// Worker types
// ============================================================================

/// Match request: a capability document and an optional scan bound.
#[derive(Debug, Deserialize)]
pub struct NextJobRequest {
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub max_scan: Option<usize>,
}

/// Match response. Both fields are null when nothing matched.
#[derive(Debug, Serialize, Deserialize)]
pub struct NextJobResponse {
    pub job_id: Option<String>,
    pub job: Option<Job>,
}

#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub statistics: WorkerStatistics,
    pub workers: Vec<WorkerRecord>,
}

// ============================================================================
// Workflow types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct CreateWorkflowRequest {
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub customer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WorkflowStatusRequest {
    pub status: WorkflowStatus,
}

// ============================================================================
// Message and routing types
// ============================================================================

/// Sender of an inbound message posted over HTTP.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    /// `worker` or `client`.
    pub source: String,
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

#[derive(Debug, Serialize)]
pub struct RoutingStatsResponse {
    pub routing: RoutingStatistics,
    pub channels: Vec<ChannelStatistics>,
    pub messages: MessageStatistics,
}

#[derive(Debug, Serialize)]
pub struct ReprocessResponse {
    pub id: String,
    /// False when delivery failed again and the entry was kept.
    pub delivered: bool,
}

#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub cleared: usize,
}
