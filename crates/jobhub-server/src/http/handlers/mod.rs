//! HTTP request handlers.

mod health;
mod jobs;
mod messages;
mod routing;
mod workers;
mod workflows;

pub use health::{health_check, metrics_handler};
pub use jobs::{cancel_job, claim_job, get_events, get_job, get_position, get_queue, release_job, submit_job};
pub use messages::{connection_stream, events_stream, post_message};
pub use routing::{clear_dead_letters, list_dead_letters, reprocess_dead_letter, routing_stats};
pub use workers::{list_workers, next_job};
pub use workflows::{create_workflow, get_workflow, update_workflow_status};
