//! Capability matching.
//!
//! A worker asks for work by presenting its capability document. The matcher
//! scans the best pending jobs in queue order, returns the first one whose
//! requirements the worker satisfies, and claims it through the queue's
//! conditional removal so that no job is ever handed out twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use jobhub_core::{
    lookup_path, IsolationLevel, Job, JobEvent, JobRequirements, JobStatus, ModelRequirement,
    WorkerCapabilities, WorkerId, WorkerRecord, WorkerStatus,
};

use crate::config::MalformedRequirementsPolicy;
use crate::events::EventPublisher;
use crate::queue::PriorityQueue;
use crate::store::{timed, JobStore};
use crate::BrokerError;

/// Check a worker against a job's parsed requirements.
///
/// Rules apply in order and the first failure rejects: service type,
/// hardware floors, customer isolation and access lists, required models,
/// then every remaining requirement key compared structurally against the
/// worker document at the same dot-path.
pub fn matches(
    worker: &WorkerCapabilities,
    worker_doc: &Value,
    job: &Job,
    requirements: &JobRequirements,
) -> bool {
    if let Some(service) = &requirements.service {
        if !worker.supports_service(service) {
            return false;
        }
    }

    let hw = &requirements.hardware;
    let declared = &worker.hardware;
    let floors = [
        (hw.gpu_memory_gb, declared.gpu_memory_gb),
        (hw.cpu_cores, declared.cpu_cores),
        (hw.ram_gb, declared.ram_gb),
    ];
    for (floor, value) in floors {
        if let Some(floor) = floor {
            if !floor.admits(value) {
                return false;
            }
        }
    }

    if requirements.customer_isolation == Some(IsolationLevel::Strict)
        && worker.customer_access.isolation != IsolationLevel::Strict
    {
        return false;
    }
    let customer = job
        .customer_id
        .as_deref()
        .or(requirements.customer_id.as_deref());
    if let Some(customer) = customer {
        if !worker.customer_access.permits(customer) {
            return false;
        }
    }

    if let Some(ModelRequirement::Models(models)) = &requirements.models {
        let satisfied = match &requirements.service {
            Some(service) => {
                let installed = worker.models_for(service);
                models.iter().all(|m| installed.contains(m))
            }
            None => models.iter().all(|m| worker.has_model_anywhere(m)),
        };
        if !satisfied {
            return false;
        }
    }

    requirements
        .extensions
        .iter()
        .all(|(path, required)| required.is_satisfied_by(lookup_path(worker_doc, path)))
}

/// Finds and claims jobs for workers.
#[derive(Clone)]
pub struct CapabilityMatcher {
    store: Arc<dyn JobStore>,
    queue: PriorityQueue,
    events: EventPublisher,
    policy: MalformedRequirementsPolicy,
    timeout: Duration,
}

impl CapabilityMatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: PriorityQueue,
        events: EventPublisher,
        policy: MalformedRequirementsPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            policy,
            timeout,
        }
    }

    /// Claim the best pending job this worker can run, scanning at most
    /// `max_scan` queue entries. Returns `Ok(None)` when nothing matches.
    pub async fn find_matching_job(
        &self,
        caps: &WorkerCapabilities,
        max_scan: usize,
    ) -> Result<Option<Job>, BrokerError> {
        let candidates = self.queue.top_n(max_scan).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let worker_doc = caps.to_document();
        for job_id in candidates {
            let job = match timed(self.timeout, self.store.get_job(&job_id)).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(job_id = %job_id, "Pending entry without a job record");
                    continue;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to read job, skipping");
                    continue;
                }
            };

            if job.status != JobStatus::Pending {
                debug!(job_id = %job_id, status = %job.status, "Skipping non-pending job");
                continue;
            }

            let Some(requirements) = self.requirements_for(&job) else {
                continue;
            };
            if !matches(caps, &worker_doc, &job, &requirements) {
                continue;
            }

            if !self.queue.remove(&job_id).await? {
                debug!(
                    job_id = %job_id,
                    worker_id = %caps.worker_id,
                    "Job claimed by another worker, continuing scan"
                );
                continue;
            }

            match self.finalize_claim(job, &caps.worker_id, Some(caps)).await? {
                Some(job) => return Ok(Some(job)),
                None => continue,
            }
        }

        Ok(None)
    }

    /// Record the assignment of a job whose pending entry the caller has
    /// already removed. Returns `None` when the claim went stale and the job
    /// was put back in the queue before it could be recorded.
    ///
    /// A failure here leaves the job out of the queue with no holder; it is
    /// logged and surfaced, and orphan recovery returns it to the queue.
    pub(crate) async fn finalize_claim(
        &self,
        mut job: Job,
        worker_id: &WorkerId,
        caps: Option<&WorkerCapabilities>,
    ) -> Result<Option<Job>, BrokerError> {
        job.assign(worker_id.clone());

        match self.record_assignment(&job, worker_id, caps).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %worker_id,
                    "Claim expired before it was recorded, job is back in the queue"
                );
                return Ok(None);
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    worker_id = %worker_id,
                    error = %e,
                    "Job claimed but assignment was not recorded"
                );
                return Err(BrokerError::AssignmentNotRecorded {
                    job_id: job.id,
                    reason: e.to_string(),
                });
            }
        }

        info!(
            job_id = %job.id,
            worker_id = %worker_id,
            priority = job.priority,
            "Assigned job to worker"
        );
        self.events
            .publish(JobEvent::assigned(job.id.clone(), worker_id.clone()))
            .await;

        Ok(Some(job))
    }

    async fn record_assignment(
        &self,
        job: &Job,
        worker_id: &WorkerId,
        caps: Option<&WorkerCapabilities>,
    ) -> Result<bool, BrokerError> {
        if !timed(self.timeout, self.store.commit_claim(job)).await? {
            return Ok(false);
        }
        timed(self.timeout, self.store.add_active_job(worker_id, &job.id)).await?;

        let mut worker = timed(self.timeout, self.store.get_worker(worker_id))
            .await?
            .unwrap_or_else(|| WorkerRecord::new(worker_id.clone()));
        worker.set_status(WorkerStatus::Busy);
        worker.current_job_id = Some(job.id.clone());
        worker.last_heartbeat = Utc::now();
        if let Some(caps) = caps {
            worker.capabilities = Some(caps.clone());
        }
        timed(self.timeout, self.store.put_worker(&worker)).await?;
        Ok(true)
    }

    fn requirements_for(&self, job: &Job) -> Option<JobRequirements> {
        match JobRequirements::parse(&job.requirements) {
            Ok(requirements) => Some(requirements),
            Err(e) => match self.policy {
                MalformedRequirementsPolicy::MatchAll => {
                    warn!(job_id = %job.id, error = %e, "Malformed requirements, matching any worker");
                    Some(JobRequirements::default())
                }
                MalformedRequirementsPolicy::Reject => {
                    warn!(job_id = %job.id, error = %e, "Malformed requirements, skipping job");
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhub_core::{Capacity, CustomerAccess, JobId, WorkflowId};
    use serde_json::json;

    fn job_with(requirements: Value) -> (Job, JobRequirements) {
        let parsed = JobRequirements::parse(&requirements).unwrap();
        let job = Job::new(JobId::new("j1"), WorkflowId::new("wf"), requirements, 5, 0);
        (job, parsed)
    }

    fn check(worker: &WorkerCapabilities, requirements: Value) -> bool {
        let (job, parsed) = job_with(requirements);
        matches(worker, &worker.to_document(), &job, &parsed)
    }

    fn image_worker() -> WorkerCapabilities {
        WorkerCapabilities::new(WorkerId::new("w1"))
            .with_service("image")
            .with_gpu_memory_gb(8.0)
            .with_models("image", &["a", "b"])
    }

    #[test]
    fn test_empty_requirements_match_anything() {
        assert!(check(&WorkerCapabilities::new(WorkerId::new("w")), json!({})));
        assert!(check(&image_worker(), Value::Null));
    }

    #[test]
    fn test_service_type() {
        let worker = image_worker();
        assert!(check(&worker, json!({"service": "image"})));
        assert!(!check(&worker, json!({"service": "audio"})));
    }

    #[test]
    fn test_hardware_floor() {
        let worker = image_worker();
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": 8}})));
        assert!(!check(&worker, json!({"hardware": {"gpu_memory_gb": 12}})));
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": "all"}})));
        // Undeclared hardware never satisfies a numeric floor
        assert!(!check(&worker, json!({"hardware": {"ram_gb": 1}})));
    }

    #[test]
    fn test_gpu_floor_admits_requirements_up_to_declared_memory() {
        let worker = image_worker();
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": 8}})));
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": 6}})));
        assert!(!check(&worker, json!({"hardware": {"gpu_memory_gb": 12}})));
    }

    #[test]
    fn test_unbounded_hardware_meets_any_floor() {
        let mut worker = image_worker();
        worker.hardware.gpu_memory_gb = Some(Capacity::All);
        worker.hardware.ram_gb = Some(Capacity::All);
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": 80, "ram_gb": 512}})));
        assert!(check(&worker, json!({"hardware": {"gpu_memory_gb": "all"}})));
        assert!(!check(&worker, json!({"hardware": {"cpu_cores": 4}})));

        let caps: WorkerCapabilities = serde_json::from_value(json!({
            "worker_id": "w9",
            "services": ["image"],
            "hardware": {"gpu_memory_gb": "all"}
        }))
        .unwrap();
        assert!(check(&caps, json!({"service": "image", "hardware": {"gpu_memory_gb": 48}})));
    }

    #[test]
    fn test_model_inventory_superset_matches() {
        let worker = WorkerCapabilities::new(WorkerId::new("w1"))
            .with_service("image")
            .with_models("image", &["a", "b", "c"]);
        assert!(check(&worker, json!({"service": "image", "models": ["a", "b"]})));
        assert!(!check(&worker, json!({"service": "image", "models": ["a", "d"]})));
    }

    #[test]
    fn test_models_must_be_a_subset_of_service_inventory() {
        let worker = image_worker();
        assert!(check(&worker, json!({"service": "image", "models": ["a"]})));
        assert!(check(&worker, json!({"service": "image", "models": ["a", "b"]})));
        assert!(!check(&worker, json!({"service": "image", "models": ["a", "c"]})));
        assert!(check(&worker, json!({"service": "image", "models": "all"})));
        // Without a service, any inventory will do
        assert!(check(&worker, json!({"models": ["b"]})));
        assert!(!check(&worker, json!({"models": ["z"]})));
    }

    #[test]
    fn test_strict_isolation() {
        let mut worker = image_worker();
        assert!(!check(&worker, json!({"customer_isolation": "strict"})));
        assert!(check(&worker, json!({"customer_isolation": "loose"})));

        worker.customer_access.isolation = IsolationLevel::Strict;
        assert!(check(&worker, json!({"customer_isolation": "strict"})));
    }

    #[test]
    fn test_customer_deny_and_allow_lists() {
        let mut worker = image_worker();
        worker.customer_access = CustomerAccess {
            isolation: IsolationLevel::Strict,
            allowed_customers: None,
            denied_customers: vec!["cust1".into()],
        };

        let (mut job, parsed) = job_with(json!({"service": "image"}));
        job.customer_id = Some("cust1".into());
        assert!(!matches(&worker, &worker.to_document(), &job, &parsed));

        job.customer_id = Some("cust2".into());
        assert!(matches(&worker, &worker.to_document(), &job, &parsed));

        worker.customer_access.allowed_customers = Some(vec!["cust3".into()]);
        assert!(!matches(&worker, &worker.to_document(), &job, &parsed));

        // Customer carried inside the requirement document
        assert!(!check(&worker, json!({"customer_id": "cust1"})));
    }

    #[test]
    fn test_extension_requirements() {
        let worker = image_worker()
            .with_extension("cuda", json!({"version": 12.2}))
            .with_extension("precisions", json!(["fp16", "int8"]))
            .with_extension("region", json!("eu"));

        assert!(check(&worker, json!({"cuda": {"version": 12}})));
        assert!(check(&worker, json!({"cuda.version": 12})));
        assert!(!check(&worker, json!({"cuda": {"version": 13}})));
        assert!(check(&worker, json!({"precisions": ["int8"]})));
        assert!(!check(&worker, json!({"precisions": ["fp8"]})));
        assert!(check(&worker, json!({"region": "eu"})));
        assert!(!check(&worker, json!({"region": "us"})));
        assert!(!check(&worker, json!({"tpu": true})));
    }

    #[test]
    fn test_hardware_extension_keys() {
        let mut worker = image_worker();
        worker.hardware.extra.insert("vram_type".into(), json!("hbm"));

        assert!(check(&worker, json!({"hardware": {"vram_type": "hbm"}})));
        assert!(!check(&worker, json!({"hardware": {"vram_type": "gddr"}})));
    }
}
