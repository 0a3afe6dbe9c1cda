//! Redis-backed store.
//!
//! # Keys
//!
//! - `{prefix}:jobs:pending` (ZSET): pending job ids, higher score served first
//! - `{prefix}:jobs:claiming` (ZSET): claim markers, scored by the removal
//!   time in milliseconds
//! - `{prefix}:jobs:all` (SET): every job id
//! - `{prefix}:job:{id}` (HASH): status, worker_id, assigned_at, requirements,
//!   priority, workflow_id and the full record under `data`
//! - `{prefix}:job:{id}:events` (STREAM): lifecycle events
//! - `{prefix}:workflow:{id}` (HASH): status and the full record under
//!   `data`; its `job_ids` are stale once written
//! - `{prefix}:workflow:{id}:jobs` (LIST): member job ids in submission order
//! - `{prefix}:workers:all` (SET): every worker id
//! - `{prefix}:worker:{id}` (HASH): status, current_job_id,
//!   last_status_change and the full record under `data`
//! - `{prefix}:worker:{id}:jobs` (SET): jobs held by the worker
//!
//! Conditional removal is a `ZREM` whose integer reply tells the caller
//! whether it won; the same script stamps the claim marker. Every other
//! check-then-write runs as a Lua script.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::StreamRangeReply;
use redis::Script;
use tracing::{info, warn};

use jobhub_core::{
    Job, JobEvent, JobId, JobStatus, QueueScore, WorkerId, WorkerRecord, Workflow, WorkflowId,
    WorkflowStatus,
};

use super::{JobStore, StoreError, StoreResult, WorkflowAppend};

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "jobhub";

/// Write the job hash and re-add it to the pending index in one round trip.
const REQUEUE_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'worker_id', '', 'assigned_at', '', 'data', ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
return 1
"#;

/// Remove from the pending index and stamp the claim marker.
const CLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

/// Write the claimed job only while its marker is still there.
const COMMIT_CLAIM_SCRIPT: &str = r#"
if redis.call('ZREM', KEYS[2], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'worker_id', ARGV[3], 'assigned_at', ARGV[4], 'data', ARGV[5])
return 1
"#;

/// Re-add a pending job that fell out of the index and whose claim, if any,
/// started at or before ARGV[4].
const RECOVER_SCRIPT: &str = r#"
if redis.call('ZSCORE', KEYS[2], ARGV[1]) then
  return 0
end
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[2] then
  return 0
end
local claimed = redis.call('ZSCORE', KEYS[3], ARGV[1])
if claimed and tonumber(claimed) > tonumber(ARGV[4]) then
  return 0
end
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Append a member while the workflow is active. Replies with the stored
/// status, or an empty string for a missing workflow.
const APPEND_MEMBER_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
  return ''
end
if status == ARGV[2] then
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return status
"#;

const SWAP_STATUS_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'data', ARGV[3])
return 1
"#;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Store backed by a Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to `redis_url` using the default key prefix.
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(redis_url: &str, prefix: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %redis_url, prefix = %prefix, "Connected to Redis store");
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn pending_key(&self) -> String {
        format!("{}:jobs:pending", self.prefix)
    }

    fn claiming_key(&self) -> String {
        format!("{}:jobs:claiming", self.prefix)
    }

    fn all_jobs_key(&self) -> String {
        format!("{}:jobs:all", self.prefix)
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn events_key(&self, id: &JobId) -> String {
        format!("{}:job:{}:events", self.prefix, id)
    }

    fn workflow_key(&self, id: &WorkflowId) -> String {
        format!("{}:workflow:{}", self.prefix, id)
    }

    fn workflow_jobs_key(&self, id: &WorkflowId) -> String {
        format!("{}:workflow:{}:jobs", self.prefix, id)
    }

    fn all_workers_key(&self) -> String {
        format!("{}:workers:all", self.prefix)
    }

    fn worker_key(&self, id: &WorkerId) -> String {
        format!("{}:worker:{}", self.prefix, id)
    }

    fn worker_jobs_key(&self, id: &WorkerId) -> String {
        format!("{}:worker:{}:jobs", self.prefix, id)
    }

    async fn get_data<T: serde::de::DeserializeOwned>(&self, key: String) -> StoreResult<Option<T>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = redis::cmd("HGET")
            .arg(&key)
            .arg("data")
            .query_async(&mut conn)
            .await?;
        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn members(&self, key: String) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await?;
        Ok(members)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put_job(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(job)?;
        let requirements = serde_json::to_string(&job.requirements)?;
        let worker_id = job.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("");
        let assigned_at = job.assigned_at.map(|t| t.to_rfc3339()).unwrap_or_default();

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.job_key(&job.id))
            .arg("status")
            .arg(job.status.as_str())
            .arg("worker_id")
            .arg(worker_id)
            .arg("assigned_at")
            .arg(assigned_at)
            .arg("requirements")
            .arg(requirements)
            .arg("priority")
            .arg(job.priority)
            .arg("workflow_id")
            .arg(job.workflow_id.as_str())
            .arg("data")
            .arg(data)
            .ignore()
            .cmd("SADD")
            .arg(self.all_jobs_key())
            .arg(job.id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> StoreResult<Option<Job>> {
        self.get_data(self.job_key(id)).await
    }

    async fn list_jobs(&self) -> StoreResult<Vec<Job>> {
        let mut jobs = Vec::new();
        for id in self.members(self.all_jobs_key()).await? {
            match self.get_job(&JobId::new(id.clone())).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job record"),
            }
        }
        Ok(jobs)
    }

    async fn put_workflow(&self, workflow: &Workflow) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(workflow)?;
        let members_key = self.workflow_jobs_key(&workflow.id);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.workflow_key(&workflow.id))
            .arg("status")
            .arg(workflow.status.as_str())
            .arg("priority")
            .arg(workflow.priority)
            .arg("data")
            .arg(data)
            .ignore()
            .cmd("DEL")
            .arg(&members_key)
            .ignore();
        if !workflow.job_ids.is_empty() {
            pipe.cmd("RPUSH")
                .arg(&members_key)
                .arg(workflow.job_ids.iter().map(|id| id.as_str()).collect::<Vec<_>>())
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &WorkflowId) -> StoreResult<Option<Workflow>> {
        let Some(mut workflow): Option<Workflow> = self.get_data(self.workflow_key(id)).await? else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("LRANGE")
            .arg(self.workflow_jobs_key(id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        workflow.job_ids = members.into_iter().map(JobId::new).collect();
        Ok(Some(workflow))
    }

    async fn add_workflow_job(
        &self,
        id: &WorkflowId,
        job_id: &JobId,
    ) -> StoreResult<WorkflowAppend> {
        let mut conn = self.conn.clone();
        let status: String = Script::new(APPEND_MEMBER_SCRIPT)
            .key(self.workflow_key(id))
            .key(self.workflow_jobs_key(id))
            .arg(job_id.as_str())
            .arg(WorkflowStatus::Active.as_str())
            .invoke_async(&mut conn)
            .await?;

        if status.is_empty() {
            return Ok(WorkflowAppend::Missing);
        }
        let status: WorkflowStatus = status
            .parse()
            .map_err(|e: jobhub_core::CoreError| StoreError::Serialization(e.to_string()))?;
        if status.is_terminal() {
            return Ok(WorkflowAppend::Closed(status));
        }
        Ok(WorkflowAppend::Added)
    }

    async fn set_workflow_status(
        &self,
        workflow: &Workflow,
        from: WorkflowStatus,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(workflow)?;
        let swapped: i64 = Script::new(SWAP_STATUS_SCRIPT)
            .key(self.workflow_key(&workflow.id))
            .arg(from.as_str())
            .arg(workflow.status.as_str())
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn enqueue(&self, id: &JobId, score: QueueScore) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("ZADD")
            .arg(self.pending_key())
            .arg(score.as_sorted_set_score())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn top_pending(&self, n: usize) -> StoreResult<Vec<JobId>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.pending_key())
            .arg(0)
            .arg(n as isize - 1)
            .query_async(&mut conn)
            .await?;
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    async fn remove_pending(&self, id: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(CLAIM_SCRIPT)
            .key(self.pending_key())
            .key(self.claiming_key())
            .arg(id.as_str())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn commit_claim(&self, job: &Job) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(job)?;
        let worker_id = job.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("");
        let assigned_at = job.assigned_at.map(|t| t.to_rfc3339()).unwrap_or_default();

        let committed: i64 = Script::new(COMMIT_CLAIM_SCRIPT)
            .key(self.job_key(&job.id))
            .key(self.claiming_key())
            .arg(job.id.as_str())
            .arg(job.status.as_str())
            .arg(worker_id)
            .arg(assigned_at)
            .arg(data)
            .invoke_async(&mut conn)
            .await?;
        Ok(committed == 1)
    }

    async fn recover_orphan(
        &self,
        job: &Job,
        claimed_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let recovered: i64 = Script::new(RECOVER_SCRIPT)
            .key(self.job_key(&job.id))
            .key(self.pending_key())
            .key(self.claiming_key())
            .arg(job.id.as_str())
            .arg(JobStatus::Pending.as_str())
            .arg(job.score.as_sorted_set_score())
            .arg(claimed_before.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(recovered == 1)
    }

    async fn pending_rank(&self, id: &JobId) -> StoreResult<Option<usize>> {
        let mut conn = self.conn.clone();
        let rank: Option<i64> = redis::cmd("ZREVRANK")
            .arg(self.pending_key())
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(rank.map(|r| r as usize))
    }

    async fn pending_count(&self) -> StoreResult<usize> {
        let mut conn = self.conn.clone();
        let count: i64 = redis::cmd("ZCARD")
            .arg(self.pending_key())
            .query_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn requeue(&self, job: &Job) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(job)?;
        let _: i64 = Script::new(REQUEUE_SCRIPT)
            .key(self.job_key(&job.id))
            .key(self.pending_key())
            .arg(job.status.as_str())
            .arg(data)
            .arg(job.score.as_sorted_set_score())
            .arg(job.id.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn put_worker(&self, worker: &WorkerRecord) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(worker)?;
        let current_job = worker
            .current_job_id
            .as_ref()
            .map(|j| j.as_str())
            .unwrap_or("");

        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(self.worker_key(&worker.worker_id))
            .arg("status")
            .arg(worker.status.as_str())
            .arg("current_job_id")
            .arg(current_job)
            .arg("last_status_change")
            .arg(worker.last_status_change.to_rfc3339())
            .arg("data")
            .arg(data)
            .ignore()
            .cmd("SADD")
            .arg(self.all_workers_key())
            .arg(worker.worker_id.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_worker(&self, id: &WorkerId) -> StoreResult<Option<WorkerRecord>> {
        self.get_data(self.worker_key(id)).await
    }

    async fn list_workers(&self) -> StoreResult<Vec<WorkerRecord>> {
        let mut workers = Vec::new();
        for id in self.members(self.all_workers_key()).await? {
            if let Some(worker) = self.get_worker(&WorkerId::new(id)).await? {
                workers.push(worker);
            }
        }
        Ok(workers)
    }

    async fn add_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SADD")
            .arg(self.worker_jobs_key(worker))
            .arg(job.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_active_job(&self, worker: &WorkerId, job: &JobId) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM")
            .arg(self.worker_jobs_key(worker))
            .arg(job.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn active_jobs(&self, worker: &WorkerId) -> StoreResult<Vec<JobId>> {
        let ids = self.members(self.worker_jobs_key(worker)).await?;
        Ok(ids.into_iter().map(JobId::new).collect())
    }

    async fn append_event(&self, event: &JobEvent) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(event)?;
        let _: String = redis::cmd("XADD")
            .arg(self.events_key(&event.job_id))
            .arg("*")
            .arg("event_type")
            .arg(event.event_type.as_str())
            .arg("data")
            .arg(data)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn job_events(&self, id: &JobId) -> StoreResult<Vec<JobEvent>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(self.events_key(id))
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        let mut events = Vec::with_capacity(reply.ids.len());
        for entry in reply.ids {
            let Some(raw) = entry.get::<String>("data") else {
                warn!(job_id = %id, entry = %entry.id, "Event entry without data");
                continue;
            };
            events.push(serde_json::from_str(&raw)?);
        }
        Ok(events)
    }
}
