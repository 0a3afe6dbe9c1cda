//! Worker capability documents and worker records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::requirements::ALL;
use crate::{JobId, WorkerId, WorkerStatus};

/// Customer isolation level, declared by workers and required by jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Dedicated to a single customer at a time.
    Strict,
    /// Shared, but with per-customer cleanup.
    Loose,
    /// No isolation guarantees.
    #[default]
    None,
}

/// A declared hardware amount. `"all"` on the wire means unbounded and
/// satisfies any floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Capacity {
    All,
    Amount(f64),
}

impl Serialize for Capacity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Capacity::All => serializer.serialize_str(ALL),
            Capacity::Amount(v) => serializer.serialize_f64(*v),
        }
    }
}

impl<'de> Deserialize<'de> for Capacity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) if s == ALL => Ok(Capacity::All),
            Value::Number(n) => n
                .as_f64()
                .map(Capacity::Amount)
                .ok_or_else(|| D::Error::custom("hardware amount is not a finite number")),
            other => Err(D::Error::custom(format!(
                "expected a number or \"{ALL}\", got {other}"
            ))),
        }
    }
}

/// Hardware declared by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_gb: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<Capacity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_gb: Option<Capacity>,

    /// Further hardware keys (e.g. `vram_type`), matched structurally.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which customers a worker may serve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerAccess {
    #[serde(default)]
    pub isolation: IsolationLevel,

    /// When present, only these customers may be served.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_customers: Option<Vec<String>>,

    /// Customers this worker must never serve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denied_customers: Vec<String>,
}

impl CustomerAccess {
    /// Check whether a job owned by `customer_id` may run here.
    pub fn permits(&self, customer_id: &str) -> bool {
        if self.denied_customers.iter().any(|c| c == customer_id) {
            return false;
        }
        match &self.allowed_customers {
            Some(allowed) => allowed.iter().any(|c| c == customer_id),
            None => true,
        }
    }
}

/// Capability document supplied by a worker with every match request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub worker_id: WorkerId,

    /// Service types this worker can run.
    #[serde(default)]
    pub services: Vec<String>,

    #[serde(default)]
    pub hardware: HardwareProfile,

    /// Installed models keyed by service type.
    #[serde(default)]
    pub models: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub customer_access: CustomerAccess,

    /// Any further capability keys, reachable by dot-path.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

impl WorkerCapabilities {
    /// Create an empty capability document.
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            services: Vec::new(),
            hardware: HardwareProfile::default(),
            models: BTreeMap::new(),
            customer_access: CustomerAccess::default(),
            extensions: Map::new(),
        }
    }

    /// Builder method to add a service type.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    /// Builder method to set GPU memory.
    pub fn with_gpu_memory_gb(mut self, gb: f64) -> Self {
        self.hardware.gpu_memory_gb = Some(Capacity::Amount(gb));
        self
    }

    /// Builder method to set the model inventory for a service.
    pub fn with_models(mut self, service: impl Into<String>, models: &[&str]) -> Self {
        self.models.insert(
            service.into(),
            models.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    /// Builder method to add an extension capability.
    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Check if this worker declares a service type.
    pub fn supports_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }

    /// Models installed for a service type.
    pub fn models_for(&self, service: &str) -> &[String] {
        self.models.get(service).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check whether any inventory contains the model.
    pub fn has_model_anywhere(&self, model: &str) -> bool {
        self.models.values().any(|models| models.iter().any(|m| m == model))
    }

    /// The full document as JSON, for dot-path lookups.
    pub fn to_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Canonical per-worker record held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub status: WorkerStatus,

    /// Most recently assigned job.
    pub current_job_id: Option<JobId>,

    pub last_status_change: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,

    /// Last capability document the worker registered or matched with.
    pub capabilities: Option<WorkerCapabilities>,
}

impl WorkerRecord {
    /// Create an idle worker record.
    pub fn new(worker_id: WorkerId) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_job_id: None,
            last_status_change: now,
            last_heartbeat: now,
            capabilities: None,
        }
    }

    /// Change status, stamping the transition time when it differs.
    pub fn set_status(&mut self, status: WorkerStatus) {
        if self.status != status {
            self.status = status;
            self.last_status_change = Utc::now();
        }
    }
}
