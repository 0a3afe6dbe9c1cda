//! Job requirement documents.
//!
//! A requirement document is the JSON object a submitter attaches to a job.
//! Known sections (`service`, `hardware`, `models`, `customer_isolation`) get
//! dedicated matching rules; every other key is an extension compared
//! structurally by [`CapabilityValue`].

use serde_json::{Map, Value};

use crate::{CapabilityValue, Capacity, CoreError, IsolationLevel};

/// Sentinel meaning "no constraint".
pub const ALL: &str = "all";

/// A numeric hardware floor, or the `"all"` sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Floor {
    All,
    AtLeast(f64),
}

impl Floor {
    /// Check a declared worker value against this floor. An undeclared
    /// value meets no numeric floor; a declared `"all"` meets every floor.
    pub fn admits(&self, declared: Option<Capacity>) -> bool {
        match (self, declared) {
            (Floor::All, _) => true,
            (Floor::AtLeast(_), Some(Capacity::All)) => true,
            (Floor::AtLeast(min), Some(Capacity::Amount(v))) => v >= *min,
            (Floor::AtLeast(_), None) => false,
        }
    }
}

/// Required models for the job's service type.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelRequirement {
    All,
    Models(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareRequirements {
    pub gpu_memory_gb: Option<Floor>,
    pub cpu_cores: Option<Floor>,
    pub ram_gb: Option<Floor>,
}

/// Parsed requirement document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobRequirements {
    pub service: Option<String>,
    pub hardware: HardwareRequirements,
    pub models: Option<ModelRequirement>,
    pub customer_isolation: Option<IsolationLevel>,
    /// Customer id carried inside the document, used when the job has none.
    pub customer_id: Option<String>,
    /// Remaining keys, each a dot-path into the capability document.
    pub extensions: Vec<(String, CapabilityValue)>,
}

impl JobRequirements {
    /// Parse a requirement document.
    ///
    /// `null` is the empty requirement set. A non-object document is
    /// [`CoreError::InvalidInput`]; an object whose known sections have the
    /// wrong shape is [`CoreError::MalformedRequirements`].
    pub fn parse(doc: &Value) -> Result<Self, CoreError> {
        let map = match doc {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => {
                return Err(CoreError::InvalidInput(format!(
                    "requirements must be a JSON object, got {}",
                    json_kind(other)
                )))
            }
        };

        let mut req = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "service" | "service_type" => {
                    req.service = Some(expect_str(key, value)?.to_string());
                }
                "hardware" => parse_hardware(value, &mut req)?,
                "models" => req.models = Some(parse_models(value)?),
                "customer_isolation" => {
                    req.customer_isolation = Some(parse_isolation(value)?);
                }
                "customer_id" => {
                    req.customer_id = Some(expect_str(key, value)?.to_string());
                }
                _ => req
                    .extensions
                    .push((key.clone(), CapabilityValue::from(value))),
            }
        }
        Ok(req)
    }

    /// Returns true if nothing is required.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn parse_hardware(value: &Value, req: &mut JobRequirements) -> Result<(), CoreError> {
    let map: &Map<String, Value> = value
        .as_object()
        .ok_or_else(|| malformed("hardware must be an object"))?;

    for (key, value) in map {
        match key.as_str() {
            "gpu_memory_gb" => req.hardware.gpu_memory_gb = Some(parse_floor(key, value)?),
            "cpu_cores" => req.hardware.cpu_cores = Some(parse_floor(key, value)?),
            "ram_gb" => req.hardware.ram_gb = Some(parse_floor(key, value)?),
            // Other hardware keys are compared like any extension.
            _ => req.extensions.push((
                format!("hardware.{key}"),
                CapabilityValue::from(value),
            )),
        }
    }
    Ok(())
}

fn parse_floor(key: &str, value: &Value) -> Result<Floor, CoreError> {
    match value {
        Value::String(s) if s == ALL => Ok(Floor::All),
        Value::Number(n) => n
            .as_f64()
            .map(Floor::AtLeast)
            .ok_or_else(|| malformed(format!("hardware.{key} is not a finite number"))),
        other => Err(malformed(format!(
            "hardware.{key} must be a number or \"all\", got {}",
            json_kind(other)
        ))),
    }
}

fn parse_models(value: &Value) -> Result<ModelRequirement, CoreError> {
    match value {
        Value::String(s) if s == ALL => Ok(ModelRequirement::All),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("models must contain only strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ModelRequirement::Models),
        other => Err(malformed(format!(
            "models must be an array or \"all\", got {}",
            json_kind(other)
        ))),
    }
}

fn parse_isolation(value: &Value) -> Result<IsolationLevel, CoreError> {
    match value.as_str() {
        Some("strict") => Ok(IsolationLevel::Strict),
        Some("loose") => Ok(IsolationLevel::Loose),
        Some("none") => Ok(IsolationLevel::None),
        _ => Err(malformed(format!(
            "customer_isolation must be one of strict, loose, none; got {value}"
        ))),
    }
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, CoreError> {
    value
        .as_str()
        .ok_or_else(|| malformed(format!("{key} must be a string")))
}

fn malformed(msg: impl Into<String>) -> CoreError {
    CoreError::MalformedRequirements(msg.into())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
