//! Structural comparison of requirement values against capability documents.
//!
//! Requirement keys that the matcher has no dedicated rule for are compared
//! generically: the required value is classified once into a
//! [`CapabilityValue`], then checked against whatever the worker declares at
//! the same dot-path. New capability dimensions need no broker changes.

use serde_json::Value;

/// A required value, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityValue {
    /// Nested requirements; each entry is checked below the parent path.
    Object(Vec<(String, CapabilityValue)>),
    /// The worker must declare an array containing every element.
    Array(Vec<Value>),
    /// The worker must declare a number at least this large.
    Number(f64),
    /// The worker must declare exactly this value.
    Scalar(Value),
}

impl From<&Value> for CapabilityValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Object(map) => CapabilityValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), CapabilityValue::from(v)))
                    .collect(),
            ),
            Value::Array(items) => CapabilityValue::Array(items.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) => CapabilityValue::Number(f),
                None => CapabilityValue::Scalar(value.clone()),
            },
            other => CapabilityValue::Scalar(other.clone()),
        }
    }
}

impl CapabilityValue {
    /// Check this requirement against the worker's value at the same path.
    ///
    /// A missing worker value never satisfies a requirement.
    pub fn is_satisfied_by(&self, actual: Option<&Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };

        match self {
            CapabilityValue::Object(entries) => {
                if !actual.is_object() {
                    return false;
                }
                entries
                    .iter()
                    .all(|(key, required)| required.is_satisfied_by(lookup_path(actual, key)))
            }
            CapabilityValue::Array(required) => match actual.as_array() {
                Some(declared) => required.iter().all(|item| declared.contains(item)),
                None => false,
            },
            CapabilityValue::Number(floor) => match actual.as_f64() {
                Some(value) => value >= *floor,
                None => false,
            },
            CapabilityValue::Scalar(expected) => actual == expected,
        }
    }
}

/// Resolve a dot-separated path (`"gpu.cuda.version"`) inside a JSON document.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(doc);
    }
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_path() {
        let doc = json!({"gpu": {"cuda": {"version": 12}}, "tags": ["a", "b"]});
        assert_eq!(lookup_path(&doc, "gpu.cuda.version"), Some(&json!(12)));
        assert_eq!(lookup_path(&doc, "tags.1"), Some(&json!("b")));
        assert_eq!(lookup_path(&doc, "gpu.rocm"), None);
        assert_eq!(lookup_path(&doc, "tags.x"), None);
    }

    #[test]
    fn test_number_is_a_floor() {
        let required = CapabilityValue::from(&json!(12));
        assert!(required.is_satisfied_by(Some(&json!(12.2))));
        assert!(required.is_satisfied_by(Some(&json!(12))));
        assert!(!required.is_satisfied_by(Some(&json!(11))));
        assert!(!required.is_satisfied_by(Some(&json!("12"))));
    }

    #[test]
    fn test_array_requires_superset() {
        let required = CapabilityValue::from(&json!(["fp16", "int8"]));
        assert!(required.is_satisfied_by(Some(&json!(["fp16", "int8", "fp8"]))));
        assert!(!required.is_satisfied_by(Some(&json!(["fp16"]))));
        assert!(!required.is_satisfied_by(Some(&json!("fp16"))));
    }

    #[test]
    fn test_object_recurses() {
        let required = CapabilityValue::from(&json!({"cuda": {"version": 12}, "vendor": "nvidia"}));
        let worker = json!({"cuda": {"version": 12.4, "cudnn": 9}, "vendor": "nvidia"});
        assert!(required.is_satisfied_by(Some(&worker)));

        let wrong_vendor = json!({"cuda": {"version": 12.4}, "vendor": "amd"});
        assert!(!required.is_satisfied_by(Some(&wrong_vendor)));
    }

    #[test]
    fn test_scalar_equality_and_missing_value() {
        let required = CapabilityValue::from(&json!(true));
        assert!(required.is_satisfied_by(Some(&json!(true))));
        assert!(!required.is_satisfied_by(Some(&json!(false))));
        assert!(!required.is_satisfied_by(None));
    }
}
