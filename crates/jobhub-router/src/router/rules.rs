//! Routing rules.
//!
//! A rule matches a message when its type, source kind and target kind are
//! among the ones the rule lists (an empty list matches anything) and every
//! condition holds. Conditions address the wire form of the message by
//! dot-path, e.g. `payload.job_id` or `sourceId`.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobhub_core::{BaseMessage, MessageType, SourceKind};

use crate::transport::TargetKind;
use crate::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    Regex,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl RuleCondition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            case_insensitive: false,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }
}

/// Where a `route` action sends a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTarget {
    pub kind: TargetKind,
    /// Explicit ids; every connected target of the kind when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    /// Dot-path into the message naming the single target, e.g.
    /// `payload.worker_id`. Takes precedence over `ids`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_field: Option<String>,
}

impl RouteTarget {
    /// Every connected target of a kind.
    pub fn all(kind: TargetKind) -> Self {
        Self {
            kind,
            ids: None,
            id_field: None,
        }
    }

    /// The target whose id is found at `path` in the message.
    pub fn from_field(kind: TargetKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            ids: None,
            id_field: Some(path.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Route(RouteTarget),
    /// Apply a registered transformer by name.
    Transform { transformer: String },
    /// Apply a registered filter by name.
    Filter { filter: String },
    Log {
        #[serde(default)]
        message: Option<String>,
    },
    Alert { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub message_types: Vec<MessageType>,
    #[serde(default)]
    pub source_kinds: Vec<SourceKind>,
    #[serde(default)]
    pub target_kinds: Vec<TargetKind>,
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
}

fn enabled_by_default() -> bool {
    true
}

impl RoutingRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            priority: 0,
            enabled: true,
            message_types: Vec::new(),
            source_kinds: Vec::new(),
            target_kinds: Vec::new(),
            conditions: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn for_types(mut self, types: &[MessageType]) -> Self {
        self.message_types = types.to_vec();
        self
    }

    pub fn from_sources(mut self, kinds: &[SourceKind]) -> Self {
        self.source_kinds = kinds.to_vec();
        self
    }

    pub fn for_targets(mut self, kinds: &[TargetKind]) -> Self {
        self.target_kinds = kinds.to_vec();
        self
    }

    pub fn with_condition(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Routes to every connected target of a kind.
    pub fn route_to(self, kind: TargetKind) -> Self {
        self.with_action(RuleAction::Route(RouteTarget::all(kind)))
    }
}

/// A rule with its regex conditions compiled once.
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub rule: RoutingRule,
    regexes: Vec<Option<Regex>>,
}

impl CompiledRule {
    pub fn compile(rule: RoutingRule) -> Result<Self, RoutingError> {
        let regexes = rule
            .conditions
            .iter()
            .map(|c| match c.operator {
                ConditionOperator::Regex => {
                    let pattern = c.value.as_str().ok_or_else(|| {
                        RoutingError::InvalidRule(format!(
                            "rule {}: regex condition on {} needs a string pattern",
                            rule.id, c.field
                        ))
                    })?;
                    RegexBuilder::new(pattern)
                        .case_insensitive(c.case_insensitive)
                        .build()
                        .map(Some)
                        .map_err(|e| RoutingError::InvalidRule(format!("rule {}: {}", rule.id, e)))
                }
                _ => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rule, regexes })
    }

    pub fn matches(&self, message: &BaseMessage, target: Option<TargetKind>) -> bool {
        let rule = &self.rule;
        if !rule.enabled {
            return false;
        }
        if !rule.message_types.is_empty() && !rule.message_types.contains(&message.message_type) {
            return false;
        }
        if !rule.source_kinds.is_empty() && !rule.source_kinds.contains(&message.source_kind) {
            return false;
        }
        if !rule.target_kinds.is_empty()
            && !target.is_some_and(|t| rule.target_kinds.contains(&t))
        {
            return false;
        }
        if rule.conditions.is_empty() {
            return true;
        }

        let Ok(doc) = serde_json::to_value(message) else {
            return false;
        };
        rule.conditions
            .iter()
            .zip(&self.regexes)
            .all(|(condition, regex)| evaluate(condition, regex.as_ref(), &doc))
    }
}

fn evaluate(condition: &RuleCondition, regex: Option<&Regex>, doc: &Value) -> bool {
    let actual = jobhub_core::lookup_path(doc, &condition.field);
    let ci = condition.case_insensitive;

    match condition.operator {
        ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
        ConditionOperator::NotExists => actual.map_or(true, Value::is_null),
        ConditionOperator::Equals => actual.is_some_and(|v| values_equal(v, &condition.value, ci)),
        ConditionOperator::NotEquals => {
            !actual.is_some_and(|v| values_equal(v, &condition.value, ci))
        }
        ConditionOperator::Contains => actual.is_some_and(|v| contains(v, &condition.value, ci)),
        ConditionOperator::NotContains => !actual.is_some_and(|v| contains(v, &condition.value, ci)),
        ConditionOperator::Regex => match (actual, regex) {
            (Some(v), Some(re)) => re.is_match(&as_text(v)),
            _ => false,
        },
    }
}

fn values_equal(actual: &Value, expected: &Value, case_insensitive: bool) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) if case_insensitive => a.eq_ignore_ascii_case(b),
        _ => actual == expected,
    }
}

fn contains(actual: &Value, needle: &Value, case_insensitive: bool) -> bool {
    match actual {
        Value::String(haystack) => {
            let needle = as_text(needle);
            if case_insensitive {
                haystack.to_lowercase().contains(&needle.to_lowercase())
            } else {
                haystack.contains(&needle)
            }
        }
        Value::Array(items) => items
            .iter()
            .any(|item| values_equal(item, needle, case_insensitive)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn failed_message() -> BaseMessage {
        BaseMessage::new(
            MessageType::JobFailed,
            json!({"job_id": "job-42", "error": "CUDA Out Of Memory", "tags": ["gpu", "retry"]}),
            SourceKind::Worker,
        )
        .with_source_id("w1")
    }

    fn rule_with(condition: RuleCondition) -> CompiledRule {
        CompiledRule::compile(RoutingRule::new("r", "r").with_condition(condition)).unwrap()
    }

    #[test]
    fn test_type_source_and_target_filters() {
        let msg = failed_message();
        let rule = CompiledRule::compile(
            RoutingRule::new("r1", "failures to clients")
                .for_types(&[MessageType::JobFailed])
                .from_sources(&[SourceKind::Worker])
                .for_targets(&[TargetKind::Client]),
        )
        .unwrap();

        assert!(rule.matches(&msg, Some(TargetKind::Client)));
        assert!(!rule.matches(&msg, Some(TargetKind::Worker)));
        assert!(!rule.matches(&msg, None));

        let heartbeat = BaseMessage::new(MessageType::WorkerHeartbeat, json!({}), SourceKind::Worker);
        assert!(!rule.matches(&heartbeat, Some(TargetKind::Client)));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let mut rule = RoutingRule::new("r", "r");
        rule.enabled = false;
        let rule = CompiledRule::compile(rule).unwrap();
        assert!(!rule.matches(&failed_message(), None));
    }

    #[test]
    fn test_equality_operators() {
        let msg = failed_message();
        let eq = rule_with(RuleCondition::new("payload.job_id", ConditionOperator::Equals, json!("job-42")));
        assert!(eq.matches(&msg, None));

        let ne = rule_with(RuleCondition::new("sourceId", ConditionOperator::NotEquals, json!("w2")));
        assert!(ne.matches(&msg, None));

        let ci = rule_with(
            RuleCondition::new("payload.job_id", ConditionOperator::Equals, json!("JOB-42"))
                .case_insensitive(),
        );
        assert!(ci.matches(&msg, None));

        let cs = rule_with(RuleCondition::new("payload.job_id", ConditionOperator::Equals, json!("JOB-42")));
        assert!(!cs.matches(&msg, None));
    }

    #[test]
    fn test_contains_operators() {
        let msg = failed_message();
        let sub = rule_with(RuleCondition::new("payload.error", ConditionOperator::Contains, json!("Memory")));
        assert!(sub.matches(&msg, None));

        let ci = rule_with(
            RuleCondition::new("payload.error", ConditionOperator::Contains, json!("out of memory"))
                .case_insensitive(),
        );
        assert!(ci.matches(&msg, None));

        let array = rule_with(RuleCondition::new("payload.tags", ConditionOperator::Contains, json!("gpu")));
        assert!(array.matches(&msg, None));

        let not = rule_with(RuleCondition::new("payload.tags", ConditionOperator::NotContains, json!("cpu")));
        assert!(not.matches(&msg, None));
    }

    #[test]
    fn test_regex_and_existence() {
        let msg = failed_message();
        let re = rule_with(RuleCondition::new("payload.job_id", ConditionOperator::Regex, json!("^job-\\d+$")));
        assert!(re.matches(&msg, None));

        let re_ci = rule_with(
            RuleCondition::new("payload.error", ConditionOperator::Regex, json!("cuda")).case_insensitive(),
        );
        assert!(re_ci.matches(&msg, None));

        let exists = rule_with(RuleCondition::new("payload.error", ConditionOperator::Exists, Value::Null));
        assert!(exists.matches(&msg, None));

        let missing = rule_with(RuleCondition::new("payload.progress", ConditionOperator::NotExists, Value::Null));
        assert!(missing.matches(&msg, None));
    }

    #[test]
    fn test_invalid_regex_rejected_at_compile() {
        let rule = RoutingRule::new("bad", "bad").with_condition(RuleCondition::new(
            "type",
            ConditionOperator::Regex,
            json!("("),
        ));
        assert!(matches!(CompiledRule::compile(rule), Err(RoutingError::InvalidRule(_))));
    }

    #[test]
    fn test_rule_deserializes() {
        let rule: RoutingRule = serde_json::from_value(json!({
            "id": "r1",
            "name": "assignments",
            "priority": 10,
            "message_types": ["job_assigned"],
            "conditions": [{"field": "payload.worker_id", "operator": "exists"}],
            "actions": [
                {"action": "route", "kind": "worker"},
                {"action": "log"}
            ]
        }))
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.actions.len(), 2);
        assert_eq!(
            rule.actions[0],
            RuleAction::Route(RouteTarget::all(TargetKind::Worker))
        );
    }
}
