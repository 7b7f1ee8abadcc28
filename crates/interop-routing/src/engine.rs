//! Priority-ordered rule evaluation and action dispatch (§4.8).

use crate::rule::{Condition, Operator, RouteAction, RouteRule};
use interop_core::envelope::Envelope;
use interop_core::error::{EngineError, EngineResult, ErrorKind};
use interop_core::path;
use interop_core::queue::QueueManager;
use interop_transform::{apply_named, TransformationRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Audit trail recorded at `header.metadata["routing"]` (§4.8).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RoutingResult {
    pub rule_name: Option<String>,
    pub actions: Vec<String>,
    pub evaluated_at: u64,
}

pub struct RoutingEngine {
    /// Kept sorted ascending by priority; the catch-all rule is always last.
    rules: Vec<RouteRule>,
    evaluation_counter: AtomicU64,
}

impl RoutingEngine {
    pub fn new() -> Self {
        RoutingEngine {
            rules: Vec::new(),
            evaluation_counter: AtomicU64::new(0),
        }
    }

    pub fn register(&mut self, rule: RouteRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| r.priority);
    }

    /// The first enabled non-catch-all rule whose conditions all match, or the catch-all rule
    /// if none did. Returns `None` only if no catch-all rule was registered at all.
    pub fn select_rule(&self, envelope: &Envelope) -> Option<&RouteRule> {
        let mut fallback = None;
        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }
            if rule.is_catch_all() {
                fallback = Some(rule);
                continue;
            }
            if conditions_match(&rule.conditions, envelope) {
                return Some(rule);
            }
        }
        fallback
    }

    /// Evaluates and dispatches the matched rule's actions against `envelope`, publishing to
    /// named queues and invoking the transformation engine as needed. Records a
    /// [`RoutingResult`] at `header.metadata["routing"]` before returning.
    pub async fn dispatch(
        &self,
        mut envelope: Envelope,
        queues: &QueueManager<Envelope>,
        transforms: &TransformationRegistry,
    ) -> EngineResult<RoutingResult> {
        let ordinal = self.evaluation_counter.fetch_add(1, Ordering::SeqCst);
        let Some(rule) = self.select_rule(&envelope) else {
            return Err(EngineError::new(ErrorKind::RoutingError, "no matching rule and no catch-all configured"));
        };
        let rule_name = rule.name.clone();
        let mut actions_log = Vec::new();

        for action in &rule.actions {
            match action {
                RouteAction::Forward { target_queue } => {
                    let queue = queues.queue(target_queue).await;
                    queue.publish(envelope.clone()).await?;
                    actions_log.push(format!("forward:{target_queue}"));
                }
                RouteAction::Transform { rule_name: transform_rule } => {
                    envelope = apply_named(transforms, transform_rule, &envelope)?;
                    actions_log.push(format!("transform:{transform_rule}"));
                }
                RouteAction::Drop => {
                    actions_log.push("drop".to_string());
                    break;
                }
                RouteAction::Log { level, message } => {
                    info!(%level, %message, "routing log action");
                    actions_log.push(format!("log:{level}:{message}"));
                }
            }
        }

        let result = RoutingResult {
            rule_name: Some(rule_name),
            actions: actions_log,
            evaluated_at: ordinal,
        };
        envelope
            .header
            .metadata
            .insert("routing".to_string(), serde_json::to_value(&result).unwrap_or(Value::Null));
        Ok(result)
    }
}

impl Default for RoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn conditions_match(conditions: &[Condition], envelope: &Envelope) -> bool {
    conditions.iter().all(|c| condition_matches(c, envelope))
}

fn condition_matches(condition: &Condition, envelope: &Envelope) -> bool {
    let Some(actual) = path::resolve(envelope, &condition.field_path) else {
        // field_not_found is a hard false, never a panic or a silent coercion.
        return false;
    };
    match condition.operator {
        Operator::Eq => values_equal(&actual, &condition.value),
        Operator::Ne => !values_equal(&actual, &condition.value),
        Operator::Gt => numeric_cmp(&actual, &condition.value).map(|o| o.is_gt()).unwrap_or(false),
        Operator::Ge => numeric_cmp(&actual, &condition.value).map(|o| o.is_ge()).unwrap_or(false),
        Operator::Lt => numeric_cmp(&actual, &condition.value).map(|o| o.is_lt()).unwrap_or(false),
        Operator::Le => numeric_cmp(&actual, &condition.value).map(|o| o.is_le()).unwrap_or(false),
        Operator::Contains => contains(&actual, &condition.value),
        Operator::Regex => condition
            .regex()
            .and_then(|re| actual.as_str().map(|s| re.is_match(s)))
            .unwrap_or(false),
        Operator::In => membership(&condition.value, &actual),
        Operator::NotIn => !membership(&condition.value, &actual),
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    as_string(a) == as_string(b)
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a = as_f64(a)?;
    let b = as_f64(b)?;
    a.partial_cmp(&b)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(s) => s.contains(&as_string(needle)),
        Value::Array(arr) => arr.iter().any(|v| values_equal(v, needle)),
        _ => false,
    }
}

fn membership(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(arr) => arr.iter().any(|v| values_equal(v, needle)),
        _ => false,
    }
}
