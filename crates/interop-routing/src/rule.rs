//! [`RouteRule`] and its conditions/actions (§3, §4.8).

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    Regex,
    In,
    NotIn,
}

/// A single `{field_path, operator, value}` condition. The `Regex` operator's pattern is
/// compiled once here, at rule construction, rather than on every evaluation (§4.8).
#[derive(Debug, Clone)]
pub struct Condition {
    pub field_path: String,
    pub operator: Operator,
    pub value: Value,
    compiled_regex: Option<Regex>,
}

impl Condition {
    pub fn new(field_path: impl Into<String>, operator: Operator, value: Value) -> Result<Self, String> {
        let compiled_regex = if operator == Operator::Regex {
            let pattern = value
                .as_str()
                .ok_or_else(|| "regex condition value must be a string pattern".to_string())?;
            Some(Regex::new(pattern).map_err(|e| format!("invalid regex pattern: {e}"))?)
        } else {
            None
        };
        Ok(Condition {
            field_path: field_path.into(),
            operator,
            value,
            compiled_regex,
        })
    }

    pub fn regex(&self) -> Option<&Regex> {
        self.compiled_regex.as_ref()
    }
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    Forward { target_queue: String },
    Transform { rule_name: String },
    Drop,
    Log { level: String, message: String },
}

#[derive(Debug, Clone)]
pub struct RouteRule {
    pub name: String,
    pub priority: u32,
    pub conditions: Vec<Condition>,
    pub actions: Vec<RouteAction>,
    pub enabled: bool,
}

impl RouteRule {
    /// Priority assumed for a rule that doesn't specify one.
    pub const DEFAULT_PRIORITY: u32 = 100;
    /// Priority reserved for the catch-all default route, which always fires as a fallback.
    pub const CATCH_ALL_PRIORITY: u32 = 1000;

    pub fn is_catch_all(&self) -> bool {
        self.priority == Self::CATCH_ALL_PRIORITY
    }
}
