use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

pub const STRATEGY_DONT_SCHEDULE: &str = "dontschedule";
pub const STRATEGY_SCHEDULE_ON_METRIC: &str = "scheduleonmetric";
pub const STRATEGY_DESCHEDULE: &str = "deschedule";
pub const STRATEGY_LABELING: &str = "labeling";

pub const OPERATOR_GREATER_THAN: &str = "GreaterThan";
pub const OPERATOR_LESS_THAN: &str = "LessThan";
pub const OPERATOR_EQUALS: &str = "Equals";

pub const LOGICAL_ANY_OF: &str = "anyOf";
pub const LOGICAL_ALL_OF: &str = "allOf";

/// Node label value marking a deschedule violation.
pub const VIOLATING_VALUE: &str = "violating";

/// Telemetry policy: up to four named strategies, each an ordered rule list.
///
/// Strategy equality is structural (name plus rule list, field by field); the
/// policy controller relies on it to detect real changes.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "telemetry.intel.com",
    version = "v1alpha1",
    kind = "TASPolicy",
    namespaced
)]
pub struct TASPolicySpec {
    pub strategies: BTreeMap<String, TASPolicyStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TASPolicyStrategy {
    /// `anyOf` (default) or `allOf`, used by multi-rule evaluation.
    #[serde(default, rename = "logicalOperator")]
    pub logical_operator: String,
    #[serde(default)]
    pub rules: Vec<TASPolicyRule>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct TASPolicyRule {
    pub metricname: String,
    pub operator: String,
    #[serde(default)]
    pub target: i64,
    /// `key=value` labels attached by the labeling strategy.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl TASPolicySpec {
    pub fn strategy(&self, kind: &str) -> Option<&TASPolicyStrategy> {
        self.strategies.get(kind)
    }

    /// Every metric name referenced by any strategy rule, deduplicated.
    pub fn referenced_metrics(&self) -> Vec<String> {
        let mut names = Vec::new();
        for strategy in self.strategies.values() {
            for rule in &strategy.rules {
                if !names.contains(&rule.metricname) {
                    names.push(rule.metricname.clone());
                }
            }
        }
        names
    }
}

/// Whether `value` violates `rule`. Unknown operators never match.
pub fn rule_violated(value: f64, rule: &TASPolicyRule) -> bool {
    let target = rule.target as f64;
    match rule.operator.as_str() {
        OPERATOR_GREATER_THAN => value > target,
        OPERATOR_LESS_THAN => value < target,
        OPERATOR_EQUALS => value == target,
        other => {
            warn!(operator = other, metric = %rule.metricname, "unknown rule operator");
            false
        }
    }
}

impl TASPolicyStrategy {
    /// Combines per-rule verdicts with the strategy's logical operator;
    /// `anyOf` is the default. A rule with no metric observation does not
    /// count as violated.
    pub fn violated<F>(&self, mut observe: F) -> bool
    where
        F: FnMut(&str) -> Option<f64>,
    {
        if self.rules.is_empty() {
            return false;
        }
        let verdict = |rule: &TASPolicyRule| {
            observe_rule(rule, &mut observe)
        };
        match self.logical_operator.as_str() {
            LOGICAL_ALL_OF => self.rules.iter().all(verdict),
            _ => self.rules.iter().any(verdict),
        }
    }
}

fn observe_rule<F>(rule: &TASPolicyRule, observe: &mut F) -> bool
where
    F: FnMut(&str) -> Option<f64>,
{
    match observe(&rule.metricname) {
        Some(value) => rule_violated(value, rule),
        None => false,
    }
}

/// A "key=value" rule label split apart; malformed entries are dropped.
pub fn split_rule_label(entry: &str) -> Option<(String, String)> {
    let (key, value) = entry.split_once('=')?;
    if key.is_empty() || value.is_empty() {
        warn!(entry, "malformed rule label");
        return None;
    }
    Some((key.to_string(), value.to_string()))
}
