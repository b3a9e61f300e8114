use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::warn;

use crate::labels::{Labels, TELEMETRY_NS_PREFIX};
use crate::metrics::NodeMetricValues;
use crate::policy::{
    OPERATOR_GREATER_THAN, OPERATOR_LESS_THAN, STRATEGY_DESCHEDULE, STRATEGY_LABELING,
    TASPolicyRule, TASPolicySpec, TASPolicyStrategy, VIOLATING_VALUE, rule_violated,
    split_rule_label,
};

/// Metric name → node → last observation, as read from the metrics cache.
pub type MetricSnapshot = HashMap<String, NodeMetricValues>;

/// A registered policy with the identity its labels carry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredPolicy {
    pub namespace: String,
    pub name: String,
    pub spec: TASPolicySpec,
}

/// Registry key: `<namespace>/<name>`.
pub fn policy_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

pub type PolicyRegistry = HashMap<String, RegisteredPolicy>;

pub fn observe(snapshot: &MetricSnapshot, metric: &str, node: &str) -> Option<f64> {
    snapshot
        .get(metric)
        .and_then(|values| values.get(node))
        .map(|observation| observation.value)
}

/// Whether `node` violates the policy's dontschedule strategy.
pub fn node_violates_dontschedule(
    spec: &TASPolicySpec,
    node: &str,
    snapshot: &MetricSnapshot,
) -> bool {
    spec.strategy(crate::policy::STRATEGY_DONT_SCHEDULE)
        .is_some_and(|strategy| strategy.violated(|metric| observe(snapshot, metric, node)))
}

/// Desired labeling-strategy output for one policy on one node, fully
/// prefixed. Rules contributing the same key resolve to the extremum per the
/// shared operator; mixed operators under one key are unsupported.
pub fn labeling_labels(
    policy_name: &str,
    strategy: &TASPolicyStrategy,
    node: &str,
    snapshot: &MetricSnapshot,
) -> BTreeMap<String, String> {
    struct Candidate {
        value: String,
        metric_value: f64,
        operator: String,
    }

    let mut per_key: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
    for rule in &strategy.rules {
        let Some(metric_value) = observe(snapshot, &rule.metricname, node) else {
            continue;
        };
        if !rule_violated(metric_value, rule) {
            continue;
        }
        for entry in &rule.labels {
            let Some((key, value)) = split_rule_label(entry) else {
                continue;
            };
            per_key.entry(key).or_default().push(Candidate {
                value,
                metric_value,
                operator: rule.operator.clone(),
            });
        }
    }

    let mut labels = BTreeMap::new();
    for (key, candidates) in per_key {
        let operators: HashSet<&str> = candidates
            .iter()
            .map(|candidate| candidate.operator.as_str())
            .collect();
        if operators.len() > 1 {
            warn!(policy = policy_name, key = %key, "mixed operators under one label key, skipping");
            continue;
        }
        let winner = match operators.iter().next().copied() {
            Some(OPERATOR_GREATER_THAN) => candidates
                .iter()
                .max_by(|a, b| compare_values(a.metric_value, b.metric_value)),
            Some(OPERATOR_LESS_THAN) => candidates
                .iter()
                .min_by(|a, b| compare_values(a.metric_value, b.metric_value)),
            _ if candidates.len() == 1 => candidates.first(),
            _ => {
                warn!(policy = policy_name, key = %key, "cannot pick an extremum for this operator");
                continue;
            }
        };
        if let Some(winner) = winner {
            labels.insert(
                format!("{TELEMETRY_NS_PREFIX}{policy_name}/{key}"),
                winner.value.clone(),
            );
        }
    }
    labels
}

fn compare_values(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// The label changes one node needs for the current violation state: `Some`
/// sets a label, `None` removes it. An empty map means no patch call.
pub fn node_label_patch(
    node: &str,
    node_labels: &Labels,
    registry: &PolicyRegistry,
    snapshot: &MetricSnapshot,
) -> BTreeMap<String, Option<String>> {
    let mut patch = BTreeMap::new();

    for policy in registry.values() {
        if let Some(strategy) = policy.spec.strategy(STRATEGY_DESCHEDULE) {
            let violated = strategy.violated(|metric| observe(snapshot, metric, node));
            let current = node_labels.get(&policy.name).map(String::as_str);
            if violated && current != Some(VIOLATING_VALUE) {
                patch.insert(policy.name.clone(), Some(VIOLATING_VALUE.to_string()));
            } else if !violated && current.is_some() {
                patch.insert(policy.name.clone(), None);
            }
        }

        if let Some(strategy) = policy.spec.strategy(STRATEGY_LABELING) {
            let desired = labeling_labels(&policy.name, strategy, node, snapshot);
            let prefix = format!("{TELEMETRY_NS_PREFIX}{}/", policy.name);
            for (key, value) in &desired {
                if node_labels.get(key) != Some(value) {
                    patch.insert(key.clone(), Some(value.clone()));
                }
            }
            for key in node_labels.keys() {
                if key.starts_with(&prefix) && !desired.contains_key(key) {
                    patch.insert(key.clone(), None);
                }
            }
        }
    }

    patch
}

/// Removals clearing every trace of a deleted policy from one node.
pub fn policy_cleanup_patch(
    policy_name: &str,
    node_labels: &Labels,
) -> BTreeMap<String, Option<String>> {
    let prefix = format!("{TELEMETRY_NS_PREFIX}{policy_name}/");
    let mut patch = BTreeMap::new();
    if node_labels.contains_key(policy_name) {
        patch.insert(policy_name.to_string(), None);
    }
    for key in node_labels.keys() {
        if key.starts_with(&prefix) {
            patch.insert(key.clone(), None);
        }
    }
    patch
}

/// Rank order for `scheduleonmetric`: descending for `GreaterThan`, ascending
/// otherwise. Nodes without the metric are dropped; scores decay from ten by
/// rank.
pub fn prioritize_nodes(
    rule: &TASPolicyRule,
    node_names: &[String],
    values: &NodeMetricValues,
) -> Vec<(String, i64)> {
    let mut observed: Vec<(String, f64)> = node_names
        .iter()
        .filter_map(|node| {
            values
                .get(node)
                .map(|observation| (node.clone(), observation.value))
        })
        .collect();

    if rule.operator == OPERATOR_GREATER_THAN {
        observed.sort_by(|a, b| compare_values(b.1, a.1));
    } else {
        observed.sort_by(|a, b| compare_values(a.1, b.1));
    }

    observed
        .into_iter()
        .enumerate()
        .map(|(rank, (node, _))| (node, (10 - rank as i64).max(0)))
        .collect()
}
