use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use k8s_openapi::List;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cache::{AdjustmentSign, SharedCache};
use crate::enforcer::SharedRegistry;
use crate::error::{Error, Result};
use crate::labels::{
    CARDS_ANNOTATION, TELEMETRY_POLICY_LABEL, TILES_ANNOTATION, TIMESTAMP_ANNOTATION,
};
use crate::metrics::MetricsCache;
use crate::placement::{self, NodeSnapshot, PlacementOptions};
use crate::policy::STRATEGY_SCHEDULE_ON_METRIC;
use crate::strategy::{self, policy_key};

/// Scheduler-extender wire schemas; field names follow the upstream
/// convention.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderArgs {
    pub pod: Option<Pod>,
    pub nodes: Option<List<Node>>,
    pub node_names: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderFilterResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<List<Node>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_names: Option<Vec<String>>,
    pub failed_nodes: HashMap<String, String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderBindingArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    pub node: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExtenderBindingResult {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

/// State behind the GPU extender endpoints.
#[derive(Clone)]
pub struct GpuExtender {
    pub client: Client,
    pub cache: SharedCache,
    pub options: PlacementOptions,
}

/// State behind the telemetry extender endpoints.
#[derive(Clone)]
pub struct TelemetryExtender {
    pub registry: SharedRegistry,
    pub metrics: Arc<MetricsCache>,
}

pub fn gpu_router(extender: GpuExtender) -> Router {
    Router::new()
        .route("/scheduler/filter", post(gpu_filter))
        .route("/scheduler/bind", post(gpu_bind))
        .with_state(Arc::new(extender))
}

pub fn telemetry_router(extender: TelemetryExtender) -> Router {
    Router::new()
        .route("/scheduler/filter", post(telemetry_filter))
        .route("/scheduler/prioritize", post(telemetry_prioritize))
        .with_state(Arc::new(extender))
}

async fn gpu_filter(State(extender): State<Arc<GpuExtender>>, body: Bytes) -> Response {
    let Ok(args) = serde_json::from_slice::<ExtenderArgs>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(pod) = args.pod else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let node_names = args.node_names.unwrap_or_default();
    if node_names.is_empty() {
        // the extender is deployed node-cache-capable; an empty name list
        // means the scheduler is misconfigured
        let result = ExtenderFilterResult {
            error: "empty node name list, extender requires node caching".to_string(),
            ..Default::default()
        };
        return (StatusCode::NOT_FOUND, Json(result)).into_response();
    }

    let result = filter_nodes_for_pod(&extender.cache, &extender.options, &pod, &node_names).await;
    Json(result).into_response()
}

/// Tries placement on every candidate under the write lock. Preferred
/// candidates, when any exist, replace the ordinary ones outright.
pub async fn filter_nodes_for_pod(
    cache: &SharedCache,
    options: &PlacementOptions,
    pod: &Pod,
    node_names: &[String],
) -> ExtenderFilterResult {
    let mut preferred = Vec::new();
    let mut ordinary = Vec::new();
    let mut failed_nodes = HashMap::new();

    let state = cache.write().await;
    for name in node_names {
        let Some(node) = state.node(name) else {
            failed_nodes.insert(name.clone(), "node not in GPU cache".to_string());
            continue;
        };
        let node = node.clone();
        let mut snapshot = NodeSnapshot {
            used: state.node_resources(name).cloned().unwrap_or_default(),
            used_tiles: state.node_tiles(name).cloned().unwrap_or_default(),
        };
        match placement::check_for_space_and_retrieve_cards(pod, &node, &mut snapshot, options) {
            Ok(selection) if selection.preferred => preferred.push(name.clone()),
            Ok(_) => ordinary.push(name.clone()),
            Err(err) => {
                failed_nodes.insert(name.clone(), err.to_string());
            }
        }
    }

    let node_names = if preferred.is_empty() {
        ordinary
    } else {
        preferred
    };
    ExtenderFilterResult {
        nodes: None,
        node_names: Some(node_names),
        failed_nodes,
        error: String::new(),
    }
}

async fn gpu_bind(State(extender): State<Arc<GpuExtender>>, body: Bytes) -> Response {
    let Ok(args) = serde_json::from_slice::<ExtenderBindingArgs>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let result = match bind_pod(&extender, &args).await {
        Ok(()) => ExtenderBindingResult {
            error: String::new(),
        },
        Err(err) => {
            warn!(pod = %args.pod_name, node = %args.node, %err, "bind failed");
            ExtenderBindingResult {
                error: err.to_string(),
            }
        }
    };
    Json(result).into_response()
}

async fn bind_pod(extender: &GpuExtender, args: &ExtenderBindingArgs) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(extender.client.clone(), &args.pod_namespace);
    let pod = pods.get(&args.pod_name).await.map_err(|err| {
        Error::NotFound(format!(
            "pod {}/{} vanished before bind: {err}",
            args.pod_namespace, args.pod_name
        ))
    })?;
    let uid = pod.metadata.uid.clone().unwrap_or_default();
    if uid != args.pod_uid {
        return Err(Error::BadUid {
            expected: args.pod_uid.clone(),
            got: uid,
        });
    }

    // re-run placement on the named node and commit while holding the lock,
    // so a concurrent Filter sees the booking before this response is written
    let (card_annotation, tile_annotation) = {
        let mut state = extender.cache.write().await;
        let node = state
            .node(&args.node)
            .ok_or_else(|| Error::NotFound(format!("node {} not in GPU cache", args.node)))?
            .clone();
        let mut snapshot = NodeSnapshot {
            used: state.node_resources(&args.node).cloned().unwrap_or_default(),
            used_tiles: state.node_tiles(&args.node).cloned().unwrap_or_default(),
        };
        let selection =
            placement::check_for_space_and_retrieve_cards(&pod, &node, &mut snapshot, &extender.options)?;
        let cards = selection.card_annotation();
        let tiles = selection.tile_annotation();
        state.adjust_pod_resources(&pod, AdjustmentSign::Add, &cards, &tiles, &args.node)?;
        (cards, tiles)
    };

    match annotate_and_bind(extender, args, &card_annotation, &tile_annotation).await {
        Ok(()) => {
            info!(pod = %args.pod_name, node = %args.node, cards = %card_annotation, "bound pod");
            Ok(())
        }
        Err(err) => {
            // compensating removal; the forward adjustment succeeded, so the
            // inverse applies cleanly
            let mut state = extender.cache.write().await;
            if let Err(rollback) = state.adjust_pod_resources(
                &pod,
                AdjustmentSign::Remove,
                &card_annotation,
                &tile_annotation,
                &args.node,
            ) {
                error!(pod = %args.pod_name, %rollback, "rollback after failed bind did not apply");
            }
            Err(err)
        }
    }
}

async fn annotate_and_bind(
    extender: &GpuExtender,
    args: &ExtenderBindingArgs,
    card_annotation: &str,
    tile_annotation: &str,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(extender.client.clone(), &args.pod_namespace);

    let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut annotations = serde_json::Map::new();
    annotations.insert(TIMESTAMP_ANNOTATION.to_string(), json!(timestamp.to_string()));
    annotations.insert(CARDS_ANNOTATION.to_string(), json!(card_annotation));
    if !tile_annotation.is_empty() {
        annotations.insert(TILES_ANNOTATION.to_string(), json!(tile_annotation));
    }
    let patch = json!({ "metadata": { "annotations": annotations } });
    pods.patch(&args.pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    let binding = json!({
        "apiVersion": "v1",
        "kind": "Binding",
        "metadata": { "name": args.pod_name, "namespace": args.pod_namespace, "uid": args.pod_uid },
        "target": { "apiVersion": "v1", "kind": "Node", "name": args.node },
    });
    let _: serde_json::Value = pods
        .create_subresource(
            "binding",
            &args.pod_name,
            &PostParams::default(),
            serde_json::to_vec(&binding)?,
        )
        .await?;
    Ok(())
}

async fn telemetry_filter(State(extender): State<Arc<TelemetryExtender>>, body: Bytes) -> Response {
    let Ok(args) = serde_json::from_slice::<ExtenderArgs>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(pod) = args.pod else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let candidates = candidate_names(&args.node_names, &args.nodes);
    let mut result =
        dontschedule_filter_for_pod(&extender.registry, &extender.metrics, &pod, candidates).await;

    if let (Some(nodes), Some(admitted)) = (args.nodes, result.node_names.as_ref()) {
        let items = nodes
            .items
            .into_iter()
            .filter(|node| {
                node.metadata
                    .name
                    .as_ref()
                    .is_some_and(|name| admitted.contains(name))
            })
            .collect();
        result.nodes = Some(List {
            items,
            metadata: Default::default(),
        });
    }
    Json(result).into_response()
}

/// Applies the pod's dontschedule strategy to the candidates. A pod with no
/// telemetry policy has no rule to violate, so every candidate is admitted.
pub async fn dontschedule_filter_for_pod(
    registry: &SharedRegistry,
    metrics: &MetricsCache,
    pod: &Pod,
    candidates: Vec<String>,
) -> ExtenderFilterResult {
    let mut result = ExtenderFilterResult::default();

    let admitted = match lookup_policy(registry, pod).await {
        None => candidates,
        Some(policy) => {
            let snapshot = metrics.snapshot().await;
            let mut admitted = Vec::new();
            for name in candidates {
                if strategy::node_violates_dontschedule(&policy.spec, &name, &snapshot) {
                    result.failed_nodes.insert(
                        name,
                        format!("violating dontschedule of policy {}", policy.name),
                    );
                } else {
                    admitted.push(name);
                }
            }
            admitted
        }
    };

    result.node_names = Some(admitted);
    result
}

async fn telemetry_prioritize(
    State(extender): State<Arc<TelemetryExtender>>,
    body: Bytes,
) -> Response {
    let Ok(args) = serde_json::from_slice::<ExtenderArgs>(&body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(pod) = args.pod else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if pod_policy_name(&pod).is_none() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let Some(policy) = lookup_policy(&extender.registry, &pod).await else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let Some(rule) = policy
        .spec
        .strategy(STRATEGY_SCHEDULE_ON_METRIC)
        .and_then(|strategy| strategy.rules.first())
        .cloned()
    else {
        return Json(Vec::<HostPriority>::new()).into_response();
    };

    let candidates = candidate_names(&args.node_names, &args.nodes);
    let values = extender
        .metrics
        .values(&rule.metricname)
        .await
        .unwrap_or_default();
    let priorities: Vec<HostPriority> = strategy::prioritize_nodes(&rule, &candidates, &values)
        .into_iter()
        .map(|(host, score)| HostPriority { host, score })
        .collect();
    Json(priorities).into_response()
}

fn candidate_names(node_names: &Option<Vec<String>>, nodes: &Option<List<Node>>) -> Vec<String> {
    if let Some(names) = node_names
        && !names.is_empty()
    {
        return names.clone();
    }
    nodes
        .as_ref()
        .map(|list| {
            list.items
                .iter()
                .filter_map(|node| node.metadata.name.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn pod_policy_name(pod: &Pod) -> Option<String> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(TELEMETRY_POLICY_LABEL))
        .cloned()
}

async fn lookup_policy(
    registry: &SharedRegistry,
    pod: &Pod,
) -> Option<strategy::RegisteredPolicy> {
    let name = pod_policy_name(pod)?;
    let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
    let registry = registry.read().await;
    registry.get(&policy_key(namespace, &name)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheState, NodeAction};
    use crate::testutil::{create_mock_node, create_mock_pod};
    use tokio::sync::RwLock;

    fn shared_cache_with_node(node: k8s_openapi::api::core::v1::Node) -> SharedCache {
        let mut state = CacheState::default();
        state.handle_node_event(NodeAction::Added, &node);
        Arc::new(RwLock::new(state))
    }

    #[test]
    fn test_binding_args_wire_names() {
        let parsed: ExtenderBindingArgs = serde_json::from_str(
            r#"{"PodName":"p1","PodNamespace":"default","PodUID":"abc","Node":"node-1"}"#,
        )
        .unwrap();
        assert_eq!(parsed.pod_name, "p1");
        assert_eq!(parsed.pod_uid, "abc");
        assert_eq!(parsed.node, "node-1");
    }

    #[test]
    fn test_filter_result_wire_names() {
        let result = ExtenderFilterResult {
            nodes: None,
            node_names: Some(vec!["node-1".to_string()]),
            failed_nodes: [("node-2".to_string(), "busy".to_string())].into(),
            error: String::new(),
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["NodeNames"][0], "node-1");
        assert_eq!(value["FailedNodes"]["node-2"], "busy");
        assert_eq!(value["Error"], "");
        assert!(value.get("Nodes").is_none());
    }

    #[test]
    fn test_host_priority_wire_names() {
        let value = serde_json::to_value(HostPriority {
            host: "node-1".to_string(),
            score: 10,
        })
        .unwrap();
        assert_eq!(value["Host"], "node-1");
        assert_eq!(value["Score"], 10);
    }

    #[tokio::test]
    async fn test_filter_classifies_nodes() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let cache = shared_cache_with_node(node);
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let names = vec!["node-1".to_string(), "node-2".to_string()];
        let result = filter_nodes_for_pod(
            &cache,
            &PlacementOptions {
                balanced_resource: None,
                enable_denylist: true,
            },
            &pod,
            &names,
        )
        .await;
        assert_eq!(result.node_names, Some(vec!["node-1".to_string()]));
        assert!(result.failed_nodes.contains_key("node-2"));
    }

    #[tokio::test]
    async fn test_filter_preferred_bucket_replaces_ordinary() {
        let preferred_node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0"),
                ("telemetry.aware.scheduling.policy/gas-prefer-gpu", "card0"),
            ],
            &[("gpu.intel.com/i915", 1)],
        );
        let plain_node = create_mock_node(
            "node-2",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let cache = {
            let mut state = CacheState::default();
            state.handle_node_event(NodeAction::Added, &preferred_node);
            state.handle_node_event(NodeAction::Added, &plain_node);
            Arc::new(RwLock::new(state))
        };
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let names = vec!["node-1".to_string(), "node-2".to_string()];
        let result = filter_nodes_for_pod(
            &cache,
            &PlacementOptions {
                balanced_resource: None,
                enable_denylist: true,
            },
            &pod,
            &names,
        )
        .await;
        // node-2 fits but is dropped in favor of the preferred candidate
        assert_eq!(result.node_names, Some(vec!["node-1".to_string()]));
        assert!(result.failed_nodes.is_empty());
    }

    #[tokio::test]
    async fn test_dontschedule_filter_without_policy_admits_all() {
        let registry: SharedRegistry =
            Arc::new(RwLock::new(crate::strategy::PolicyRegistry::new()));
        let metrics = MetricsCache::new();
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let names = vec!["node-1".to_string(), "node-2".to_string()];
        let result = dontschedule_filter_for_pod(&registry, &metrics, &pod, names.clone()).await;
        assert_eq!(result.node_names, Some(names));
        assert!(result.failed_nodes.is_empty());
        assert!(result.error.is_empty());
    }

    #[tokio::test]
    async fn test_dontschedule_filter_excludes_violating_node() {
        use crate::metrics::NodeMetric;
        use crate::policy::{TASPolicyRule, TASPolicySpec, TASPolicyStrategy};
        use crate::strategy::RegisteredPolicy;
        use std::collections::BTreeMap;

        let mut strategies = BTreeMap::new();
        strategies.insert(
            "dontschedule".to_string(),
            TASPolicyStrategy {
                logical_operator: String::new(),
                rules: vec![TASPolicyRule {
                    metricname: "free_mem".to_string(),
                    operator: "LessThan".to_string(),
                    target: 10,
                    labels: Vec::new(),
                }],
            },
        );
        let registry: SharedRegistry = Arc::new(RwLock::new(
            [(
                policy_key("default", "scarce"),
                RegisteredPolicy {
                    namespace: "default".to_string(),
                    name: "scarce".to_string(),
                    spec: TASPolicySpec { strategies },
                },
            )]
            .into(),
        ));

        let metrics = MetricsCache::new();
        metrics.add_reference("free_mem").await;
        metrics
            .update(
                "free_mem",
                [
                    (
                        "node-1".to_string(),
                        NodeMetric {
                            value: 5.0,
                            window_seconds: None,
                            timestamp: Utc::now(),
                        },
                    ),
                    (
                        "node-2".to_string(),
                        NodeMetric {
                            value: 50.0,
                            window_seconds: None,
                            timestamp: Utc::now(),
                        },
                    ),
                ]
                .into(),
            )
            .await;

        let mut pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);
        pod.metadata.labels = Some(
            [("telemetry-policy".to_string(), "scarce".to_string())]
                .into_iter()
                .collect(),
        );

        let names = vec!["node-1".to_string(), "node-2".to_string()];
        let result = dontschedule_filter_for_pod(&registry, &metrics, &pod, names).await;
        assert_eq!(result.node_names, Some(vec!["node-2".to_string()]));
        assert!(result.failed_nodes["node-1"].contains("scarce"));
    }

    #[tokio::test]
    async fn test_filter_will_not_fit_reason() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let cache = shared_cache_with_node(node);
        {
            let pod = create_mock_pod("p0", &[&[("gpu.intel.com/i915", 1)]], &[]);
            cache
                .write()
                .await
                .adjust_pod_resources(&pod, AdjustmentSign::Add, "card0", "", "node-1")
                .unwrap();
        }
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let names = vec!["node-1".to_string()];
        let result = filter_nodes_for_pod(
            &cache,
            &PlacementOptions {
                balanced_resource: None,
                enable_denylist: true,
            },
            &pod,
            &names,
        )
        .await;
        assert_eq!(result.node_names, Some(Vec::new()));
        assert!(result.failed_nodes["node-1"].contains("Not enough GPU-resources"));
    }
}
