use futures::{StreamExt, pin_mut};
use k8s_openapi::api::core::v1::Node;
use kube::Client;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::{WatchStreamExt, watcher};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::{MetricsCache, MetricsReader};
use crate::policy::TASPolicy;
use crate::strategy::{self, PolicyRegistry, RegisteredPolicy, policy_key};

pub type SharedRegistry = Arc<RwLock<PolicyRegistry>>;

/// Runs the policy controller and the periodic enforcement loop until the
/// token is cancelled.
pub async fn run(
    client: Client,
    registry: SharedRegistry,
    metrics: Arc<MetricsCache>,
    interval: Duration,
    token: CancellationToken,
) {
    let controller = tokio::spawn(watch_policies(
        client.clone(),
        registry.clone(),
        metrics.clone(),
        token.clone(),
    ));

    let reader = MetricsReader::new(client.clone());
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                enforce_tick(&client, &registry, &metrics, &reader).await;
            }
        }
    }

    if let Err(err) = controller.await {
        warn!(%err, "policy controller task panicked");
    }
    info!("enforcer stopped");
}

/// One enforcement pass: refresh every referenced metric, then reconcile each
/// node's deschedule and labeling labels in a single patch per node.
async fn enforce_tick(
    client: &Client,
    registry: &SharedRegistry,
    metrics: &MetricsCache,
    reader: &MetricsReader,
) {
    for metric in metrics.tracked_metrics().await {
        match reader.node_metrics(&metric).await {
            Ok(values) => metrics.update(&metric, values).await,
            // keep the last observation rather than dropping to nothing
            Err(err) => warn!(metric = %metric, %err, "metric refresh failed"),
        }
    }

    let policies = { registry.read().await.clone() };
    if policies.is_empty() {
        return;
    }
    let snapshot = metrics.snapshot().await;

    let nodes: Api<Node> = Api::all(client.clone());
    let node_list = match nodes.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(err) => {
            warn!(%err, "node list failed, skipping enforcement pass");
            return;
        }
    };

    for node in node_list.items {
        let name = node.metadata.name.clone().unwrap_or_default();
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let changes = strategy::node_label_patch(&name, &labels, &policies, &snapshot);
        if changes.is_empty() {
            continue;
        }
        if let Err(err) = patch_node_labels(client, &name, changes).await {
            warn!(node = %name, %err, "node label patch failed");
        }
    }
}

/// Watches the policy objects, registering strategies by structural equality
/// and cleaning a deleted policy's labels off every node.
async fn watch_policies(
    client: Client,
    registry: SharedRegistry,
    metrics: Arc<MetricsCache>,
    token: CancellationToken,
) {
    let policies: Api<TASPolicy> = Api::all(client.clone());
    let stream = watcher(policies, watcher::Config::default()).default_backoff();
    pin_mut!(stream);

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Apply(policy) | watcher::Event::InitApply(policy))) => {
                register_policy(&registry, &metrics, policy).await;
            }
            Some(Ok(watcher::Event::Delete(policy))) => {
                let name = deregister_policy(&registry, &metrics, policy).await;
                if let Some(name) = name
                    && let Err(err) = cleanup_policy_labels(&client, &name).await
                {
                    warn!(policy = %name, %err, "policy label cleanup failed");
                }
            }
            Some(Ok(watcher::Event::Init | watcher::Event::InitDone)) => {}
            #[allow(unreachable_patterns)]
            Some(Ok(_)) => warn!("unrecognized policy watch event, dropping"),
            Some(Err(err)) => warn!(%err, "policy watch error"),
            None => break,
        }
    }
    debug!("policy controller stopped");
}

async fn register_policy(registry: &SharedRegistry, metrics: &MetricsCache, policy: TASPolicy) {
    let namespace = policy.metadata.namespace.clone().unwrap_or_default();
    let name = policy.metadata.name.clone().unwrap_or_default();
    let key = policy_key(&namespace, &name);
    let incoming = RegisteredPolicy {
        namespace,
        name,
        spec: policy.spec,
    };

    let mut registry = registry.write().await;
    if registry.get(&key) == Some(&incoming) {
        debug!(policy = %key, "unchanged strategies");
        return;
    }

    let previous_metrics = registry
        .get(&key)
        .map(|existing| existing.spec.referenced_metrics())
        .unwrap_or_default();
    let current_metrics = incoming.spec.referenced_metrics();
    for metric in &current_metrics {
        if !previous_metrics.contains(metric) {
            metrics.add_reference(metric).await;
        }
    }
    for metric in &previous_metrics {
        if !current_metrics.contains(metric) {
            metrics.remove_reference(metric).await;
        }
    }

    info!(policy = %key, strategies = incoming.spec.strategies.len(), "registered policy");
    registry.insert(key, incoming);
}

async fn deregister_policy(
    registry: &SharedRegistry,
    metrics: &MetricsCache,
    policy: TASPolicy,
) -> Option<String> {
    let namespace = policy.metadata.namespace.clone().unwrap_or_default();
    let name = policy.metadata.name.clone().unwrap_or_default();
    let key = policy_key(&namespace, &name);

    let removed = { registry.write().await.remove(&key) };
    let removed = removed?;
    for metric in removed.spec.referenced_metrics() {
        metrics.remove_reference(&metric).await;
    }
    info!(policy = %key, "deregistered policy");
    Some(removed.name)
}

/// Removes a deleted policy's deschedule and labeling labels from all nodes.
async fn cleanup_policy_labels(client: &Client, policy_name: &str) -> Result<()> {
    let nodes: Api<Node> = Api::all(client.clone());
    for node in nodes.list(&ListParams::default()).await?.items {
        let name = node.metadata.name.clone().unwrap_or_default();
        let labels = node.metadata.labels.clone().unwrap_or_default();
        let changes = strategy::policy_cleanup_patch(policy_name, &labels);
        if changes.is_empty() {
            continue;
        }
        patch_node_labels(client, &name, changes).await?;
    }
    Ok(())
}

/// Applies label additions and removals as one merge patch; `None` removes.
async fn patch_node_labels(
    client: &Client,
    node: &str,
    changes: BTreeMap<String, Option<String>>,
) -> Result<()> {
    let labels: serde_json::Map<String, Value> = changes
        .into_iter()
        .map(|(key, value)| (key, value.map(Value::String).unwrap_or(Value::Null)))
        .collect();
    let patch = json!({ "metadata": { "labels": labels } });

    let nodes: Api<Node> = Api::all(client.clone());
    nodes
        .patch(node, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
