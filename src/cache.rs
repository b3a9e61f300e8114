use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::annotation::{self, ContainerTiles};
use crate::error::{Error, Result};
use crate::labels::{
    self, I915_MONITORING_RESOURCE, I915_RESOURCE, XE_MONITORING_RESOURCE, XE_RESOURCE,
};
use crate::resources::ResourceMap;

/// Plugin resources in preference order: `xe` is current, `i915` legacy.
pub const PLUGIN_RESOURCES: [&str; 2] = [XE_RESOURCE, I915_RESOURCE];

pub const MONITORING_RESOURCES: [&str; 2] = [XE_MONITORING_RESOURCE, I915_MONITORING_RESOURCE];

/// Card name to its booked resources on one node.
pub type NodeResources = HashMap<String, ResourceMap>;

/// Card name to its used tile indices on one node.
pub type NodeTiles = HashMap<String, BTreeSet<u64>>;

/// The single reader/writer lock guarding one cache's consistency domain.
pub type SharedCache = std::sync::Arc<tokio::sync::RwLock<CacheState>>;

pub fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}&{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentSign {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAction {
    Added,
    Updated,
    Deleted,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Added,
    Updated,
    Deleted,
}

/// One GPU-requesting container's name and its GPU-prefixed requests.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub name: String,
    pub resources: ResourceMap,
}

/// GPU-prefixed requests per container, for containers that carry any.
pub fn gpu_container_requests(pod: &Pod) -> Vec<ContainerRequest> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };
    spec.containers
        .iter()
        .filter_map(|container| {
            let requests = container.resources.as_ref()?.requests.as_ref()?;
            let resources: ResourceMap = requests
                .iter()
                .filter(|(name, _)| labels::is_gpu_resource(name))
                .filter_map(|(name, quantity)| match quantity.0.parse::<i64>() {
                    Ok(amount) => Some((name.clone(), amount)),
                    Err(_) => {
                        warn!(
                            resource = %name,
                            value = %quantity.0,
                            "unparsable GPU resource quantity"
                        );
                        None
                    }
                })
                .collect();
            if resources.is_empty() {
                None
            } else {
                Some(ContainerRequest {
                    name: container.name.clone(),
                    resources,
                })
            }
        })
        .collect()
}

pub fn pod_requests_gpus(pod: &Pod) -> bool {
    !gpu_container_requests(pod).is_empty()
}

/// A node is GPU-relevant when a plugin resource is allocatable on it.
pub fn node_has_gpu_capacity(node: &Node) -> bool {
    let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
        return false;
    };
    PLUGIN_RESOURCES.iter().any(|resource| {
        allocatable
            .get(*resource)
            .and_then(|q| q.0.parse::<i64>().ok())
            .is_some_and(|count| count > 0)
    })
}

/// A pod is completed once its phase is terminal or deletion has started.
pub fn pod_is_completed(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    matches!(
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or(""),
        "Succeeded" | "Failed"
    )
}

/// Work to run outside the lock after a node's deschedule sets changed:
/// re-examine the running pods on the node against the new sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescheduleScan {
    pub node: String,
    pub cards: Vec<String>,
    pub tiles: Vec<String>,
}

/// Everything the two extender request paths and the event handlers share.
/// One instance forms a single consistency domain; the caller serializes
/// access through one reader/writer lock.
#[derive(Debug, Default)]
pub struct CacheState {
    /// node → card → booked resources
    node_statuses: HashMap<String, NodeResources>,
    /// node → card → used tile indices
    node_tile_statuses: HashMap<String, NodeTiles>,
    /// pod key → card annotation booked for it
    annotated_pods: HashMap<String, String>,
    /// node objects mirrored from the event stream, placement inputs
    nodes: HashMap<String, Node>,
    /// node → last seen descheduled card list (sorted)
    previous_deschedule_cards: HashMap<String, Vec<String>>,
    /// node → last seen descheduled `card_gtN` list (sorted)
    previous_deschedule_tiles: HashMap<String, Vec<String>>,
    /// pod key → whether the deschedule label is currently wanted
    pod_deschedule_statuses: HashMap<String, bool>,
}

impl CacheState {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_resources(&self, name: &str) -> Option<&NodeResources> {
        self.node_statuses.get(name)
    }

    pub fn node_tiles(&self, name: &str) -> Option<&NodeTiles> {
        self.node_tile_statuses.get(name)
    }

    pub fn is_annotated(&self, key: &str) -> bool {
        self.annotated_pods.contains_key(key)
    }

    pub fn pod_deschedule_status(&self, key: &str) -> Option<bool> {
        self.pod_deschedule_statuses.get(key).copied()
    }

    pub fn set_pod_deschedule_status(&mut self, key: &str, wanted: bool) {
        self.pod_deschedule_statuses.insert(key.to_string(), wanted);
    }

    /// Books or releases a pod's per-card resources and tiles on `node`.
    ///
    /// The whole adjustment is validated on a copy first; the live maps change
    /// only when every element succeeds. On `Add` the pod is recorded as
    /// annotated, on `Remove` it is forgotten.
    pub fn adjust_pod_resources(
        &mut self,
        pod: &Pod,
        sign: AdjustmentSign,
        card_annotation: &str,
        tile_annotation: &str,
        node: &str,
    ) -> Result<()> {
        let per_container_cards = annotation::parse_card_annotation(card_annotation);
        let requests = gpu_container_requests(pod);
        if per_container_cards.len() != requests.len() {
            return Err(Error::Annotation(format!(
                "card annotation has {} container segments, pod has {} GPU containers",
                per_container_cards.len(),
                requests.len()
            )));
        }
        let per_container_tiles: ContainerTiles = if tile_annotation.is_empty() {
            Vec::new()
        } else {
            annotation::parse_tile_annotation(tile_annotation)?
        };

        // per-card delta: the container request divided by its card count
        let mut adjustments: Vec<(String, ResourceMap)> = Vec::new();
        for (request, cards) in requests.iter().zip(per_container_cards.iter()) {
            if cards.is_empty() {
                continue;
            }
            let mut per_card = request.resources.new_copy();
            for monitoring in MONITORING_RESOURCES {
                let amount = per_card.get(monitoring);
                if amount > 0 {
                    per_card.subtract(monitoring, amount)?;
                }
            }
            per_card.divide(cards.len() as i64)?;
            for card in cards {
                adjustments.push((card.clone(), per_card.new_copy()));
            }
        }

        // dry run on a deep copy, then swap in atomically
        let mut node_resources = self.node_statuses.get(node).cloned().unwrap_or_default();
        for (card, delta) in &adjustments {
            let booked = node_resources.entry(card.clone()).or_default();
            match sign {
                AdjustmentSign::Add => booked.add_all(delta)?,
                AdjustmentSign::Remove => booked.subtract_all(delta)?,
            }
        }
        self.node_statuses.insert(node.to_string(), node_resources);

        let node_tiles = self.node_tile_statuses.entry(node.to_string()).or_default();
        for container in &per_container_tiles {
            for (card, tiles) in container {
                let used = node_tiles.entry(card.clone()).or_default();
                for tile in tiles {
                    match sign {
                        AdjustmentSign::Add => {
                            used.insert(*tile);
                        }
                        AdjustmentSign::Remove => {
                            used.remove(tile);
                        }
                    }
                }
            }
        }

        let key = pod_key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        match sign {
            AdjustmentSign::Add => {
                self.annotated_pods.insert(key, card_annotation.to_string());
            }
            AdjustmentSign::Remove => {
                self.annotated_pods.remove(&key);
            }
        }

        Ok(())
    }

    /// Pod event state machine. Annotations are immutable after first write,
    /// so a pod already booked short-circuits; that makes Bind-then-Added
    /// delivery order irrelevant.
    pub fn handle_pod_event(
        &mut self,
        action: PodAction,
        pod: &Pod,
        card_annotation: &str,
        tile_annotation: &str,
        node: &str,
    ) -> Result<()> {
        let key = pod_key(
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default(),
        );
        match action {
            PodAction::Added | PodAction::Updated => {
                if action == PodAction::Added {
                    self.pod_deschedule_statuses.entry(key.clone()).or_insert(false);
                }
                if self.is_annotated(&key) {
                    debug!(pod = %key, "already booked, skipping");
                    return Ok(());
                }
                if card_annotation.is_empty() || node.is_empty() {
                    // not bound yet, nothing to book
                    return Ok(());
                }
                self.adjust_pod_resources(
                    pod,
                    AdjustmentSign::Add,
                    card_annotation,
                    tile_annotation,
                    node,
                )?;
                info!(pod = %key, node, "booked pod resources");
                Ok(())
            }
            PodAction::Deleted | PodAction::Completed => {
                if !self.is_annotated(&key) {
                    self.pod_deschedule_statuses.remove(&key);
                    return Ok(());
                }
                // the object may arrive stripped, fall back to the booked value
                let cards = if card_annotation.is_empty() {
                    self.annotated_pods.get(&key).cloned().unwrap_or_default()
                } else {
                    card_annotation.to_string()
                };
                self.adjust_pod_resources(pod, AdjustmentSign::Remove, &cards, tile_annotation, node)?;
                self.pod_deschedule_statuses.remove(&key);
                info!(pod = %key, node, "released pod resources");
                Ok(())
            }
        }
    }

    /// Node event upkeep. Returns a [`DescheduleScan`] when the node's
    /// descheduled card or tile sets changed; the caller runs the scan outside
    /// the lock and commits it back with [`Self::commit_deschedule_scan`].
    pub fn handle_node_event(&mut self, action: NodeAction, node: &Node) -> Option<DescheduleScan> {
        let name = node.metadata.name.clone().unwrap_or_default();
        match action {
            NodeAction::Added | NodeAction::Updated => {
                let node_labels = node.metadata.labels.clone().unwrap_or_default();
                self.nodes.insert(name.clone(), node.clone());
                self.node_statuses.entry(name.clone()).or_default();
                self.node_tile_statuses.entry(name.clone()).or_default();

                let mut cards =
                    labels::cards_with_action_label(&node_labels, labels::DESCHEDULE_PODS_PREFIX);
                cards.sort();
                let mut tiles: Vec<String> = crate::tiles::parse_tile_controls(&node_labels)
                    .descheduled
                    .iter()
                    .flat_map(|(card, indices)| {
                        indices.iter().map(move |i| format!("{card}_gt{i}"))
                    })
                    .collect();
                tiles.sort();

                let unchanged = self
                    .previous_deschedule_cards
                    .get(&name)
                    .is_some_and(|prev| *prev == cards)
                    && self
                        .previous_deschedule_tiles
                        .get(&name)
                        .is_some_and(|prev| *prev == tiles);
                if unchanged {
                    return None;
                }
                Some(DescheduleScan {
                    node: name,
                    cards,
                    tiles,
                })
            }
            NodeAction::Deleted => {
                self.nodes.remove(&name);
                self.node_statuses.remove(&name);
                self.node_tile_statuses.remove(&name);
                self.previous_deschedule_cards.remove(&name);
                self.previous_deschedule_tiles.remove(&name);
                info!(node = %name, "forgot node");
                None
            }
        }
    }

    /// Records a completed deschedule scan so an unchanged violation set on
    /// the next node event is a no-op.
    pub fn commit_deschedule_scan(&mut self, scan: &DescheduleScan) {
        self.previous_deschedule_cards
            .insert(scan.node.clone(), scan.cards.clone());
        self.previous_deschedule_tiles
            .insert(scan.node.clone(), scan.tiles.clone());
    }

    pub fn booked(&self, node: &str, card: &str, resource: &str) -> i64 {
        self.node_statuses
            .get(node)
            .and_then(|cards| cards.get(card))
            .map(|rm| rm.get(resource))
            .unwrap_or(0)
    }

    pub fn used_tiles(&self, node: &str, card: &str) -> Vec<u64> {
        self.node_tile_statuses
            .get(node)
            .and_then(|cards| cards.get(card))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{create_mock_node, create_mock_pod};

    #[test]
    fn test_adjust_round_trip_restores_usage() {
        let mut state = CacheState::default();
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 2)]], &[]);

        state
            .adjust_pod_resources(&pod, AdjustmentSign::Add, "card0,card1", "", "node-1")
            .unwrap();
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 1);
        assert_eq!(state.booked("node-1", "card1", "gpu.intel.com/i915"), 1);
        assert!(state.is_annotated("default&p1"));

        state
            .adjust_pod_resources(&pod, AdjustmentSign::Remove, "card0,card1", "", "node-1")
            .unwrap();
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 0);
        assert_eq!(state.booked("node-1", "card1", "gpu.intel.com/i915"), 0);
        assert!(!state.is_annotated("default&p1"));
    }

    #[test]
    fn test_adjust_is_transactional_on_failure() {
        let mut state = CacheState::default();
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);
        state
            .adjust_pod_resources(&pod, AdjustmentSign::Add, "card0", "card0:gt0", "node-1")
            .unwrap();

        // a second container segment appears without a matching GPU container
        let err =
            state.adjust_pod_resources(&pod, AdjustmentSign::Add, "card0|card1", "", "node-1");
        assert!(err.is_err());
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 1);
        assert_eq!(state.used_tiles("node-1", "card0"), vec![0]);
    }

    #[test]
    fn test_adjust_tracks_tiles_with_set_semantics() {
        let mut state = CacheState::default();
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 2)]],
            &[],
        );
        state
            .adjust_pod_resources(&pod, AdjustmentSign::Add, "card0", "card0:gt0+gt1", "node-1")
            .unwrap();
        let other = create_mock_pod(
            "p2",
            &[&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 1)]],
            &[],
        );
        state
            .adjust_pod_resources(&other, AdjustmentSign::Add, "card0", "card0:gt1", "node-1")
            .unwrap();
        assert_eq!(state.used_tiles("node-1", "card0"), vec![0, 1]);

        state
            .adjust_pod_resources(&other, AdjustmentSign::Remove, "card0", "card0:gt1", "node-1")
            .unwrap();
        assert_eq!(state.used_tiles("node-1", "card0"), vec![0]);
    }

    #[test]
    fn test_monitoring_resources_are_not_booked_per_card() {
        let mut state = CacheState::default();
        let pod = create_mock_pod(
            "p1",
            &[&[
                ("gpu.intel.com/i915", 1),
                ("gpu.intel.com/i915_monitoring", 1),
            ]],
            &[],
        );
        state
            .adjust_pod_resources(&pod, AdjustmentSign::Add, "card0", "", "node-1")
            .unwrap();
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 1);
        assert_eq!(
            state.booked("node-1", "card0", "gpu.intel.com/i915_monitoring"),
            0
        );
    }

    #[test]
    fn test_pod_handler_added_is_idempotent() {
        let mut state = CacheState::default();
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        state
            .handle_pod_event(PodAction::Added, &pod, "card0", "", "node-1")
            .unwrap();
        // the informer may deliver Added after Bind already booked the pod
        state
            .handle_pod_event(PodAction::Updated, &pod, "card0", "", "node-1")
            .unwrap();
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 1);
    }

    #[test]
    fn test_pod_handler_delete_falls_back_to_recorded_annotation() {
        let mut state = CacheState::default();
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);
        state
            .handle_pod_event(PodAction::Added, &pod, "card0", "", "node-1")
            .unwrap();

        state
            .handle_pod_event(PodAction::Deleted, &pod, "", "", "node-1")
            .unwrap();
        assert_eq!(state.booked("node-1", "card0", "gpu.intel.com/i915"), 0);
        assert_eq!(state.pod_deschedule_status("default&p1"), None);
    }

    #[test]
    fn test_node_handler_reports_deschedule_changes_once() {
        let mut state = CacheState::default();
        let node = create_mock_node(
            "node-1",
            &[(
                "telemetry.aware.scheduling.policy/gas-deschedule-pods-card0",
                "true",
            )],
            &[],
        );

        let scan = state.handle_node_event(NodeAction::Added, &node).unwrap();
        assert_eq!(scan.cards, vec!["card0"]);
        state.commit_deschedule_scan(&scan);

        // unchanged sets on the next update are a no-op
        assert!(state.handle_node_event(NodeAction::Updated, &node).is_none());
    }

    #[test]
    fn test_node_handler_delete_forgets_sets() {
        let mut state = CacheState::default();
        let node = create_mock_node("node-1", &[], &[]);
        let scan = state.handle_node_event(NodeAction::Added, &node).unwrap();
        state.commit_deschedule_scan(&scan);

        state.handle_node_event(NodeAction::Deleted, &node);
        assert!(state.node("node-1").is_none());
        // a re-add reports the (empty) sets again
        assert!(state.handle_node_event(NodeAction::Added, &node).is_some());
    }
}
