use k8s_openapi::api::core::v1::{Node, Pod};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::annotation::{ContainerCards, ContainerTiles};
use crate::cache::{
    ContainerRequest, MONITORING_RESOURCES, NodeResources, NodeTiles, PLUGIN_RESOURCES,
    gpu_container_requests,
};
use crate::error::{Error, Result};
use crate::labels::{
    self, ALLOW_ANNOTATION, DENY_ANNOTATION, DISABLE_CARD_PREFIX, Labels, SAME_GPU_ANNOTATION,
    SINGLE_NUMA_ANNOTATION, TILES_RESOURCE, XELINK_ANNOTATION, XeLink,
};
use crate::resources::ResourceMap;
use crate::tiles::{self, TileControls};

/// Placement tunables from the command line.
#[derive(Debug, Clone, Default)]
pub struct PlacementOptions {
    /// Resource whose per-card usage drives balanced ordering, when set.
    pub balanced_resource: Option<String>,
    /// Whether `gas-deny` pod annotations are honored.
    pub enable_denylist: bool,
}

/// The per-node usage view a placement request works against. Filter hands in
/// a throwaway deep copy; Bind commits the winning selection through the
/// cache's adjustment path afterwards.
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    pub used: NodeResources,
    pub used_tiles: NodeTiles,
}

/// A complete placement decision for one pod on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSelection {
    /// Card names per GPU-requesting container, in container order.
    pub cards: ContainerCards,
    /// Tile assignments per GPU-requesting container.
    pub tiles: ContainerTiles,
    /// True when the first selected card is the node's preferred card.
    pub preferred: bool,
}

impl CardSelection {
    pub fn card_annotation(&self) -> String {
        crate::annotation::format_card_annotation(&self.cards)
    }

    pub fn tile_annotation(&self) -> String {
        if self.tiles.iter().all(|container| container.is_empty()) {
            String::new()
        } else {
            crate::annotation::format_tile_annotation(&self.tiles)
        }
    }
}

fn pod_annotation<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(name))
        .map(String::as_str)
}

fn pod_annotation_is_true(pod: &Pod, name: &str) -> bool {
    pod_annotation(pod, name) == Some("true")
}

fn csv_set(value: Option<&str>) -> HashSet<String> {
    value
        .map(|v| {
            v.split(',')
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Per-GPU capacity: every GPU-prefixed allocatable resource divided by the
/// GPU count, monitoring resources excluded. Nodes are assumed homogeneous.
fn per_gpu_capacity(node: &Node, gpu_count: i64) -> Result<ResourceMap> {
    let allocatable = node
        .status
        .as_ref()
        .and_then(|s| s.allocatable.as_ref())
        .ok_or_else(|| Error::WillNotFit("node advertises no allocatable resources".to_string()))?;
    let mut capacity: ResourceMap = allocatable
        .iter()
        .filter(|(name, _)| {
            labels::is_gpu_resource(name) && !MONITORING_RESOURCES.contains(&name.as_str())
        })
        .filter_map(|(name, quantity)| {
            quantity.0.parse::<i64>().ok().map(|v| (name.clone(), v))
        })
        .collect();
    capacity.divide(gpu_count)?;
    Ok(capacity)
}

struct SameGpuGroup {
    containers: HashSet<String>,
    combined: ResourceMap,
    plugin_units: i64,
    chosen_card: Option<String>,
}

/// Validates the `gas-same-gpu` annotation and combines the listed containers
/// into one synthetic single-GPU request.
fn same_gpu_group(pod: &Pod, requests: &[ContainerRequest]) -> Result<Option<SameGpuGroup>> {
    let Some(annotation) = pod_annotation(pod, SAME_GPU_ANNOTATION) else {
        return Ok(None);
    };
    let names: Vec<String> = annotation
        .split(',')
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    let distinct: HashSet<&String> = names.iter().collect();
    if distinct.len() < 2 || distinct.len() != names.len() {
        return Err(Error::Annotation(format!(
            "gas-same-gpu needs at least two distinct container names, got {annotation:?}"
        )));
    }
    let pod_containers: HashSet<&str> = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.as_str()).collect())
        .unwrap_or_default();
    for name in &names {
        if !pod_containers.contains(name.as_str()) {
            return Err(Error::Annotation(format!(
                "gas-same-gpu names unknown container {name}"
            )));
        }
    }

    let requesting: Vec<&ContainerRequest> = requests
        .iter()
        .filter(|r| distinct.contains(&r.name))
        .collect();
    if requesting.len() != distinct.len() {
        return Err(Error::ResConflict(
            "every gas-same-gpu container must request GPU resources".to_string(),
        ));
    }

    let mut combined = ResourceMap::new();
    let mut plugin_units = 0;
    for request in requesting {
        let plugin = plugin_resource(&request.resources)
            .ok_or_else(|| Error::ResConflict(format!(
                "same-gpu container {} requests no plugin resource",
                request.name
            )))?;
        if request.resources.get(plugin) != 1 {
            return Err(Error::ResConflict(format!(
                "same-gpu container {} must request exactly one {plugin}",
                request.name
            )));
        }
        if request.resources.get(TILES_RESOURCE) > 0 {
            return Err(Error::ResConflict(format!(
                "same-gpu container {} must not request tiles",
                request.name
            )));
        }
        for monitoring in MONITORING_RESOURCES {
            if request.resources.get(monitoring) > 0 {
                return Err(Error::ResConflict(format!(
                    "same-gpu container {} must not request monitoring resources",
                    request.name
                )));
            }
        }
        combined.add_all(&request.resources)?;
        plugin_units += 1;
    }
    // force the synthetic request to a single GPU; the surplus is booked on
    // the chosen card once it is known
    let plugin = plugin_resource(&combined).ok_or_else(|| {
        Error::ResConflict("gas-same-gpu containers request no plugin resource".to_string())
    })?;
    combined.subtract(plugin, plugin_units - 1)?;

    Ok(Some(SameGpuGroup {
        containers: distinct.into_iter().cloned().collect(),
        combined,
        plugin_units,
        chosen_card: None,
    }))
}

fn plugin_resource(request: &ResourceMap) -> Option<&'static str> {
    PLUGIN_RESOURCES
        .iter()
        .find(|resource| request.get(resource) > 0)
        .copied()
}

/// Everything derived from the node once per request.
struct NodeView {
    labels: Labels,
    cards: Vec<String>,
    capacity: ResourceMap,
    tiles_per_gpu: i64,
    controls: TileControls,
    links: Vec<XeLink>,
    preferred_card: Option<String>,
    disabled_cards: Vec<String>,
}

impl NodeView {
    fn build(node: &Node) -> Result<NodeView> {
        let node_labels = node.metadata.labels.clone().unwrap_or_default();
        let cards = labels::card_names(&node_labels);
        if cards.is_empty() {
            return Err(Error::WillNotFit("node has no enumerated GPUs".to_string()));
        }
        let capacity = per_gpu_capacity(node, cards.len() as i64)?;
        let tiles_per_gpu = capacity.get(TILES_RESOURCE);

        let mut controls = tiles::parse_tile_controls(&node_labels);
        if tiles_per_gpu > 0 {
            tiles::sanitize_tiles(&mut controls.disabled, tiles_per_gpu as u64);
            tiles::sanitize_tiles(&mut controls.descheduled, tiles_per_gpu as u64);
            tiles::sanitize_tiles(&mut controls.preferred, tiles_per_gpu as u64);
        }

        Ok(NodeView {
            links: labels::xe_links(&node_labels),
            preferred_card: labels::preferred_card(&node_labels),
            disabled_cards: labels::cards_with_action_label(&node_labels, DISABLE_CARD_PREFIX),
            labels: node_labels,
            cards,
            capacity,
            tiles_per_gpu,
            controls,
        })
    }

    fn is_card_usable(&self, card: &str, allow: &HashSet<String>, deny: &HashSet<String>) -> bool {
        if self.disabled_cards.iter().any(|c| c.as_str() == card) {
            return false;
        }
        if !allow.is_empty() && !allow.contains(card) {
            return false;
        }
        if !deny.is_empty() && deny.contains(card) {
            return false;
        }
        true
    }
}

/// Disabled tiles that are not already used become used so they cannot be
/// assigned; the numeric tile count moves with them.
fn mark_disabled_tiles_used(view: &NodeView, snapshot: &mut NodeSnapshot) {
    for (card, disabled) in &view.controls.disabled {
        for tile in disabled {
            let used = snapshot.used_tiles.entry(card.clone()).or_default();
            if used.insert(*tile) {
                let booked = snapshot.used.entry(card.clone()).or_default();
                if let Err(err) = booked.add(TILES_RESOURCE, 1) {
                    warn!(card = %card, %err, "cannot account disabled tile");
                }
            }
        }
    }
}

/// Selects per-container GPU sets (and tiles) for `pod` on `node`, mutating
/// `snapshot` with the in-flight bookings of the winning attempt.
pub fn check_for_space_and_retrieve_cards(
    pod: &Pod,
    node: &Node,
    snapshot: &mut NodeSnapshot,
    options: &PlacementOptions,
) -> Result<CardSelection> {
    let wants_xelink = pod_annotation_is_true(pod, XELINK_ANNOTATION);
    let wants_same_gpu = pod_annotation(pod, SAME_GPU_ANNOTATION).is_some();
    if wants_xelink && wants_same_gpu {
        return Err(Error::BadArgs(
            "gas-allocate-xelink and gas-same-gpu cannot be combined".to_string(),
        ));
    }

    let view = NodeView::build(node)?;
    mark_disabled_tiles_used(&view, snapshot);

    let requests = gpu_container_requests(pod);
    let mut same_gpu = same_gpu_group(pod, &requests)?;

    let allow = csv_set(pod_annotation(pod, ALLOW_ANNOTATION));
    let deny = if options.enable_denylist {
        csv_set(pod_annotation(pod, DENY_ANNOTATION))
    } else {
        HashSet::new()
    };

    let search_maps = build_search_maps(pod, &view);
    let node_name = node.metadata.name.as_deref().unwrap_or_default();

    for candidates in &search_maps {
        let ordered = order_candidates(candidates, &view, snapshot, options);
        let usable: Vec<String> = ordered
            .into_iter()
            .filter(|card| view.is_card_usable(card, &allow, &deny))
            .collect();
        if usable.is_empty() {
            continue;
        }

        let mut attempt = snapshot.clone();
        if let Some(group) = same_gpu.as_mut() {
            group.chosen_card = None;
        }
        match place_containers(
            &requests,
            &usable,
            &view,
            &mut attempt,
            wants_xelink,
            same_gpu.as_mut(),
            node_name,
        ) {
            Ok(mut selection) => {
                selection.preferred = view
                    .preferred_card
                    .as_deref()
                    .is_some_and(|preferred| {
                        selection
                            .cards
                            .iter()
                            .flatten()
                            .next()
                            .is_some_and(|first| first.as_str() == preferred)
                    });
                *snapshot = attempt;
                return Ok(selection);
            }
            Err(err) if err.is_will_not_fit() => {
                debug!(node = node_name, %err, "search map attempt failed");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(Error::not_enough_resources(node_name))
}

/// One search map per NUMA group under `gas-allocate-single-numa`, otherwise a
/// single map with every GPU. A missing NUMA map degrades to the single map.
fn build_search_maps(pod: &Pod, view: &NodeView) -> Vec<Vec<String>> {
    if pod_annotation_is_true(pod, SINGLE_NUMA_ANNOTATION) {
        let groups = labels::numa_card_groups(&view.labels);
        if !groups.is_empty() {
            return groups
                .into_iter()
                .map(|(_, cards)| {
                    cards
                        .into_iter()
                        .filter(|card| view.cards.contains(card))
                        .collect()
                })
                .collect();
        }
    }
    vec![view.cards.clone()]
}

/// Lexical ascending order; balanced-resource usage re-sorts it stably; a
/// preferred card otherwise moves to the front.
fn order_candidates(
    candidates: &[String],
    view: &NodeView,
    snapshot: &NodeSnapshot,
    options: &PlacementOptions,
) -> Vec<String> {
    let mut ordered: Vec<String> = candidates.to_vec();
    ordered.sort();

    if let Some(balanced) = options.balanced_resource.as_deref() {
        ordered.sort_by_key(|card| {
            snapshot
                .used
                .get(card)
                .map(|rm| rm.get(balanced))
                .unwrap_or(0)
        });
    } else if let Some(preferred) = view.preferred_card.as_deref()
        && let Some(position) = ordered.iter().position(|card| card.as_str() == preferred)
    {
        let card = ordered.remove(position);
        ordered.insert(0, card);
    }

    ordered
}

fn place_containers(
    requests: &[ContainerRequest],
    usable: &[String],
    view: &NodeView,
    attempt: &mut NodeSnapshot,
    wants_xelink: bool,
    mut same_gpu: Option<&mut SameGpuGroup>,
    node_name: &str,
) -> Result<CardSelection> {
    let mut selection = CardSelection {
        cards: Vec::new(),
        tiles: Vec::new(),
        preferred: false,
    };

    for request in requests {
        let group = same_gpu
            .as_deref_mut()
            .filter(|group| group.containers.contains(&request.name));

        let (cards, card_tiles) = if let Some(group) = group {
            match &group.chosen_card {
                Some(card) => (vec![card.clone()], Vec::new()),
                None => {
                    let card = place_same_gpu_group(group, usable, view, attempt, node_name)?;
                    (vec![card], Vec::new())
                }
            }
        } else if wants_xelink {
            place_xelink_container(request, usable, view, attempt, node_name)?
        } else {
            place_container(request, usable, view, attempt, node_name)?
        };

        selection.cards.push(cards);
        selection.tiles.push(card_tiles);
    }

    Ok(selection)
}

fn place_same_gpu_group(
    group: &mut SameGpuGroup,
    usable: &[String],
    view: &NodeView,
    attempt: &mut NodeSnapshot,
    node_name: &str,
) -> Result<String> {
    let synthetic = ContainerRequest {
        name: "same-gpu".to_string(),
        resources: group.combined.new_copy(),
    };
    let (cards, _) = place_container(&synthetic, usable, view, attempt, node_name)?;
    let card = cards
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_enough_resources(node_name))?;

    // the remaining group members consume real plugin units on the same card
    let plugin = plugin_resource(&group.combined).ok_or_else(|| {
        Error::ResConflict("gas-same-gpu containers request no plugin resource".to_string())
    })?;
    let booked = attempt.used.entry(card.clone()).or_default();
    booked.add(plugin, group.plugin_units - 1)?;

    group.chosen_card = Some(card.clone());
    Ok(card)
}

/// Fills a container's GPU slots from the ordered candidates, booking each
/// pick in the attempt snapshot. Each GPU is selected at most once per
/// container.
fn place_container(
    request: &ContainerRequest,
    usable: &[String],
    view: &NodeView,
    attempt: &mut NodeSnapshot,
    node_name: &str,
) -> Result<(Vec<String>, Vec<(String, Vec<u64>)>)> {
    let Some(plugin) = plugin_resource(&request.resources) else {
        // monitoring-only or tiles-only container, nothing to book per card
        return Ok((Vec::new(), Vec::new()));
    };
    let num_gpus = request.resources.get(plugin);
    let per_gpu = per_gpu_request(&request.resources, num_gpus)?;
    let tiles_per_gpu_request = per_gpu.get(TILES_RESOURCE);

    let mut chosen: Vec<String> = Vec::new();
    let mut chosen_tiles: Vec<(String, Vec<u64>)> = Vec::new();
    for _ in 0..num_gpus {
        let Some(card) = usable
            .iter()
            .find(|card| !chosen.contains(*card) && fits(card, &per_gpu, view, attempt))
        else {
            return Err(Error::not_enough_resources(node_name));
        };

        book(card, &per_gpu, attempt)?;
        if tiles_per_gpu_request > 0 {
            let assigned = assign_tiles(card, tiles_per_gpu_request as u64, view, attempt)
                .ok_or_else(|| Error::not_enough_resources(node_name))?;
            chosen_tiles.push((card.clone(), assigned));
        }
        chosen.push(card.clone());
    }

    Ok((chosen, chosen_tiles))
}

/// Xe-link placement: GPUs are taken in linked pairs, each contributing
/// exactly one linked tile whose counterpart is free on the other GPU.
fn place_xelink_container(
    request: &ContainerRequest,
    usable: &[String],
    view: &NodeView,
    attempt: &mut NodeSnapshot,
    node_name: &str,
) -> Result<(Vec<String>, Vec<(String, Vec<u64>)>)> {
    let Some(plugin) = plugin_resource(&request.resources) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let num_gpus = request.resources.get(plugin);
    if num_gpus % 2 != 0 {
        return Err(Error::BadArgs(format!(
            "xe-link requests need an even GPU count, container {} asks for {num_gpus}",
            request.name
        )));
    }
    let per_gpu = per_gpu_request(&request.resources, num_gpus)?;

    let mut chosen: Vec<String> = Vec::new();
    let mut chosen_tiles: Vec<(String, Vec<u64>)> = Vec::new();
    for _ in 0..num_gpus / 2 {
        let Some((card_a, tile_a, card_b, tile_b)) =
            find_linked_pair(usable, &chosen, &per_gpu, view, attempt)
        else {
            return Err(Error::not_enough_resources(node_name));
        };

        for (card, tile) in [(&card_a, tile_a), (&card_b, tile_b)] {
            book(card, &per_gpu, attempt)?;
            attempt
                .used_tiles
                .entry(card.clone())
                .or_default()
                .insert(tile);
            chosen_tiles.push((card.clone(), vec![tile]));
            chosen.push(card.clone());
        }
    }

    Ok((chosen, chosen_tiles))
}

fn find_linked_pair(
    usable: &[String],
    already_chosen: &[String],
    per_gpu: &ResourceMap,
    view: &NodeView,
    attempt: &NodeSnapshot,
) -> Option<(String, u64, String, u64)> {
    for card in usable.iter().filter(|c| !already_chosen.contains(*c)) {
        if !fits(card, per_gpu, view, attempt) {
            continue;
        }
        for link in &view.links {
            for tile in link.tiles_of(card) {
                if tile_used(attempt, card, tile) {
                    continue;
                }
                let Some((peer, peer_tile)) = link.counterpart(card, tile) else {
                    continue;
                };
                if peer == card.as_str()
                    || already_chosen.iter().any(|c| c.as_str() == peer)
                    || !usable.iter().any(|c| c.as_str() == peer)
                {
                    continue;
                }
                if tile_used(attempt, peer, peer_tile) {
                    continue;
                }
                if !fits(peer, per_gpu, view, attempt) {
                    continue;
                }
                return Some((card.clone(), tile, peer.to_string(), peer_tile));
            }
        }
    }
    None
}

fn tile_used(snapshot: &NodeSnapshot, card: &str, tile: u64) -> bool {
    snapshot
        .used_tiles
        .get(card)
        .is_some_and(|used| used.contains(&tile))
}

fn per_gpu_request(request: &ResourceMap, num_gpus: i64) -> Result<ResourceMap> {
    let mut per_gpu = request.new_copy();
    for monitoring in MONITORING_RESOURCES {
        let amount = per_gpu.get(monitoring);
        if amount > 0 {
            per_gpu.subtract(monitoring, amount)?;
        }
    }
    per_gpu.divide(num_gpus)?;
    Ok(per_gpu)
}

fn fits(card: &str, per_gpu: &ResourceMap, view: &NodeView, attempt: &NodeSnapshot) -> bool {
    let empty = ResourceMap::new();
    let booked = attempt.used.get(card).unwrap_or(&empty);
    per_gpu
        .iter()
        .all(|(resource, amount)| booked.get(resource) + amount <= view.capacity.get(resource))
}

fn book(card: &str, per_gpu: &ResourceMap, attempt: &mut NodeSnapshot) -> Result<()> {
    attempt
        .used
        .entry(card.to_string())
        .or_default()
        .add_all(per_gpu)
}

/// Picks `count` free tiles on `card`, preferred tiles first; when preferred
/// tiles are taken any free tile serves.
fn assign_tiles(
    card: &str,
    count: u64,
    view: &NodeView,
    attempt: &mut NodeSnapshot,
) -> Option<Vec<u64>> {
    let used = attempt.used_tiles.entry(card.to_string()).or_default();
    let mut free: Vec<u64> = (0..view.tiles_per_gpu as u64)
        .filter(|tile| !used.contains(tile))
        .collect();
    if (free.len() as u64) < count {
        return None;
    }
    if let Some(preferred) = view.controls.preferred.get(card) {
        tiles::reorder_preferred_tiles_first(&mut free, preferred);
    }
    let assigned: Vec<u64> = free.into_iter().take(count as usize).collect();
    for tile in &assigned {
        used.insert(*tile);
    }
    Some(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{create_mock_named_pod, create_mock_node, create_mock_pod};

    fn options() -> PlacementOptions {
        PlacementOptions {
            balanced_resource: None,
            enable_denylist: true,
        }
    }

    fn place(
        pod: &k8s_openapi::api::core::v1::Pod,
        node: &k8s_openapi::api::core::v1::Node,
        snapshot: &mut NodeSnapshot,
    ) -> Result<CardSelection> {
        check_for_space_and_retrieve_cards(pod, node, snapshot, &options())
    }

    #[test]
    fn test_basic_fit_single_card() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card0");
        assert_eq!(
            snapshot.used.get("card0").unwrap().get("gpu.intel.com/i915"),
            1
        );
    }

    #[test]
    fn test_will_not_fit_when_capacity_used() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        snapshot
            .used
            .entry("card0".to_string())
            .or_default()
            .add("gpu.intel.com/i915", 1)
            .unwrap();
        let err = place(&pod, &node, &mut snapshot).unwrap_err();
        assert!(err.to_string().contains("Not enough GPU-resources"));
    }

    #[test]
    fn test_deny_annotation_excludes_card() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1)]],
            &[("gas-deny", "card0")],
        );

        let mut snapshot = NodeSnapshot::default();
        assert!(place(&pod, &node, &mut snapshot).is_err());
    }

    #[test]
    fn test_deny_annotation_ignored_when_feature_off() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1)]],
            &[("gas-deny", "card0")],
        );

        let mut snapshot = NodeSnapshot::default();
        let opts = PlacementOptions {
            balanced_resource: None,
            enable_denylist: false,
        };
        let selection =
            check_for_space_and_retrieve_cards(&pod, &node, &mut snapshot, &opts).unwrap();
        assert_eq!(selection.card_annotation(), "card0");
    }

    #[test]
    fn test_allow_annotation_restricts_cards() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0.1")],
            &[("gpu.intel.com/i915", 2)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1)]],
            &[("gas-allow", "card1")],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card1");
    }

    #[test]
    fn test_disabled_card_is_never_selected() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1"),
                (
                    "telemetry.aware.scheduling.policy/gas-disable-card0",
                    "true",
                ),
            ],
            &[("gpu.intel.com/i915", 2)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card1");
    }

    #[test]
    fn test_disabled_card_pci_group_expansion() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1.2"),
                ("gpu.intel.com/pci-groups", "0.1_2"),
                (
                    "telemetry.aware.scheduling.policy/gas-disable-card0",
                    "PCI_GROUP",
                ),
            ],
            &[("gpu.intel.com/i915", 3)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card2");
    }

    #[test]
    fn test_preferred_card_goes_first() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1.2"),
                ("telemetry.aware.scheduling.policy/gas-prefer-gpu", "card2"),
            ],
            &[("gpu.intel.com/i915", 3)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card2");
        assert!(selection.preferred);
    }

    #[test]
    fn test_balanced_resource_prefers_least_used() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0.1")],
            &[("gpu.intel.com/i915", 4)],
        );
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        snapshot
            .used
            .entry("card0".to_string())
            .or_default()
            .add("gpu.intel.com/i915", 1)
            .unwrap();
        let opts = PlacementOptions {
            balanced_resource: Some("gpu.intel.com/i915".to_string()),
            enable_denylist: true,
        };
        let selection =
            check_for_space_and_retrieve_cards(&pod, &node, &mut snapshot, &opts).unwrap();
        assert_eq!(selection.card_annotation(), "card1");
    }

    #[test]
    fn test_multi_gpu_container_uses_distinct_cards() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0.1")],
            &[("gpu.intel.com/i915", 2), ("gpu.intel.com/memory.max", 2000)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 2), ("gpu.intel.com/memory.max", 2000)]],
            &[],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card0,card1");
        // the memory request is split across the two cards
        assert_eq!(
            snapshot
                .used
                .get("card0")
                .unwrap()
                .get("gpu.intel.com/memory.max"),
            1000
        );
    }

    #[test]
    fn test_tiles_assigned_with_preference() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0"),
                (
                    "telemetry.aware.scheduling.policy/gas-tile-preferred-card0",
                    "gt1",
                ),
            ],
            &[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 2)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 1)]],
            &[],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.tile_annotation(), "card0:gt1");
    }

    #[test]
    fn test_preferred_tile_taken_falls_back_to_free() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0"),
                (
                    "telemetry.aware.scheduling.policy/gas-tile-preferred-card0",
                    "gt1",
                ),
            ],
            &[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 2)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 1)]],
            &[],
        );

        let mut snapshot = NodeSnapshot::default();
        snapshot
            .used_tiles
            .entry("card0".to_string())
            .or_default()
            .insert(1);
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.tile_annotation(), "card0:gt0");
    }

    #[test]
    fn test_disabled_tile_is_not_assigned() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0"),
                (
                    "telemetry.aware.scheduling.policy/gas-tile-disable-card0_gt0",
                    "true",
                ),
            ],
            &[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 2)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1), ("gpu.intel.com/tiles", 1)]],
            &[],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.tile_annotation(), "card0:gt1");
    }

    #[test]
    fn test_xelink_pair_selection() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1"),
                ("gpu.intel.com/xe-links", "0.0-1.0"),
            ],
            &[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 4)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 2)]],
            &[("gas-allocate-xelink", "true")],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card0,card1");
        assert_eq!(selection.tile_annotation(), "card0:gt0,card1:gt0");
    }

    #[test]
    fn test_xelink_odd_count_is_bad_args() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1"),
                ("gpu.intel.com/xe-links", "0.0-1.0"),
            ],
            &[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 4)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1)]],
            &[("gas-allocate-xelink", "true")],
        );

        let mut snapshot = NodeSnapshot::default();
        let err = place(&pod, &node, &mut snapshot).unwrap_err();
        assert!(matches!(err, Error::BadArgs(_)));
    }

    #[test]
    fn test_xelink_busy_tile_blocks_link() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1"),
                ("gpu.intel.com/xe-links", "0.0-1.0"),
            ],
            &[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 4)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 2), ("gpu.intel.com/tiles", 2)]],
            &[("gas-allocate-xelink", "true")],
        );

        let mut snapshot = NodeSnapshot::default();
        snapshot
            .used_tiles
            .entry("card1".to_string())
            .or_default()
            .insert(0);
        assert!(place(&pod, &node, &mut snapshot).is_err());
    }

    #[test]
    fn test_xelink_with_same_gpu_is_bad_args() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 1)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 1)]],
            &[
                ("gas-allocate-xelink", "true"),
                ("gas-same-gpu", "container0,container1"),
            ],
        );

        let mut snapshot = NodeSnapshot::default();
        assert!(matches!(
            place(&pod, &node, &mut snapshot),
            Err(Error::BadArgs(_))
        ));
    }

    #[test]
    fn test_same_gpu_containers_share_one_card() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0.1")],
            &[("gpu.intel.com/i915", 4)],
        );
        let pod = create_mock_named_pod(
            "p1",
            &[
                ("c1", &[("gpu.intel.com/i915", 1)]),
                ("c2", &[("gpu.intel.com/i915", 1)]),
            ],
            &[("gas-same-gpu", "c1,c2")],
        );

        let mut snapshot = NodeSnapshot::default();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card0|card0");
        // both plugin units land on the chosen card
        assert_eq!(
            snapshot.used.get("card0").unwrap().get("gpu.intel.com/i915"),
            2
        );
    }

    #[test]
    fn test_same_gpu_rejects_multi_gpu_member() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0.1")],
            &[("gpu.intel.com/i915", 4)],
        );
        let pod = create_mock_named_pod(
            "p1",
            &[
                ("c1", &[("gpu.intel.com/i915", 2)]),
                ("c2", &[("gpu.intel.com/i915", 1)]),
            ],
            &[("gas-same-gpu", "c1,c2")],
        );

        let mut snapshot = NodeSnapshot::default();
        assert!(matches!(
            place(&pod, &node, &mut snapshot),
            Err(Error::ResConflict(_))
        ));
    }

    #[test]
    fn test_same_gpu_rejects_unknown_container() {
        let node = create_mock_node(
            "node-1",
            &[("gpu.intel.com/gpu-numbers", "0")],
            &[("gpu.intel.com/i915", 2)],
        );
        let pod = create_mock_named_pod(
            "p1",
            &[("c1", &[("gpu.intel.com/i915", 1)])],
            &[("gas-same-gpu", "c1,ghost")],
        );

        let mut snapshot = NodeSnapshot::default();
        assert!(matches!(
            place(&pod, &node, &mut snapshot),
            Err(Error::Annotation(_))
        ));
    }

    #[test]
    fn test_single_numa_keeps_containers_in_one_group() {
        let node = create_mock_node(
            "node-1",
            &[
                ("gpu.intel.com/gpu-numbers", "0.1.2.3"),
                ("gpu.intel.com/numa-gpu-map", "0-0.1_1-2.3"),
            ],
            &[("gpu.intel.com/i915", 4)],
        );
        let pod = create_mock_pod(
            "p1",
            &[&[("gpu.intel.com/i915", 2)]],
            &[("gas-allocate-single-numa", "true")],
        );

        let mut snapshot = NodeSnapshot::default();
        // NUMA group 0 has one card occupied, so group 1 must serve both GPUs
        snapshot
            .used
            .entry("card0".to_string())
            .or_default()
            .add("gpu.intel.com/i915", 1)
            .unwrap();
        let selection = place(&pod, &node, &mut snapshot).unwrap();
        assert_eq!(selection.card_annotation(), "card2,card3");
    }

    #[test]
    fn test_node_without_gpus_will_not_fit() {
        let node = create_mock_node("node-1", &[], &[("gpu.intel.com/i915", 1)]);
        let pod = create_mock_pod("p1", &[&[("gpu.intel.com/i915", 1)]], &[]);

        let mut snapshot = NodeSnapshot::default();
        assert!(matches!(
            place(&pod, &node, &mut snapshot),
            Err(Error::WillNotFit(_))
        ));
    }
}
