use std::collections::BTreeMap;
use tracing::warn;

/// Resource names the device plugin advertises.
pub const GPU_PREFIX: &str = "gpu.intel.com/";
pub const I915_RESOURCE: &str = "gpu.intel.com/i915";
pub const XE_RESOURCE: &str = "gpu.intel.com/xe";
pub const TILES_RESOURCE: &str = "gpu.intel.com/tiles";
pub const I915_MONITORING_RESOURCE: &str = "gpu.intel.com/i915_monitoring";
pub const XE_MONITORING_RESOURCE: &str = "gpu.intel.com/xe_monitoring";

/// Node labels written by the device plugin.
pub const GPU_NUMBERS_LABEL: &str = "gpu.intel.com/gpu-numbers";
/// Deprecated enumeration consulted only when `gpu-numbers` is absent.
pub const CARDS_LABEL: &str = "gpu.intel.com/cards";
pub const PCI_GROUPS_LABEL: &str = "gpu.intel.com/pci-groups";
pub const XE_LINKS_LABEL: &str = "gpu.intel.com/xe-links";
pub const NUMA_MAP_LABEL: &str = "gpu.intel.com/numa-gpu-map";

/// Telemetry policies label nodes under this namespace prefix; the GPU
/// extender only interprets the part after the `/`.
pub const TELEMETRY_NS_PREFIX: &str = "telemetry.aware.scheduling.";
pub const DISABLE_CARD_PREFIX: &str = "gas-disable-";
pub const DESCHEDULE_PODS_PREFIX: &str = "gas-deschedule-pods-";
pub const PREFER_GPU_LABEL: &str = "gas-prefer-gpu";
pub const TILE_DISABLE_PREFIX: &str = "gas-tile-disable-";
pub const TILE_DESCHEDULE_PREFIX: &str = "gas-tile-deschedule-";
pub const TILE_PREFERRED_PREFIX: &str = "gas-tile-preferred-";
/// Label value that widens a card action to its whole PCI group.
pub const PCI_GROUP_VALUE: &str = "PCI_GROUP";

/// Pod annotations produced by Bind.
pub const CARDS_ANNOTATION: &str = "gas-container-cards";
pub const TILES_ANNOTATION: &str = "gas-container-tiles";
pub const TIMESTAMP_ANNOTATION: &str = "gas-ts";

/// Pod annotations consumed by placement.
pub const ALLOW_ANNOTATION: &str = "gas-allow";
pub const DENY_ANNOTATION: &str = "gas-deny";
pub const XELINK_ANNOTATION: &str = "gas-allocate-xelink";
pub const SAME_GPU_ANNOTATION: &str = "gas-same-gpu";
pub const SINGLE_NUMA_ANNOTATION: &str = "gas-allocate-single-numa";

/// Pod label consumed by the external descheduler.
pub const POD_DESCHEDULE_LABEL: &str = "gpu.aware.scheduling/deschedule-pod";
pub const POD_DESCHEDULE_VALUE: &str = "gpu";

/// Pod label linking a pod to its telemetry policy.
pub const TELEMETRY_POLICY_LABEL: &str = "telemetry-policy";

pub const CARD_PREFIX: &str = "card";
pub const TILE_PREFIX: &str = "gt";

/// Continuation chunks (`<label>2`, `<label>3`, …) must begin with this
/// marker, a workaround for the Kubernetes label value length limit.
pub const CONTINUATION_MARKER: char = 'Z';

pub type Labels = BTreeMap<String, String>;

pub fn is_gpu_resource(name: &str) -> bool {
    name.starts_with(GPU_PREFIX)
}

/// Splits a `telemetry.aware.scheduling.<policy>/<rest>` label key into the
/// policy name and the rest.
pub fn telemetry_label_parts(key: &str) -> Option<(&str, &str)> {
    let remainder = key.strip_prefix(TELEMETRY_NS_PREFIX)?;
    remainder.split_once('/')
}

/// Concatenates a label value split across `<name>`, `<name>2`, `<name>3`, …
/// suffixes. Every continuation chunk must start with the `Z` marker, which is
/// stripped; a chunk without the marker invalidates the whole value.
pub fn concat_split_label(labels: &Labels, name: &str) -> String {
    let mut value = match labels.get(name) {
        Some(v) => v.clone(),
        None => return String::new(),
    };

    for index in 2.. {
        let Some(chunk) = labels.get(&format!("{name}{index}")) else {
            break;
        };
        match chunk.strip_prefix(CONTINUATION_MARKER) {
            Some(rest) => value.push_str(rest),
            None => {
                warn!(label = name, index, "split label continuation does not start with marker");
                return String::new();
            }
        }
    }

    value
}

/// GPU numbers enumerated on the node, in label order.
///
/// `gpu-numbers` carries bare numbers (`0.1.2`); the deprecated `cards` label
/// carries card names (`card0.card1`) and is consulted only as a fallback.
pub fn gpu_numbers(labels: &Labels) -> Vec<String> {
    let concatenated = concat_split_label(labels, GPU_NUMBERS_LABEL);
    if !concatenated.is_empty() {
        return split_nonempty(&concatenated, '.');
    }

    let cards = concat_split_label(labels, CARDS_LABEL);
    split_nonempty(&cards, '.')
        .iter()
        .filter_map(|name| name.strip_prefix(CARD_PREFIX).map(str::to_string))
        .collect()
}

/// Card names derived from the enumerated GPU numbers, in label order.
pub fn card_names(labels: &Labels) -> Vec<String> {
    gpu_numbers(labels)
        .iter()
        .map(|n| format!("{CARD_PREFIX}{n}"))
        .collect()
}

pub fn card_number(card: &str) -> Option<u64> {
    card.strip_prefix(CARD_PREFIX)?.parse().ok()
}

fn split_nonempty(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// PCI groups: `_`-separated groups of `.`-separated GPU numbers.
pub fn pci_groups(labels: &Labels) -> Vec<Vec<String>> {
    let value = concat_split_label(labels, PCI_GROUPS_LABEL);
    value
        .split('_')
        .filter(|group| !group.is_empty())
        .map(|group| split_nonempty(group, '.'))
        .collect()
}

/// All card names in `card`'s PCI group, or empty when the card belongs to no
/// group.
pub fn pci_group_cards(labels: &Labels, card: &str) -> Vec<String> {
    let Some(number) = card.strip_prefix(CARD_PREFIX) else {
        return Vec::new();
    };
    for group in pci_groups(labels) {
        if group.iter().any(|n| n == number) {
            return group.iter().map(|n| format!("{CARD_PREFIX}{n}")).collect();
        }
    }
    Vec::new()
}

/// Appends the PCI-group siblings of `card` into `cards`, skipping duplicates.
pub fn add_pci_group_cards(labels: &Labels, card: &str, cards: &mut Vec<String>) {
    for sibling in pci_group_cards(labels, card) {
        if !cards.contains(&sibling) {
            cards.push(sibling);
        }
    }
}

/// Cards named by `<prefix><card>` keys under the telemetry label namespace.
/// A value equal to `PCI_GROUP` widens the action to the card's PCI siblings.
pub fn cards_with_action_label(labels: &Labels, prefix: &str) -> Vec<String> {
    let mut cards = Vec::new();
    for (key, value) in labels {
        let Some((_, rest)) = telemetry_label_parts(key) else {
            continue;
        };
        let Some(card) = rest.strip_prefix(prefix) else {
            continue;
        };
        if !cards.contains(&card.to_string()) {
            cards.push(card.to_string());
        }
        if value == PCI_GROUP_VALUE {
            add_pci_group_cards(labels, card, &mut cards);
        }
    }
    cards
}

/// The preferred card named by a `gas-prefer-gpu` label, if any.
pub fn preferred_card(labels: &Labels) -> Option<String> {
    labels.iter().find_map(|(key, value)| {
        telemetry_label_parts(key)
            .filter(|(_, rest)| *rest == PREFER_GPU_LABEL)
            .map(|_| value.clone())
    })
}

/// An xe-link between one tile on each of two cards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XeLink {
    pub card_a: String,
    pub tile_a: u64,
    pub card_b: String,
    pub tile_b: u64,
}

impl XeLink {
    /// The linked counterpart of `(card, tile)`, when this link touches it.
    pub fn counterpart(&self, card: &str, tile: u64) -> Option<(&str, u64)> {
        if self.card_a == card && self.tile_a == tile {
            Some((&self.card_b, self.tile_b))
        } else if self.card_b == card && self.tile_b == tile {
            Some((&self.card_a, self.tile_a))
        } else {
            None
        }
    }

    pub fn tiles_of(&self, card: &str) -> Vec<u64> {
        let mut tiles = Vec::new();
        if self.card_a == card {
            tiles.push(self.tile_a);
        }
        if self.card_b == card {
            tiles.push(self.tile_b);
        }
        tiles
    }
}

/// Xe-link entries `A.t-B.u` where `A` and `B` are level-zero device indices:
/// positions in the numerically sorted GPU number list.
pub fn xe_links(labels: &Labels) -> Vec<XeLink> {
    let mut numbers: Vec<u64> = gpu_numbers(labels)
        .iter()
        .filter_map(|n| n.parse().ok())
        .collect();
    numbers.sort_unstable();

    let card_for_index = |index: usize| -> Option<String> {
        numbers.get(index).map(|n| format!("{CARD_PREFIX}{n}"))
    };

    let value = concat_split_label(labels, XE_LINKS_LABEL);
    let mut links = Vec::new();
    for entry in value.split('_').filter(|e| !e.is_empty()) {
        let Some((a, b)) = entry.split_once('-') else {
            warn!(entry, "malformed xe-link entry");
            continue;
        };
        let parse_endpoint = |end: &str| -> Option<(usize, u64)> {
            let (device, tile) = end.split_once('.')?;
            Some((device.parse().ok()?, tile.parse().ok()?))
        };
        match (parse_endpoint(a), parse_endpoint(b)) {
            (Some((dev_a, tile_a)), Some((dev_b, tile_b))) => {
                match (card_for_index(dev_a), card_for_index(dev_b)) {
                    (Some(card_a), Some(card_b)) => links.push(XeLink {
                        card_a,
                        tile_a,
                        card_b,
                        tile_b,
                    }),
                    _ => warn!(entry, "xe-link endpoint device index out of range"),
                }
            }
            _ => warn!(entry, "malformed xe-link endpoint"),
        }
    }
    links
}

/// NUMA grouping `<numa>-<gpu-number-list>` entries separated by `_`, returned
/// as card-name groups in NUMA order.
pub fn numa_card_groups(labels: &Labels) -> Vec<(u64, Vec<String>)> {
    let value = concat_split_label(labels, NUMA_MAP_LABEL);
    let mut groups = Vec::new();
    for entry in value.split('_').filter(|e| !e.is_empty()) {
        let Some((numa, numbers)) = entry.split_once('-') else {
            warn!(entry, "malformed numa-gpu-map entry");
            continue;
        };
        let Ok(numa) = numa.parse::<u64>() else {
            warn!(entry, "malformed numa node number");
            continue;
        };
        let cards = split_nonempty(numbers, '.')
            .iter()
            .map(|n| format!("{CARD_PREFIX}{n}"))
            .collect();
        groups.push((numa, cards));
    }
    groups.sort_by_key(|(numa, _)| *numa);
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(entries: &[(&str, &str)]) -> Labels {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_concat_split_label() {
        let l = labels(&[
            ("gpu.intel.com/gpu-numbers", "0.1"),
            ("gpu.intel.com/gpu-numbers2", "Z.2.3"),
            ("gpu.intel.com/gpu-numbers3", "Z.4"),
        ]);
        assert_eq!(concat_split_label(&l, GPU_NUMBERS_LABEL), "0.1.2.3.4");
    }

    #[test]
    fn test_concat_split_label_invalid_continuation() {
        let l = labels(&[
            ("gpu.intel.com/gpu-numbers", "0.1"),
            ("gpu.intel.com/gpu-numbers2", ".2.3"),
        ]);
        assert_eq!(concat_split_label(&l, GPU_NUMBERS_LABEL), "");
    }

    #[test]
    fn test_gpu_numbers_prefers_gpu_numbers_label() {
        let l = labels(&[
            ("gpu.intel.com/gpu-numbers", "2.0"),
            ("gpu.intel.com/cards", "card5.card6"),
        ]);
        assert_eq!(gpu_numbers(&l), vec!["2", "0"]);
    }

    #[test]
    fn test_gpu_numbers_falls_back_to_cards() {
        let l = labels(&[("gpu.intel.com/cards", "card0.card1")]);
        assert_eq!(gpu_numbers(&l), vec!["0", "1"]);
        assert_eq!(card_names(&l), vec!["card0", "card1"]);
    }

    #[test]
    fn test_pci_group_cards() {
        let l = labels(&[("gpu.intel.com/pci-groups", "0.1_2.3")]);
        assert_eq!(pci_group_cards(&l, "card2"), vec!["card2", "card3"]);
        assert!(pci_group_cards(&l, "card7").is_empty());
    }

    #[test]
    fn test_add_pci_group_cards_no_duplicates() {
        let l = labels(&[("gpu.intel.com/pci-groups", "0.1")]);
        let mut cards = vec!["card1".to_string()];
        add_pci_group_cards(&l, "card0", &mut cards);
        assert_eq!(cards, vec!["card1", "card0"]);
    }

    #[test]
    fn test_cards_with_action_label_expands_pci_group() {
        let l = labels(&[
            (
                "telemetry.aware.scheduling.policy/gas-deschedule-pods-card0",
                "PCI_GROUP",
            ),
            ("gpu.intel.com/pci-groups", "0.1_2.3"),
        ]);
        assert_eq!(
            cards_with_action_label(&l, DESCHEDULE_PODS_PREFIX),
            vec!["card0", "card1"]
        );
    }

    #[test]
    fn test_preferred_card() {
        let l = labels(&[(
            "telemetry.aware.scheduling.policy/gas-prefer-gpu",
            "card2",
        )]);
        assert_eq!(preferred_card(&l), Some("card2".to_string()));
    }

    #[test]
    fn test_xe_links_resolve_l0_indices_via_sorted_numbers() {
        // numbers 4 and 2: sorted order is [2, 4], so index 0 is card2
        let l = labels(&[
            ("gpu.intel.com/gpu-numbers", "4.2"),
            ("gpu.intel.com/xe-links", "0.0-1.1"),
        ]);
        let links = xe_links(&l);
        assert_eq!(
            links,
            vec![XeLink {
                card_a: "card2".to_string(),
                tile_a: 0,
                card_b: "card4".to_string(),
                tile_b: 1,
            }]
        );
        assert_eq!(links[0].counterpart("card2", 0), Some(("card4", 1)));
        assert_eq!(links[0].counterpart("card2", 1), None);
    }

    #[test]
    fn test_numa_card_groups() {
        let l = labels(&[("gpu.intel.com/numa-gpu-map", "1-2.3_0-0.1")]);
        assert_eq!(
            numa_card_groups(&l),
            vec![
                (0, vec!["card0".to_string(), "card1".to_string()]),
                (1, vec!["card2".to_string(), "card3".to_string()]),
            ]
        );
    }
}
