use std::collections::HashMap;
use tracing::warn;

use crate::labels::{
    self, Labels, TILE_DESCHEDULE_PREFIX, TILE_DISABLE_PREFIX, TILE_PREFERRED_PREFIX, TILE_PREFIX,
};

/// Card name to tile indices.
pub type TileMapping = HashMap<String, Vec<u64>>;

/// Tile-level controls parsed from a node's telemetry labels.
#[derive(Debug, Clone, Default)]
pub struct TileControls {
    pub disabled: TileMapping,
    pub descheduled: TileMapping,
    pub preferred: TileMapping,
}

/// Parses `gas-tile-{disable,deschedule,preferred}` labels under the telemetry
/// namespace into per-card tile lists. Disable and deschedule carry
/// `card<N>_gt<I>` in the key; preferred may instead name just the card and
/// supply `gt<I>` in the value.
pub fn parse_tile_controls(labels: &Labels) -> TileControls {
    let mut controls = TileControls::default();

    for (key, value) in labels {
        let Some((_, rest)) = labels::telemetry_label_parts(key) else {
            continue;
        };
        if let Some(suffix) = rest.strip_prefix(TILE_DISABLE_PREFIX) {
            insert_tile(&mut controls.disabled, suffix, None, key);
        } else if let Some(suffix) = rest.strip_prefix(TILE_DESCHEDULE_PREFIX) {
            insert_tile(&mut controls.descheduled, suffix, None, key);
        } else if let Some(suffix) = rest.strip_prefix(TILE_PREFERRED_PREFIX) {
            insert_tile(&mut controls.preferred, suffix, Some(value), key);
        }
    }

    controls
}

fn insert_tile(mapping: &mut TileMapping, suffix: &str, value: Option<&str>, key: &str) {
    let (card, tile) = match suffix.split_once('_') {
        Some((card, tile_part)) => (card, parse_tile_index(tile_part)),
        // no tile in the key: the label value names the tile
        None => (suffix, value.and_then(parse_tile_index)),
    };
    let Some(tile) = tile else {
        warn!(label = key, "malformed tile label, skipping");
        return;
    };
    let tiles = mapping.entry(card.to_string()).or_default();
    if !tiles.contains(&tile) {
        tiles.push(tile);
    }
}

fn parse_tile_index(part: &str) -> Option<u64> {
    part.strip_prefix(TILE_PREFIX)?.parse().ok()
}

/// Drops tile indices at or beyond the per-card tile capacity.
pub fn sanitize_tiles(mapping: &mut TileMapping, tiles_per_card: u64) {
    for (card, tiles) in mapping.iter_mut() {
        let before = tiles.len();
        tiles.retain(|tile| *tile < tiles_per_card);
        if tiles.len() != before {
            warn!(card = %card, tiles_per_card, "dropped tile indices beyond capacity");
        }
    }
    mapping.retain(|_, tiles| !tiles.is_empty());
}

/// Merges `source`'s tile lists into `target`, skipping duplicates.
pub fn combine_mappings(source: &TileMapping, target: &mut TileMapping) {
    for (card, tiles) in source {
        let merged = target.entry(card.clone()).or_default();
        for tile in tiles {
            if !merged.contains(tile) {
                merged.push(*tile);
            }
        }
    }
}

/// Moves each preferred tile to the lowest unused front slot, preserving the
/// relative order of the rest.
pub fn reorder_preferred_tiles_first(tiles: &mut Vec<u64>, preferred: &[u64]) {
    let mut reordered = Vec::with_capacity(tiles.len());
    for tile in preferred {
        if tiles.contains(tile) && !reordered.contains(tile) {
            reordered.push(*tile);
        }
    }
    for tile in tiles.iter() {
        if !reordered.contains(tile) {
            reordered.push(*tile);
        }
    }
    *tiles = reordered;
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
    fn test_parse_tile_controls() {
        let l = labels(&[
            ("telemetry.aware.scheduling.p/gas-tile-disable-card0_gt3", "true"),
            ("telemetry.aware.scheduling.p/gas-tile-deschedule-card1_gt0", "true"),
            ("telemetry.aware.scheduling.p/gas-tile-preferred-card0", "gt1"),
            ("unrelated/label", "x"),
        ]);
        let controls = parse_tile_controls(&l);
        assert_eq!(controls.disabled.get("card0"), Some(&vec![3]));
        assert_eq!(controls.descheduled.get("card1"), Some(&vec![0]));
        assert_eq!(controls.preferred.get("card0"), Some(&vec![1]));
    }

    #[test]
    fn test_parse_tile_controls_skips_malformed() {
        let l = labels(&[
            ("telemetry.aware.scheduling.p/gas-tile-disable-card0_tile3", "true"),
            ("telemetry.aware.scheduling.p/gas-tile-preferred-card2", "banana"),
        ]);
        let controls = parse_tile_controls(&l);
        assert!(controls.disabled.is_empty());
        assert!(controls.preferred.is_empty());
    }

    #[test]
    fn test_sanitize_tiles_drops_beyond_capacity() {
        let mut mapping: TileMapping =
            [("card0".to_string(), vec![0, 1, 4])].into_iter().collect();
        sanitize_tiles(&mut mapping, 2);
        assert_eq!(mapping.get("card0"), Some(&vec![0, 1]));

        let mut all_beyond: TileMapping = [("card1".to_string(), vec![7])].into_iter().collect();
        sanitize_tiles(&mut all_beyond, 2);
        assert!(all_beyond.is_empty());
    }

    #[test]
    fn test_combine_mappings() {
        let source: TileMapping = [("card0".to_string(), vec![1, 2])].into_iter().collect();
        let mut target: TileMapping = [("card0".to_string(), vec![0, 1])].into_iter().collect();
        combine_mappings(&source, &mut target);
        assert_eq!(target.get("card0"), Some(&vec![0, 1, 2]));
    }

    #[test]
    fn test_reorder_preferred_tiles_first() {
        let mut tiles = vec![0, 1, 2, 3];
        reorder_preferred_tiles_first(&mut tiles, &[2, 1]);
        assert_eq!(tiles, vec![2, 1, 0, 3]);
    }

    #[test]
    fn test_reorder_ignores_preferred_not_present() {
        let mut tiles = vec![0, 3];
        reorder_preferred_tiles_first(&mut tiles, &[5, 3]);
        assert_eq!(tiles, vec![3, 0]);
    }
}
