use crate::error::{Error, Result};
use crate::labels::TILE_PREFIX;

/// Per-container card lists, in container order.
pub type ContainerCards = Vec<Vec<String>>;

/// Per-container `(card, tiles)` assignments, in container and card order.
pub type ContainerTiles = Vec<Vec<(String, Vec<u64>)>>;

/// Parses `card0,card1|card2` into per-container card lists. Containers are
/// separated by `|`; a container with no GPUs contributes an empty list.
pub fn parse_card_annotation(value: &str) -> ContainerCards {
    value
        .split('|')
        .map(|segment| {
            segment
                .split(',')
                .filter(|card| !card.is_empty())
                .map(str::to_string)
                .collect()
        })
        .collect()
}

/// Parses `card0:gt0+gt1,card1:gt2|…` into per-container tile assignments.
pub fn parse_tile_annotation(value: &str) -> Result<ContainerTiles> {
    let mut containers = Vec::new();
    for segment in value.split('|') {
        let mut cards = Vec::new();
        for entry in segment.split(',').filter(|e| !e.is_empty()) {
            let (card, tile_list) = entry
                .split_once(':')
                .ok_or_else(|| Error::Annotation(format!("tile entry {entry} lacks a card")))?;
            let mut tiles = Vec::new();
            for tile in tile_list.split('+').filter(|t| !t.is_empty()) {
                let index = tile
                    .strip_prefix(TILE_PREFIX)
                    .and_then(|t| t.parse::<u64>().ok())
                    .ok_or_else(|| {
                        Error::Annotation(format!("tile entry {entry} has malformed tile {tile}"))
                    })?;
                tiles.push(index);
            }
            cards.push((card.to_string(), tiles));
        }
        containers.push(cards);
    }
    Ok(containers)
}

pub fn format_card_annotation(cards: &ContainerCards) -> String {
    cards
        .iter()
        .map(|container| container.join(","))
        .collect::<Vec<_>>()
        .join("|")
}

pub fn format_tile_annotation(tiles: &ContainerTiles) -> String {
    tiles
        .iter()
        .map(|container| {
            container
                .iter()
                .map(|(card, indices)| {
                    let list = indices
                        .iter()
                        .map(|i| format!("{TILE_PREFIX}{i}"))
                        .collect::<Vec<_>>()
                        .join("+");
                    format!("{card}:{list}")
                })
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect::<Vec<_>>()
        .join("|")
}
