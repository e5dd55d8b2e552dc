//! Physical spot layout used to seed an empty store.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::model::{SizeClass, Spot, SpotStatus, SpotType};
use crate::store::{ParkingStore, StoreError};

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot read layout file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed layout file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate spot id {0}")]
    Duplicate(String),
    #[error("layout has no spots")]
    Empty,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One spot as written in a layout file. Status defaults to available.
#[derive(Debug, Deserialize)]
struct LayoutEntry {
    id: String,
    spot_type: SpotType,
    #[serde(default)]
    status: Option<SpotStatus>,
    size_capacity: SizeClass,
    #[serde(default)]
    has_jetway: bool,
    distance_to_terminal: u32,
    #[serde(default)]
    admin_configurable: Option<bool>,
    #[serde(default)]
    notes: Option<String>,
}

impl From<LayoutEntry> for Spot {
    fn from(e: LayoutEntry) -> Self {
        Spot {
            id: e.id,
            spot_type: e.spot_type,
            status: e.status.unwrap_or(SpotStatus::Available),
            size_capacity: e.size_capacity,
            has_jetway: e.has_jetway,
            distance_to_terminal: e.distance_to_terminal,
            admin_configurable: e.admin_configurable.unwrap_or(true),
            notes: e.notes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LayoutFile {
    spots: Vec<LayoutEntry>,
}

fn spot(id: &str, spot_type: SpotType, size: SizeClass, has_jetway: bool, distance: u32) -> Spot {
    Spot {
        id: id.to_string(),
        spot_type,
        status: SpotStatus::Available,
        size_capacity: size,
        has_jetway,
        distance_to_terminal: distance,
        admin_configurable: true,
        notes: None,
    }
}

/// Built-in apron: 12 civil stands (C01–C12) and 5 military overflow stands (M01–M05).
pub fn default_layout() -> Vec<Spot> {
    use SizeClass::*;
    use SpotType::*;
    vec![
        spot("C01", Civil, Large, true, 50),
        spot("C02", Civil, Large, true, 60),
        spot("C03", Civil, Large, true, 70),
        spot("C04", Civil, Medium, true, 80),
        spot("C05", Civil, Medium, true, 90),
        spot("C06", Civil, Medium, false, 120),
        spot("C07", Civil, Medium, false, 140),
        spot("C08", Civil, Medium, false, 160),
        spot("C09", Civil, Small, false, 200),
        spot("C10", Civil, Small, false, 220),
        spot("C11", Civil, Small, false, 240),
        spot("C12", Civil, Small, false, 260),
        spot("M01", Military, Large, false, 800),
        spot("M02", Military, Large, false, 850),
        spot("M03", Military, Medium, false, 900),
        spot("M04", Military, Medium, false, 950),
        spot("M05", Military, Medium, false, 1000),
    ]
}

pub fn parse_layout(json: &str) -> Result<Vec<Spot>, LayoutError> {
    let file: LayoutFile = serde_json::from_str(json)?;
    if file.spots.is_empty() {
        return Err(LayoutError::Empty);
    }
    let mut seen = HashSet::new();
    let mut spots = Vec::with_capacity(file.spots.len());
    for entry in file.spots {
        if !seen.insert(entry.id.clone()) {
            return Err(LayoutError::Duplicate(entry.id));
        }
        spots.push(Spot::from(entry));
    }
    Ok(spots)
}

pub fn load_layout(path: &Path) -> Result<Vec<Spot>, LayoutError> {
    parse_layout(&std::fs::read_to_string(path)?)
}

/// Register `layout` when the store has no spots yet. Returns how many were added.
pub async fn seed_if_empty(store: &dyn ParkingStore, layout: Vec<Spot>) -> Result<usize, LayoutError> {
    if !store.list_spots().await.is_empty() {
        return Ok(0);
    }
    let count = layout.len();
    for spot in layout {
        store.register_spot(spot).await?;
    }
    info!(count, "seeded spot layout");
    Ok(count)
}
