//! Plate-based laboratory data model
//!
//! A plate is a rectangular grid of wells plus named well groups layered over
//! it. Templates are plates with no measured data, stamped out when an assay
//! run is imported. Layout handlers seed the groups a new template starts
//! with.

pub mod handler;
pub mod manager;
pub mod stats;
pub mod well_group;

pub use handler::{DefaultLayoutHandler, PlateLayoutHandler, PlateLayoutHandlerRegistry};
pub use manager::{PlateManager, PlateMetadataKind};
pub use stats::SummaryStats;
pub use well_group::WellGroup;

use crate::error::{DomainError, DomainResult};
use crate::models::plate_models::PlateTypeRow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// One well coordinate on a plate. Ordering is column-major, matching the
/// order instruments read a plate: every row of column 1, then column 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub row: i32,
    pub col: i32,
}

impl Position {
    pub fn new(row: i32, col: i32) -> Self {
        Self { row, col }
    }

    /// Alphanumeric label, e.g. row 0 col 0 is "A1".
    pub fn label(&self) -> String {
        format!("{}{}", row_label(self.row), self.col + 1)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.col, self.row).cmp(&(other.col, other.row))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

fn row_label(row: i32) -> String {
    let mut n = row;
    let mut label = String::new();
    loop {
        label.insert(0, (b'A' + (n % 26) as u8) as char);
        n = n / 26 - 1;
        if n < 0 {
            break;
        }
    }
    label
}

/// Physical plate geometry (96-well, 384-well, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateType {
    pub plate_type_id: i32,
    pub rows: i32,
    pub cols: i32,
    pub description: Option<String>,
}

impl From<PlateTypeRow> for PlateType {
    fn from(row: PlateTypeRow) -> Self {
        Self {
            plate_type_id: row.plate_type_id,
            rows: row.row_count,
            cols: row.col_count,
            description: row.description,
        }
    }
}

impl PlateType {
    pub fn well_count(&self) -> i32 {
        self.rows * self.cols
    }

    pub fn contains(&self, position: Position) -> bool {
        position.row >= 0 && position.row < self.rows && position.col >= 0 && position.col < self.cols
    }
}

/// Role a well group plays in an assay. The derived ordering fixes the
/// relative position of type blocks when groups are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WellGroupType {
    Control,
    Sample,
    Replicate,
    Other,
}

impl WellGroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WellGroupType::Control => "CONTROL",
            WellGroupType::Sample => "SAMPLE",
            WellGroupType::Replicate => "REPLICATE",
            WellGroupType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<WellGroupType> {
        Some(match s {
            "CONTROL" => WellGroupType::Control,
            "SAMPLE" => WellGroupType::Sample,
            "REPLICATE" => WellGroupType::Replicate,
            "OTHER" => WellGroupType::Other,
            _ => return None,
        })
    }
}

/// One well's measured state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Well {
    pub position: Position,
    pub value: Option<f64>,
    pub dilution: Option<f64>,
    pub excluded: bool,
    pub sample_id: Option<Uuid>,
}

impl Well {
    pub fn empty(position: Position) -> Self {
        Self {
            position,
            value: None,
            dilution: None,
            excluded: false,
            sample_id: None,
        }
    }
}

/// In-memory plate aggregate: geometry, wells in row-major order, and the
/// groups layered over them.
#[derive(Debug, Clone)]
pub struct Plate {
    pub plate_id: Option<i32>,
    pub lsid: String,
    pub container: Uuid,
    pub name: String,
    pub plate_type: PlateType,
    pub template: bool,
    pub properties: serde_json::Value,
    pub wells: Vec<Well>,
    pub well_groups: Vec<WellGroup>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl Plate {
    /// Fresh unsaved plate with an empty well at every grid position.
    pub fn new(container: Uuid, name: &str, plate_type: PlateType, template: bool) -> Self {
        let mut wells = Vec::with_capacity(plate_type.well_count() as usize);
        for row in 0..plate_type.rows {
            for col in 0..plate_type.cols {
                wells.push(Well::empty(Position::new(row, col)));
            }
        }
        Self {
            plate_id: None,
            lsid: new_lsid(if template { "PlateTemplate" } else { "Plate" }),
            container,
            name: name.to_string(),
            plate_type,
            template,
            properties: serde_json::Value::Object(Default::default()),
            wells,
            well_groups: Vec::new(),
            created_at: None,
            modified: None,
        }
    }

    pub fn well(&self, position: Position) -> DomainResult<&Well> {
        if !self.plate_type.contains(position) {
            return Err(DomainError::Unsupported(format!(
                "position {position} is outside a {}x{} plate",
                self.plate_type.rows, self.plate_type.cols
            )));
        }
        let index = (position.row * self.plate_type.cols + position.col) as usize;
        Ok(&self.wells[index])
    }

    pub fn well_mut(&mut self, position: Position) -> DomainResult<&mut Well> {
        if !self.plate_type.contains(position) {
            return Err(DomainError::Unsupported(format!(
                "position {position} is outside a {}x{} plate",
                self.plate_type.rows, self.plate_type.cols
            )));
        }
        let index = (position.row * self.plate_type.cols + position.col) as usize;
        Ok(&mut self.wells[index])
    }

    pub fn group_by_name(&self, group_type: WellGroupType, name: &str) -> Option<&WellGroup> {
        self.well_groups
            .iter()
            .find(|g| g.group_type == group_type && g.name == name)
    }

    pub fn groups_of_type(&self, group_type: WellGroupType) -> impl Iterator<Item = &WellGroup> {
        self.well_groups
            .iter()
            .filter(move |g| g.group_type == group_type)
    }

    /// Values of the non-excluded wells at the given positions, in position
    /// order.
    pub fn values_at(&self, positions: &[Position]) -> Vec<f64> {
        let mut sorted: Vec<Position> = positions.to_vec();
        sorted.sort();
        sorted
            .into_iter()
            .filter_map(|p| self.well(p).ok())
            .filter(|w| !w.excluded)
            .filter_map(|w| w.value)
            .collect()
    }
}

pub(crate) fn new_lsid(object_type: &str) -> String {
    format!("urn:lsid:labplate:{object_type}:{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate_type_96() -> PlateType {
        PlateType {
            plate_type_id: 1,
            rows: 8,
            cols: 12,
            description: Some("96 well".into()),
        }
    }

    #[test]
    fn positions_order_column_major() {
        let mut positions = vec![
            Position::new(1, 0),
            Position::new(0, 1),
            Position::new(0, 0),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![Position::new(0, 0), Position::new(1, 0), Position::new(0, 1)]
        );
    }

    #[test]
    fn labels_read_like_an_instrument_grid() {
        assert_eq!(Position::new(0, 0).label(), "A1");
        assert_eq!(Position::new(7, 11).label(), "H12");
        assert_eq!(Position::new(26, 0).label(), "AA1");
    }

    #[test]
    fn new_plate_has_a_well_for_every_position() {
        let plate = Plate::new(Uuid::new_v4(), "t", plate_type_96(), true);
        assert_eq!(plate.wells.len(), 96);
        assert!(plate.well(Position::new(7, 11)).is_ok());
        assert!(plate.well(Position::new(8, 0)).is_err());
    }

    #[test]
    fn values_skip_excluded_and_empty_wells() {
        let mut plate = Plate::new(Uuid::new_v4(), "t", plate_type_96(), false);
        let a1 = Position::new(0, 0);
        let b1 = Position::new(1, 0);
        let c1 = Position::new(2, 0);
        plate.well_mut(a1).unwrap().value = Some(1.0);
        plate.well_mut(b1).unwrap().value = Some(2.0);
        plate.well_mut(b1).unwrap().excluded = true;
        let values = plate.values_at(&[a1, b1, c1]);
        assert_eq!(values, vec![1.0]);
    }
}
