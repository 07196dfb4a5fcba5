//! Named well groups
//!
//! A group is an ordered set of positions with a role and free-form
//! properties. Positions stay sorted in plate reading order, and replicate
//! statistics are computed once per loaded group and memoized.

use crate::error::{DomainError, DomainResult};
use crate::models::plate_models::WellGroupRow;
use crate::plate::stats::SummaryStats;
use crate::plate::{new_lsid, Plate, Position, WellGroupType};
use std::sync::OnceLock;

#[derive(Debug)]
pub struct WellGroup {
    pub well_group_id: Option<i32>,
    pub lsid: String,
    pub name: String,
    pub group_type: WellGroupType,
    positions: Vec<Position>,
    pub properties: serde_json::Value,
    stats: OnceLock<SummaryStats>,
}

impl Clone for WellGroup {
    fn clone(&self) -> Self {
        // memoized stats stay with the original; a clone recomputes on demand
        Self {
            well_group_id: self.well_group_id,
            lsid: self.lsid.clone(),
            name: self.name.clone(),
            group_type: self.group_type,
            positions: self.positions.clone(),
            properties: self.properties.clone(),
            stats: OnceLock::new(),
        }
    }
}

impl WellGroup {
    pub fn new(name: &str, group_type: WellGroupType) -> Self {
        Self {
            well_group_id: None,
            lsid: new_lsid("WellGroup"),
            name: name.to_string(),
            group_type,
            positions: Vec::new(),
            properties: serde_json::Value::Object(Default::default()),
            stats: OnceLock::new(),
        }
    }

    pub fn from_row(row: WellGroupRow) -> DomainResult<Self> {
        let group_type = WellGroupType::parse(&row.group_type).ok_or_else(|| {
            DomainError::Unsupported(format!("unknown well group type: {}", row.group_type))
        })?;
        let mut positions = positions_from_json(&row.positions)?;
        positions.sort();
        positions.dedup();
        Ok(Self {
            well_group_id: Some(row.well_group_id),
            lsid: row.lsid,
            name: row.name,
            group_type,
            positions,
            properties: row.properties,
            stats: OnceLock::new(),
        })
    }

    /// Positions in plate reading order.
    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    /// First position in reading order, `None` for an empty group. Determines
    /// this group's slot among siblings of the same type.
    pub fn top_left(&self) -> Option<Position> {
        self.positions.first().copied()
    }

    pub fn contains(&self, position: Position) -> bool {
        self.positions.binary_search(&position).is_ok()
    }

    /// Add a position, keeping order and dropping duplicates. Any memoized
    /// statistics are discarded.
    pub fn add_position(&mut self, position: Position) {
        if let Err(index) = self.positions.binary_search(&position) {
            self.positions.insert(index, position);
            self.stats = OnceLock::new();
        }
    }

    pub fn remove_position(&mut self, position: Position) {
        if let Ok(index) = self.positions.binary_search(&position) {
            self.positions.remove(index);
            self.stats = OnceLock::new();
        }
    }

    pub fn set_positions(&mut self, mut positions: Vec<Position>) {
        positions.sort();
        positions.dedup();
        self.positions = positions;
        self.stats = OnceLock::new();
    }

    /// Replicate statistics over this group's non-excluded well values,
    /// computed once and memoized.
    pub fn stats(&self, plate: &Plate) -> SummaryStats {
        *self
            .stats
            .get_or_init(|| SummaryStats::compute(&plate.values_at(&self.positions)))
    }

    pub fn positions_json(&self) -> serde_json::Value {
        positions_to_json(&self.positions)
    }
}

/// Order loaded groups: type blocks first, then siblings of the same type by
/// their top-left well, empty groups last by name. Two siblings claiming the
/// same top-left well have no stable order; that only happens when rows were
/// edited outside this module, so it raises.
pub(crate) fn order_sibling_groups(groups: &mut [WellGroup]) -> DomainResult<()> {
    groups.sort_by(|a, b| {
        (a.group_type, a.top_left().is_none(), a.top_left(), &a.name).cmp(&(
            b.group_type,
            b.top_left().is_none(),
            b.top_left(),
            &b.name,
        ))
    });
    for pair in groups.windows(2) {
        if pair[0].group_type != pair[1].group_type {
            continue;
        }
        if let (Some(a), Some(b)) = (pair[0].top_left(), pair[1].top_left()) {
            if a == b {
                return Err(DomainError::Unsupported(format!(
                    "well groups '{}' and '{}' both start at {a}; their order is undefined",
                    pair[0].name, pair[1].name
                )));
            }
        }
    }
    Ok(())
}

/// Persisted form: jsonb array of `[col, row]` pairs.
pub(crate) fn positions_to_json(positions: &[Position]) -> serde_json::Value {
    serde_json::Value::Array(
        positions
            .iter()
            .map(|p| serde_json::json!([p.col, p.row]))
            .collect(),
    )
}

pub(crate) fn positions_from_json(value: &serde_json::Value) -> DomainResult<Vec<Position>> {
    let pairs: Vec<(i32, i32)> = serde_json::from_value(value.clone())?;
    Ok(pairs
        .into_iter()
        .map(|(col, row)| Position { row, col })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plate::PlateType;
    use uuid::Uuid;

    fn plate_with_values(values: &[(Position, f64)]) -> Plate {
        let mut plate = Plate::new(
            Uuid::new_v4(),
            "p",
            PlateType {
                plate_type_id: 1,
                rows: 8,
                cols: 12,
                description: None,
            },
            false,
        );
        for (position, value) in values {
            plate.well_mut(*position).unwrap().value = Some(*value);
        }
        plate
    }

    #[test]
    fn positions_stay_sorted_and_unique() {
        let mut group = WellGroup::new("Positive", WellGroupType::Control);
        group.add_position(Position::new(0, 1));
        group.add_position(Position::new(0, 0));
        group.add_position(Position::new(0, 0));
        assert_eq!(
            group.positions(),
            &[Position::new(0, 0), Position::new(0, 1)]
        );
    }

    #[test]
    fn stats_cover_member_wells_only() {
        let a1 = Position::new(0, 0);
        let b1 = Position::new(1, 0);
        let h12 = Position::new(7, 11);
        let plate = plate_with_values(&[(a1, 10.0), (b1, 20.0), (h12, 99.0)]);

        let mut group = WellGroup::new("Positive", WellGroupType::Control);
        group.add_position(a1);
        group.add_position(b1);

        let stats = group.stats(&plate);
        assert_eq!(stats.n, 2);
        assert!((stats.mean - 15.0).abs() < 1e-12);
    }

    #[test]
    fn positions_round_trip_as_col_row_pairs() {
        let positions = vec![Position::new(2, 3), Position::new(0, 0)];
        let json = positions_to_json(&positions);
        assert_eq!(json[0][0], 3); // col first
        assert_eq!(json[0][1], 2);
        let back = positions_from_json(&json).unwrap();
        assert_eq!(back, positions);
    }

    #[test]
    fn empty_group_stats_are_nan() {
        let plate = plate_with_values(&[]);
        let group = WellGroup::new("Empty", WellGroupType::Other);
        assert!(group.stats(&plate).mean.is_nan());
    }

    fn group_at(name: &str, group_type: WellGroupType, position: Option<Position>) -> WellGroup {
        let mut group = WellGroup::new(name, group_type);
        if let Some(position) = position {
            group.add_position(position);
        }
        group
    }

    #[test]
    fn siblings_order_by_top_left_well() {
        let mut groups = vec![
            group_at("Specimen 2", WellGroupType::Sample, Some(Position::new(0, 5))),
            group_at("Unplaced", WellGroupType::Sample, None),
            group_at("Specimen 1", WellGroupType::Sample, Some(Position::new(0, 2))),
            group_at("Positive", WellGroupType::Control, Some(Position::new(0, 0))),
        ];
        order_sibling_groups(&mut groups).unwrap();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["Positive", "Specimen 1", "Specimen 2", "Unplaced"]);
    }

    #[test]
    fn empty_siblings_order_by_name_without_error() {
        let mut groups = vec![
            group_at("Positive", WellGroupType::Control, None),
            group_at("Negative", WellGroupType::Control, None),
        ];
        order_sibling_groups(&mut groups).unwrap();
        assert_eq!(groups[0].name, "Negative");
    }

    #[test]
    fn siblings_sharing_a_top_left_well_are_rejected() {
        let mut groups = vec![
            group_at("A", WellGroupType::Sample, Some(Position::new(1, 1))),
            group_at("B", WellGroupType::Sample, Some(Position::new(1, 1))),
        ];
        assert!(order_sibling_groups(&mut groups).is_err());
    }

    #[test]
    fn same_top_left_in_different_types_is_fine() {
        let mut groups = vec![
            group_at("Control", WellGroupType::Control, Some(Position::new(0, 0))),
            group_at("Sample", WellGroupType::Sample, Some(Position::new(0, 0))),
        ];
        assert!(order_sibling_groups(&mut groups).is_ok());
    }
}
