//! Plate geometry models
//!
//! Well-group position lists are persisted as jsonb arrays of `[col, row]`
//! pairs, kept sorted by (col, row). Measured well data lives in its own
//! table keyed by (plate, row, col).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Physical plate geometry as stored in `labplate.plate_type`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlateTypeRow {
    pub plate_type_id: i32,
    pub row_count: i32,
    pub col_count: i32,
    pub description: Option<String>,
}

/// Plate (or plate template) as stored in `labplate.plate`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlateRow {
    pub plate_id: i32,
    pub lsid: String,
    pub container: Uuid,
    pub name: String,
    pub plate_type_id: i32,
    pub template: bool,
    pub properties: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// Named well group as stored in `labplate.well_group`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WellGroupRow {
    pub well_group_id: i32,
    pub lsid: String,
    pub plate_id: i32,
    pub name: String,
    pub group_type: String,
    pub positions: serde_json::Value,
    pub properties: serde_json::Value,
}

/// Single well as stored in `labplate.well`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WellRow {
    pub well_id: i32,
    pub plate_id: i32,
    pub well_row: i32,
    pub well_col: i32,
    pub value: Option<f64>,
    pub dilution: Option<f64>,
    pub excluded: bool,
    pub sample_id: Option<Uuid>,
}
