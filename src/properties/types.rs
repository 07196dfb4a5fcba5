//! Property scalar kinds and physical storage specs
//!
//! The dynamic property system maps user-defined typed fields onto physical
//! relational columns. `PropertyType` is the explicit tagged union of
//! supported scalar kinds; each variant carries its Postgres column type
//! mapping so nothing is derived by reflection.

use serde::{Deserialize, Serialize};

/// Suffix appended to a property's storage column name for its
/// missing-value indicator shadow column.
pub const MV_INDICATOR_SUFFIX: &str = "mvindicator";

/// Width of the MV indicator column (holds a short reason code).
pub const MV_INDICATOR_SCALE: i32 = 50;

/// Supported scalar kinds for dynamic properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyType {
    Text,
    MultiLineText,
    Boolean,
    Integer,
    BigInt,
    Double,
    Decimal,
    Date,
    DateTime,
    Uuid,
    /// File attachment reference, stored as the attachment's name.
    Attachment,
    /// Sequence-backed generated identifier; values are allocated from a
    /// shared sequence and backfilled on first provisioning.
    UniqueId,
}

impl PropertyType {
    /// Stable string form stored in `property_descriptor.range_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Text => "text",
            PropertyType::MultiLineText => "multiline",
            PropertyType::Boolean => "boolean",
            PropertyType::Integer => "integer",
            PropertyType::BigInt => "bigint",
            PropertyType::Double => "double",
            PropertyType::Decimal => "decimal",
            PropertyType::Date => "date",
            PropertyType::DateTime => "datetime",
            PropertyType::Uuid => "uuid",
            PropertyType::Attachment => "attachment",
            PropertyType::UniqueId => "uniqueid",
        }
    }

    pub fn parse(s: &str) -> Option<PropertyType> {
        Some(match s {
            "text" => PropertyType::Text,
            "multiline" => PropertyType::MultiLineText,
            "boolean" => PropertyType::Boolean,
            "integer" => PropertyType::Integer,
            "bigint" => PropertyType::BigInt,
            "double" => PropertyType::Double,
            "decimal" => PropertyType::Decimal,
            "date" => PropertyType::Date,
            "datetime" => PropertyType::DateTime,
            "uuid" => PropertyType::Uuid,
            "attachment" => PropertyType::Attachment,
            "uniqueid" => PropertyType::UniqueId,
            _ => return None,
        })
    }

    /// Postgres column type for this kind at the given scale.
    pub fn sql_type(&self, scale: i32) -> String {
        match self {
            PropertyType::Text | PropertyType::Attachment | PropertyType::UniqueId => {
                if scale > 0 {
                    format!("VARCHAR({scale})")
                } else {
                    "TEXT".to_string()
                }
            }
            PropertyType::MultiLineText => "TEXT".to_string(),
            PropertyType::Boolean => "BOOLEAN".to_string(),
            PropertyType::Integer => "INTEGER".to_string(),
            PropertyType::BigInt => "BIGINT".to_string(),
            PropertyType::Double => "DOUBLE PRECISION".to_string(),
            PropertyType::Decimal => "NUMERIC(15,4)".to_string(),
            PropertyType::Date => "DATE".to_string(),
            PropertyType::DateTime => "TIMESTAMPTZ".to_string(),
            PropertyType::Uuid => "UUID".to_string(),
        }
    }

    /// Whether a change from `self` to `other` can be applied in place with
    /// an ALTER, or requires the column to be dropped and recreated.
    pub fn recreate_required(&self, other: PropertyType) -> bool {
        if *self == other {
            return false;
        }
        // Widening conversions Postgres can cast implicitly
        let compatible = matches!(
            (self, other),
            (PropertyType::Integer, PropertyType::BigInt)
                | (PropertyType::Integer, PropertyType::Double)
                | (PropertyType::Integer, PropertyType::Decimal)
                | (PropertyType::Text, PropertyType::MultiLineText)
                | (PropertyType::MultiLineText, PropertyType::Text)
                | (PropertyType::Date, PropertyType::DateTime)
        );
        !compatible
    }

    /// Missing-value tracking only makes sense for kinds holding measured
    /// user data, not generated identifiers.
    pub fn mv_applies(&self) -> bool {
        !matches!(self, PropertyType::UniqueId)
    }

    /// Default scale used when a descriptor does not set one.
    pub fn default_scale(&self) -> i32 {
        match self {
            PropertyType::Text | PropertyType::Attachment | PropertyType::UniqueId => 4000,
            _ => 0,
        }
    }
}

/// Physical column description used by the provisioner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyStorageSpec {
    pub name: String,
    pub property_type: PropertyType,
    pub scale: i32,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub mv_enabled: bool,
}

impl PropertyStorageSpec {
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        let scale = property_type.default_scale();
        Self {
            name: name.into(),
            property_type,
            scale,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            mv_enabled: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn with_scale(mut self, scale: i32) -> Self {
        self.scale = scale;
        self
    }

    /// The shadow column spec tracking why this column's value is absent.
    pub fn mv_column(&self) -> PropertyStorageSpec {
        PropertyStorageSpec::new(
            format!("{}_{}", self.name, MV_INDICATOR_SUFFIX),
            PropertyType::Text,
        )
        .with_scale(MV_INDICATOR_SCALE)
    }
}

/// Index requested on a provisioned table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableIndex {
    pub columns: Vec<String>,
    pub unique: bool,
}

impl TableIndex {
    pub fn unique(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: true,
        }
    }

    pub fn non_unique(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }
}

/// Foreign key requested on a provisioned table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeySpec {
    pub column: String,
    pub referenced_schema: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_type_round_trip() {
        for t in [
            PropertyType::Text,
            PropertyType::MultiLineText,
            PropertyType::Boolean,
            PropertyType::Integer,
            PropertyType::BigInt,
            PropertyType::Double,
            PropertyType::Decimal,
            PropertyType::Date,
            PropertyType::DateTime,
            PropertyType::Uuid,
            PropertyType::Attachment,
            PropertyType::UniqueId,
        ] {
            assert_eq!(PropertyType::parse(t.as_str()), Some(t));
        }
        assert_eq!(PropertyType::parse("blob"), None);
    }

    #[test]
    fn widening_conversions_are_in_place() {
        assert!(!PropertyType::Integer.recreate_required(PropertyType::BigInt));
        assert!(!PropertyType::Integer.recreate_required(PropertyType::Double));
        assert!(!PropertyType::Date.recreate_required(PropertyType::DateTime));
    }

    #[test]
    fn incompatible_conversions_require_recreate() {
        assert!(PropertyType::Text.recreate_required(PropertyType::Integer));
        assert!(PropertyType::Double.recreate_required(PropertyType::Integer));
        assert!(PropertyType::DateTime.recreate_required(PropertyType::Boolean));
    }

    #[test]
    fn mv_column_naming() {
        let spec = PropertyStorageSpec::new("titer", PropertyType::Double);
        let mv = spec.mv_column();
        assert_eq!(mv.name, "titer_mvindicator");
        assert_eq!(mv.scale, MV_INDICATOR_SCALE);
    }
}
