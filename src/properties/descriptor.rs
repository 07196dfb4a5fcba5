//! Immutable descriptors for domains and their properties
//!
//! A `Domain` snapshot is a `DomainDescriptor` plus an ordered list of
//! `PropertyDescriptor`s, loaded as one baseline. Mutation happens through
//! explicit `PropertyChange` batches, never by editing a loaded snapshot.

use crate::models::domain_models::{DomainDescriptorRow, PropertyDescriptorRow};
use crate::properties::types::{PropertyStorageSpec, PropertyType, MV_INDICATOR_SUFFIX};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Optional foreign reference resolved at query time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup {
    pub schema: String,
    pub query: String,
}

/// One typed field definition within a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    pub property_id: i32,
    pub domain_id: i32,
    /// Globally unique logical identity, stable across renames
    pub property_uri: String,
    pub name: String,
    pub property_type: PropertyType,
    pub scale: i32,
    pub required: bool,
    pub mv_enabled: bool,
    /// Physical column name; assigned on first provisioning and renamed in
    /// lock step with the logical name
    pub storage_column_name: Option<String>,
    pub sort_order: i32,
    pub description: Option<String>,
    pub format: Option<String>,
    pub url: Option<String>,
    pub default_value: Option<String>,
    pub lookup: Option<Lookup>,
}

impl PropertyDescriptor {
    pub fn from_row(row: PropertyDescriptorRow) -> Option<Self> {
        let property_type = PropertyType::parse(&row.range_type)?;
        let lookup = match (row.lookup_schema, row.lookup_query) {
            (Some(schema), Some(query)) => Some(Lookup { schema, query }),
            _ => None,
        };
        Some(Self {
            property_id: row.property_id,
            domain_id: row.domain_id,
            property_uri: row.property_uri,
            name: row.name,
            property_type,
            scale: row.scale,
            required: row.required,
            mv_enabled: row.mv_enabled,
            storage_column_name: row.storage_column_name,
            sort_order: row.sort_order,
            description: row.description,
            format: row.format,
            url: row.url,
            default_value: row.default_value,
            lookup,
        })
    }

    /// Physical storage spec for this property, or None when the column name
    /// has not been allocated yet.
    pub fn storage_spec(&self) -> Option<PropertyStorageSpec> {
        let name = self.storage_column_name.clone()?;
        let mut spec = PropertyStorageSpec::new(name, self.property_type).with_scale(self.scale);
        spec.mv_enabled = self.mv_enabled;
        Some(spec)
    }

    /// The MV shadow column name for this property, if one is allocated.
    pub fn mv_storage_column_name(&self) -> Option<String> {
        self.storage_column_name
            .as_ref()
            .map(|c| format!("{c}_{MV_INDICATOR_SUFFIX}"))
    }
}

/// Immutable versioned record describing a named collection of properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDescriptor {
    pub domain_id: i32,
    pub domain_uri: String,
    pub name: String,
    pub container: Uuid,
    pub kind: String,
    pub storage_schema_name: Option<String>,
    pub storage_table_name: Option<String>,
    /// Optimistic-concurrency token captured at load
    pub modified: DateTime<Utc>,
}

impl From<DomainDescriptorRow> for DomainDescriptor {
    fn from(row: DomainDescriptorRow) -> Self {
        Self {
            domain_id: row.domain_id,
            domain_uri: row.domain_uri,
            name: row.name,
            container: row.container,
            kind: row.kind,
            storage_schema_name: row.storage_schema_name,
            storage_table_name: row.storage_table_name,
            modified: row.modified,
        }
    }
}

/// Aggregate snapshot: a descriptor plus its ordered properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub descriptor: DomainDescriptor,
    pub properties: Vec<PropertyDescriptor>,
}

impl Domain {
    pub fn is_provisioned(&self) -> bool {
        self.descriptor.storage_table_name.is_some()
    }

    pub fn property_by_id(&self, property_id: i32) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.property_id == property_id)
    }

    pub fn property_by_name(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, range: &str) -> PropertyDescriptorRow {
        PropertyDescriptorRow {
            property_id: 1,
            domain_id: 1,
            property_uri: format!("urn:labplate:prop:{name}"),
            name: name.to_string(),
            range_type: range.to_string(),
            scale: 0,
            required: false,
            mv_enabled: false,
            storage_column_name: Some(name.to_lowercase()),
            sort_order: 0,
            description: None,
            format: None,
            url: None,
            default_value: None,
            lookup_schema: None,
            lookup_query: None,
        }
    }

    #[test]
    fn from_row_parses_range_type() {
        let pd = PropertyDescriptor::from_row(row("Titer", "double")).unwrap();
        assert_eq!(pd.property_type, PropertyType::Double);
        assert_eq!(pd.mv_storage_column_name().unwrap(), "titer_mvindicator");
    }

    #[test]
    fn from_row_rejects_unknown_range_type() {
        assert!(PropertyDescriptor::from_row(row("x", "geometry")).is_none());
    }
}
