//! Domain metadata models
//!
//! One metadata row per domain (descriptor) and one per property. The
//! `modified` column on the descriptor is the optimistic-concurrency token:
//! it is captured at load and compared under the row lock on save.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Domain descriptor as stored in `labplate.domain_descriptor`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DomainDescriptorRow {
    pub domain_id: i32,
    pub domain_uri: String,
    pub name: String,
    pub container: Uuid,
    pub kind: String,
    pub storage_schema_name: Option<String>,
    pub storage_table_name: Option<String>,
    pub modified: DateTime<Utc>,
}

/// Property descriptor as stored in `labplate.property_descriptor`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PropertyDescriptorRow {
    pub property_id: i32,
    pub domain_id: i32,
    pub property_uri: String,
    pub name: String,
    pub range_type: String,
    pub scale: i32,
    pub required: bool,
    pub mv_enabled: bool,
    pub storage_column_name: Option<String>,
    pub sort_order: i32,
    pub description: Option<String>,
    pub format: Option<String>,
    pub url: Option<String>,
    pub default_value: Option<String>,
    pub lookup_schema: Option<String>,
    pub lookup_query: Option<String>,
}

/// Property validator as stored in `labplate.property_validator`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PropertyValidatorRow {
    pub validator_id: i32,
    pub property_id: i32,
    pub container: Uuid,
    pub name: String,
    pub kind: String,
    pub expression: String,
    pub error_message: Option<String>,
}

/// Conditional display format as stored in `labplate.conditional_format`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConditionalFormatRow {
    pub format_id: i32,
    pub property_id: i32,
    pub container: Uuid,
    pub filter: String,
    pub display: serde_json::Value,
    pub sort_order: i32,
}

/// Persisted audit event row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DomainAuditRow {
    pub audit_id: i64,
    pub container: Uuid,
    pub domain_uri: String,
    pub domain_name: String,
    pub event_type: String,
    pub comment: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Audit event pending insertion (emitted post-commit)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDomainAuditEvent {
    pub container: Uuid,
    pub domain_uri: String,
    pub domain_name: String,
    pub event_type: String,
    pub comment: Option<String>,
    pub detail: Option<serde_json::Value>,
    pub created_by: Option<String>,
}
