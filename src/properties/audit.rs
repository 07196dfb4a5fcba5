//! Domain audit trail
//!
//! Every committed domain mutation leaves one audit row describing what
//! changed. Events are built while the save transaction is open but inserted
//! only after COMMIT returns, via the transaction context's deferred tasks, so
//! a rolled-back save leaves no trace.

use crate::error::DomainResult;
use crate::models::domain_models::{DomainAuditRow, NewDomainAuditEvent};
use crate::properties::descriptor::Domain;
use serde_json::json;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

pub const EVENT_CREATED: &str = "domain_created";
pub const EVENT_MODIFIED: &str = "domain_modified";
pub const EVENT_DELETED: &str = "domain_deleted";

pub struct DomainAuditService {
    pool: PgPool,
}

impl DomainAuditService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, event: NewDomainAuditEvent) -> DomainResult<DomainAuditRow> {
        debug!(domain = %event.domain_uri, event = %event.event_type, "recording domain audit event");
        let row = sqlx::query_as::<_, DomainAuditRow>(
            r#"
            INSERT INTO labplate.domain_audit
                (container, domain_uri, domain_name, event_type, comment, detail, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING audit_id, container, domain_uri, domain_name, event_type,
                      comment, detail, created_by, created_at
            "#,
        )
        .bind(event.container)
        .bind(&event.domain_uri)
        .bind(&event.domain_name)
        .bind(&event.event_type)
        .bind(&event.comment)
        .bind(&event.detail)
        .bind(&event.created_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn recent_for_container(
        &self,
        container: Uuid,
        limit: i64,
    ) -> DomainResult<Vec<DomainAuditRow>> {
        let rows = sqlx::query_as::<_, DomainAuditRow>(
            r#"
            SELECT audit_id, container, domain_uri, domain_name, event_type,
                   comment, detail, created_by, created_at
            FROM labplate.domain_audit
            WHERE container = $1
            ORDER BY created_at DESC, audit_id DESC
            LIMIT $2
            "#,
        )
        .bind(container)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn history_for_domain(
        &self,
        container: Uuid,
        domain_uri: &str,
    ) -> DomainResult<Vec<DomainAuditRow>> {
        let rows = sqlx::query_as::<_, DomainAuditRow>(
            r#"
            SELECT audit_id, container, domain_uri, domain_name, event_type,
                   comment, detail, created_by, created_at
            FROM labplate.domain_audit
            WHERE container = $1 AND domain_uri = $2
            ORDER BY created_at, audit_id
            "#,
        )
        .bind(container)
        .bind(domain_uri)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Event describing a freshly created domain.
pub fn created_event(domain: &Domain, created_by: Option<&str>) -> NewDomainAuditEvent {
    NewDomainAuditEvent {
        container: domain.descriptor.container,
        domain_uri: domain.descriptor.domain_uri.clone(),
        domain_name: domain.descriptor.name.clone(),
        event_type: EVENT_CREATED.to_string(),
        comment: Some(format!("The domain {} was created", domain.descriptor.name)),
        detail: Some(property_listing(domain)),
        created_by: created_by.map(str::to_string),
    }
}

/// Event describing a save against an existing domain, with the logical
/// before/after property listings as detail.
pub fn modified_event(
    before: &Domain,
    after: &Domain,
    created_by: Option<&str>,
) -> NewDomainAuditEvent {
    NewDomainAuditEvent {
        container: after.descriptor.container,
        domain_uri: after.descriptor.domain_uri.clone(),
        domain_name: after.descriptor.name.clone(),
        event_type: EVENT_MODIFIED.to_string(),
        comment: Some(format!(
            "The domain {} was modified",
            after.descriptor.name
        )),
        detail: Some(json!({
            "before": property_listing(before),
            "after": property_listing(after),
        })),
        created_by: created_by.map(str::to_string),
    }
}

/// Event describing a deleted domain.
pub fn deleted_event(domain: &Domain, created_by: Option<&str>) -> NewDomainAuditEvent {
    NewDomainAuditEvent {
        container: domain.descriptor.container,
        domain_uri: domain.descriptor.domain_uri.clone(),
        domain_name: domain.descriptor.name.clone(),
        event_type: EVENT_DELETED.to_string(),
        comment: Some(format!("The domain {} was deleted", domain.descriptor.name)),
        detail: Some(property_listing(domain)),
        created_by: created_by.map(str::to_string),
    }
}

fn property_listing(domain: &Domain) -> serde_json::Value {
    json!(domain
        .properties
        .iter()
        .map(|p| {
            json!({
                "name": p.name,
                "type": p.property_type.as_str(),
                "scale": p.scale,
                "required": p.required,
                "mvEnabled": p.mv_enabled,
            })
        })
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain_models::DomainDescriptorRow;
    use crate::properties::descriptor::{DomainDescriptor, PropertyDescriptor};
    use crate::properties::types::PropertyType;

    fn domain_with(names: &[&str]) -> Domain {
        Domain {
            descriptor: DomainDescriptor::from(DomainDescriptorRow {
                domain_id: 1,
                domain_uri: "urn:labplate:domain:test".into(),
                name: "Test".into(),
                container: Uuid::new_v4(),
                kind: "test".into(),
                storage_schema_name: None,
                storage_table_name: None,
                modified: chrono::Utc::now(),
            }),
            properties: names
                .iter()
                .enumerate()
                .map(|(i, n)| PropertyDescriptor {
                    property_id: i as i32 + 1,
                    domain_id: 1,
                    property_uri: format!("urn:labplate:prop:{n}"),
                    name: n.to_string(),
                    property_type: PropertyType::Double,
                    scale: 0,
                    required: false,
                    mv_enabled: false,
                    storage_column_name: Some(n.to_lowercase()),
                    sort_order: i as i32,
                    description: None,
                    format: None,
                    url: None,
                    default_value: None,
                    lookup: None,
                })
                .collect(),
        }
    }

    #[test]
    fn modified_event_carries_before_and_after() {
        let before = domain_with(&["a"]);
        let after = domain_with(&["a", "b"]);
        let event = modified_event(&before, &after, Some("tester"));
        assert_eq!(event.event_type, EVENT_MODIFIED);
        let detail = event.detail.unwrap();
        assert_eq!(detail["before"].as_array().unwrap().len(), 1);
        assert_eq!(detail["after"].as_array().unwrap().len(), 2);
    }
}
