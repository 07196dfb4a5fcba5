//! Property validators and conditional display formats
//!
//! Validators and formats hang off individual properties but are loaded and
//! cached a whole container at a time: one read-through load per container,
//! evicted container-granular on any write. The cache is injected, never a
//! process global.

use crate::cache::ContainerCache;
use crate::error::DomainResult;
use crate::models::domain_models::{ConditionalFormatRow, PropertyValidatorRow};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One container's full validator/format load, shared immutably from cache.
#[derive(Default)]
pub struct ContainerProperties {
    validators: HashMap<i32, Vec<PropertyValidatorRow>>,
    formats: HashMap<i32, Vec<ConditionalFormatRow>>,
}

/// Caller-supplied validator definition.
#[derive(Debug, Clone)]
pub struct ValidatorDraft {
    pub name: String,
    pub kind: String,
    pub expression: String,
    pub error_message: Option<String>,
}

/// Caller-supplied conditional format; sort order is positional.
#[derive(Debug, Clone)]
pub struct ConditionalFormatDraft {
    pub filter: String,
    pub display: serde_json::Value,
}

pub struct DomainPropertyManager {
    pool: PgPool,
    cache: Arc<ContainerCache<ContainerProperties>>,
}

impl DomainPropertyManager {
    pub fn new(pool: PgPool, cache: Arc<ContainerCache<ContainerProperties>>) -> Self {
        Self { pool, cache }
    }

    pub async fn validators_for(
        &self,
        container: Uuid,
        property_id: i32,
    ) -> DomainResult<Vec<PropertyValidatorRow>> {
        let loaded = self.load(container).await?;
        Ok(loaded
            .validators
            .get(&property_id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn conditional_formats_for(
        &self,
        container: Uuid,
        property_id: i32,
    ) -> DomainResult<Vec<ConditionalFormatRow>> {
        let loaded = self.load(container).await?;
        Ok(loaded
            .formats
            .get(&property_id)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn add_validator(
        &self,
        container: Uuid,
        property_id: i32,
        draft: ValidatorDraft,
    ) -> DomainResult<PropertyValidatorRow> {
        let row = sqlx::query_as::<_, PropertyValidatorRow>(
            r#"
            INSERT INTO labplate.property_validator
                (property_id, container, name, kind, expression, error_message)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING validator_id, property_id, container, name, kind, expression, error_message
            "#,
        )
        .bind(property_id)
        .bind(container)
        .bind(&draft.name)
        .bind(&draft.kind)
        .bind(&draft.expression)
        .bind(&draft.error_message)
        .fetch_one(&self.pool)
        .await?;
        self.cache.invalidate(container);
        Ok(row)
    }

    pub async fn delete_validator(&self, container: Uuid, validator_id: i32) -> DomainResult<()> {
        sqlx::query(
            "DELETE FROM labplate.property_validator WHERE validator_id = $1 AND container = $2",
        )
        .bind(validator_id)
        .bind(container)
        .execute(&self.pool)
        .await?;
        self.cache.invalidate(container);
        Ok(())
    }

    /// Replace a property's conditional formats wholesale, preserving the
    /// caller's ordering.
    pub async fn save_conditional_formats(
        &self,
        container: Uuid,
        property_id: i32,
        formats: &[ConditionalFormatDraft],
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM labplate.conditional_format WHERE property_id = $1")
            .bind(property_id)
            .execute(&mut *tx)
            .await?;
        for (order, format) in formats.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO labplate.conditional_format
                    (property_id, container, filter, display, sort_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(property_id)
            .bind(container)
            .bind(&format.filter)
            .bind(&format.display)
            .bind(order as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        self.cache.invalidate(container);
        Ok(())
    }

    /// Remove everything hanging off a property, on the caller's transaction.
    /// Used by the save orchestrator when a property is deleted; eviction is
    /// the caller's post-commit responsibility.
    pub async fn delete_all_for_property(
        tx: &mut Transaction<'_, Postgres>,
        property_id: i32,
    ) -> DomainResult<()> {
        sqlx::query("DELETE FROM labplate.property_validator WHERE property_id = $1")
            .bind(property_id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM labplate.conditional_format WHERE property_id = $1")
            .bind(property_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub fn evict(&self, container: Uuid) {
        self.cache.invalidate(container);
    }

    async fn load(&self, container: Uuid) -> DomainResult<Arc<ContainerProperties>> {
        if let Some(loaded) = self.cache.get(container) {
            return Ok(loaded);
        }
        debug!(%container, "loading property validators and formats");

        let validator_rows = sqlx::query_as::<_, PropertyValidatorRow>(
            r#"
            SELECT validator_id, property_id, container, name, kind, expression, error_message
            FROM labplate.property_validator
            WHERE container = $1
            ORDER BY validator_id
            "#,
        )
        .bind(container)
        .fetch_all(&self.pool)
        .await?;

        let format_rows = sqlx::query_as::<_, ConditionalFormatRow>(
            r#"
            SELECT format_id, property_id, container, filter, display, sort_order
            FROM labplate.conditional_format
            WHERE container = $1
            ORDER BY property_id, sort_order
            "#,
        )
        .bind(container)
        .fetch_all(&self.pool)
        .await?;

        let mut loaded = ContainerProperties::default();
        for row in validator_rows {
            loaded.validators.entry(row.property_id).or_default().push(row);
        }
        for row in format_rows {
            loaded.formats.entry(row.property_id).or_default().push(row);
        }

        let loaded = Arc::new(loaded);
        self.cache.put(container, loaded.clone());
        Ok(loaded)
    }
}
