//! Plate persistence
//!
//! `PlateManager` saves plates by diffing the in-memory aggregate against
//! the stored rows: only changed wells are written, groups are matched by id
//! and inserted/updated/deleted accordingly. Plate metadata fields are a
//! dynamic domain; `PlateMetadataKind` defines its storage rules.

use crate::error::{DomainError, DomainResult};
use crate::models::plate_models::{PlateRow, PlateTypeRow, WellGroupRow, WellRow};
use crate::plate::well_group::{self, WellGroup};
use crate::plate::{Plate, PlateLayoutHandlerRegistry, PlateType, Position};
use crate::properties::descriptor::Domain;
use crate::properties::kind::DomainKind;
use crate::properties::types::{ForeignKeySpec, PropertyStorageSpec, PropertyType, TableIndex};
use futures::future;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct PlateManager {
    pool: PgPool,
    handlers: Arc<PlateLayoutHandlerRegistry>,
}

impl PlateManager {
    pub fn new(pool: PgPool, handlers: Arc<PlateLayoutHandlerRegistry>) -> Self {
        Self { pool, handlers }
    }

    pub async fn plate_types(&self) -> DomainResult<Vec<PlateType>> {
        let rows = sqlx::query_as::<_, PlateTypeRow>(
            "SELECT plate_type_id, row_count, col_count, description
             FROM labplate.plate_type ORDER BY row_count * col_count",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PlateType::from).collect())
    }

    pub async fn plate_type(&self, plate_type_id: i32) -> DomainResult<PlateType> {
        let row = sqlx::query_as::<_, PlateTypeRow>(
            "SELECT plate_type_id, row_count, col_count, description
             FROM labplate.plate_type WHERE plate_type_id = $1",
        )
        .bind(plate_type_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DomainError::Unsupported(format!("no plate type {plate_type_id}")))?;
        Ok(PlateType::from(row))
    }

    /// Build a template through the assay's layout handler and persist it.
    pub async fn create_plate_template(
        &self,
        container: Uuid,
        assay_type: &str,
        name: &str,
        plate_type_id: i32,
    ) -> DomainResult<Plate> {
        let handler = self.handlers.get(assay_type).ok_or_else(|| {
            DomainError::Unsupported(format!("no plate layout handler for assay type {assay_type}"))
        })?;
        let plate_type = self.plate_type(plate_type_id).await?;
        let plate = handler.create_template(container, name, plate_type);
        if let Err(message) = handler.validate(&plate).await {
            return Err(DomainError::Unsupported(message));
        }
        self.save(plate).await
    }

    pub async fn plate(&self, container: Uuid, plate_id: i32) -> DomainResult<Plate> {
        let row = sqlx::query_as::<_, PlateRow>(
            "SELECT plate_id, lsid, container, name, plate_type_id, template, properties,
                    created_at, modified
             FROM labplate.plate WHERE container = $1 AND plate_id = $2",
        )
        .bind(container)
        .bind(plate_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DomainError::Unsupported(format!("no plate {plate_id}")))?;
        self.assemble(row).await
    }

    pub async fn plate_by_name(
        &self,
        container: Uuid,
        name: &str,
        template: bool,
    ) -> DomainResult<Option<Plate>> {
        let row = sqlx::query_as::<_, PlateRow>(
            "SELECT plate_id, lsid, container, name, plate_type_id, template, properties,
                    created_at, modified
             FROM labplate.plate
             WHERE container = $1 AND name = $2 AND template = $3",
        )
        .bind(container)
        .bind(name)
        .bind(template)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn templates(&self, container: Uuid) -> DomainResult<Vec<Plate>> {
        let rows = sqlx::query_as::<_, PlateRow>(
            "SELECT plate_id, lsid, container, name, plate_type_id, template, properties,
                    created_at, modified
             FROM labplate.plate
             WHERE container = $1 AND template ORDER BY name",
        )
        .bind(container)
        .fetch_all(&self.pool)
        .await?;
        future::try_join_all(rows.into_iter().map(|row| self.assemble(row))).await
    }

    /// Persist a plate: full insert when unsaved, otherwise a diff against
    /// the stored rows so untouched wells are not rewritten.
    pub async fn save(&self, plate: Plate) -> DomainResult<Plate> {
        let mut tx = self.pool.begin().await?;
        let plate_id = match plate.plate_id {
            None => self.insert_plate(&mut tx, &plate).await?,
            Some(plate_id) => {
                self.update_plate(&mut tx, plate_id, &plate).await?;
                plate_id
            }
        };
        tx.commit().await?;
        self.plate(plate.container, plate_id).await
    }

    pub async fn delete_plate(&self, container: Uuid, plate_id: i32) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM labplate.well WHERE plate_id = $1")
            .bind(plate_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM labplate.well_group WHERE plate_id = $1")
            .bind(plate_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query(
            "DELETE FROM labplate.plate WHERE plate_id = $1 AND container = $2",
        )
        .bind(plate_id)
        .bind(container)
        .execute(&mut *tx)
        .await?;
        if deleted.rows_affected() == 0 {
            return Err(DomainError::Unsupported(format!("no plate {plate_id}")));
        }
        tx.commit().await?;
        info!(plate_id, "plate deleted");
        Ok(())
    }

    // ============================================
    // Insert / diff
    // ============================================

    async fn insert_plate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plate: &Plate,
    ) -> DomainResult<i32> {
        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM labplate.plate
             WHERE container = $1 AND name = $2 AND template = $3",
        )
        .bind(plate.container)
        .bind(&plate.name)
        .bind(plate.template)
        .fetch_one(&mut **tx)
        .await?;
        if existing > 0 {
            return Err(DomainError::Unsupported(format!(
                "a plate named '{}' already exists in this container",
                plate.name
            )));
        }

        let plate_id: i32 = sqlx::query_scalar(
            "INSERT INTO labplate.plate (lsid, container, name, plate_type_id, template, properties)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING plate_id",
        )
        .bind(&plate.lsid)
        .bind(plate.container)
        .bind(&plate.name)
        .bind(plate.plate_type.plate_type_id)
        .bind(plate.template)
        .bind(&plate.properties)
        .fetch_one(&mut **tx)
        .await?;

        for well in &plate.wells {
            sqlx::query(
                "INSERT INTO labplate.well
                     (plate_id, well_row, well_col, value, dilution, excluded, sample_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(plate_id)
            .bind(well.position.row)
            .bind(well.position.col)
            .bind(well.value)
            .bind(well.dilution)
            .bind(well.excluded)
            .bind(well.sample_id)
            .execute(&mut **tx)
            .await?;
        }

        for group in &plate.well_groups {
            self.insert_group(tx, plate_id, group).await?;
        }

        info!(plate_id, name = %plate.name, template = plate.template, "plate created");
        Ok(plate_id)
    }

    async fn insert_group(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plate_id: i32,
        group: &WellGroup,
    ) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO labplate.well_group
                 (lsid, plate_id, name, group_type, positions, properties)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&group.lsid)
        .bind(plate_id)
        .bind(&group.name)
        .bind(group.group_type.as_str())
        .bind(group.positions_json())
        .bind(&group.properties)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn update_plate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        plate_id: i32,
        plate: &Plate,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE labplate.plate
             SET name = $1, properties = $2, modified = now()
             WHERE plate_id = $3 AND container = $4",
        )
        .bind(&plate.name)
        .bind(&plate.properties)
        .bind(plate_id)
        .bind(plate.container)
        .execute(&mut **tx)
        .await?;

        // wells: write only positions whose measured state changed
        let stored = sqlx::query_as::<_, WellRow>(
            "SELECT well_id, plate_id, well_row, well_col, value, dilution, excluded, sample_id
             FROM labplate.well WHERE plate_id = $1",
        )
        .bind(plate_id)
        .fetch_all(&mut **tx)
        .await?;
        let stored_by_position: HashMap<(i32, i32), WellRow> = stored
            .into_iter()
            .map(|row| ((row.well_row, row.well_col), row))
            .collect();

        let mut changed = 0usize;
        for well in &plate.wells {
            let key = (well.position.row, well.position.col);
            match stored_by_position.get(&key) {
                Some(row)
                    if row.value == well.value
                        && row.dilution == well.dilution
                        && row.excluded == well.excluded
                        && row.sample_id == well.sample_id => {}
                Some(row) => {
                    sqlx::query(
                        "UPDATE labplate.well
                         SET value = $1, dilution = $2, excluded = $3, sample_id = $4
                         WHERE well_id = $5",
                    )
                    .bind(well.value)
                    .bind(well.dilution)
                    .bind(well.excluded)
                    .bind(well.sample_id)
                    .bind(row.well_id)
                    .execute(&mut **tx)
                    .await?;
                    changed += 1;
                }
                None => {
                    sqlx::query(
                        "INSERT INTO labplate.well
                             (plate_id, well_row, well_col, value, dilution, excluded, sample_id)
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(plate_id)
                    .bind(well.position.row)
                    .bind(well.position.col)
                    .bind(well.value)
                    .bind(well.dilution)
                    .bind(well.excluded)
                    .bind(well.sample_id)
                    .execute(&mut **tx)
                    .await?;
                    changed += 1;
                }
            }
        }
        debug!(plate_id, changed, "well diff applied");

        // groups: match by id, insert the new, drop the removed
        let stored_groups = sqlx::query_as::<_, WellGroupRow>(
            "SELECT well_group_id, lsid, plate_id, name, group_type, positions, properties
             FROM labplate.well_group WHERE plate_id = $1",
        )
        .bind(plate_id)
        .fetch_all(&mut **tx)
        .await?;
        let stored_ids: HashSet<i32> = stored_groups.iter().map(|g| g.well_group_id).collect();
        let kept_ids: HashSet<i32> = plate
            .well_groups
            .iter()
            .filter_map(|g| g.well_group_id)
            .collect();

        for group in &plate.well_groups {
            match group.well_group_id {
                None => self.insert_group(tx, plate_id, group).await?,
                Some(id) if stored_ids.contains(&id) => {
                    sqlx::query(
                        "UPDATE labplate.well_group
                         SET name = $1, group_type = $2, positions = $3, properties = $4
                         WHERE well_group_id = $5",
                    )
                    .bind(&group.name)
                    .bind(group.group_type.as_str())
                    .bind(group.positions_json())
                    .bind(&group.properties)
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
                }
                Some(id) => {
                    return Err(DomainError::Unsupported(format!(
                        "well group {id} does not belong to plate {plate_id}"
                    )));
                }
            }
        }
        for row in &stored_groups {
            if !kept_ids.contains(&row.well_group_id) {
                sqlx::query("DELETE FROM labplate.well_group WHERE well_group_id = $1")
                    .bind(row.well_group_id)
                    .execute(&mut **tx)
                    .await?;
            }
        }

        Ok(())
    }

    async fn assemble(&self, row: PlateRow) -> DomainResult<Plate> {
        let plate_type = self.plate_type(row.plate_type_id).await?;
        let mut plate = Plate::new(row.container, &row.name, plate_type, row.template);
        plate.plate_id = Some(row.plate_id);
        plate.lsid = row.lsid;
        plate.properties = row.properties;
        plate.created_at = Some(row.created_at);
        plate.modified = Some(row.modified);

        let wells = sqlx::query_as::<_, WellRow>(
            "SELECT well_id, plate_id, well_row, well_col, value, dilution, excluded, sample_id
             FROM labplate.well WHERE plate_id = $1",
        )
        .bind(row.plate_id)
        .fetch_all(&self.pool)
        .await?;
        for stored in wells {
            let position = Position::new(stored.well_row, stored.well_col);
            let well = plate.well_mut(position)?;
            well.value = stored.value;
            well.dilution = stored.dilution;
            well.excluded = stored.excluded;
            well.sample_id = stored.sample_id;
        }

        let groups = sqlx::query_as::<_, WellGroupRow>(
            "SELECT well_group_id, lsid, plate_id, name, group_type, positions, properties
             FROM labplate.well_group WHERE plate_id = $1 ORDER BY well_group_id",
        )
        .bind(row.plate_id)
        .fetch_all(&self.pool)
        .await?;
        plate.well_groups = groups
            .into_iter()
            .map(WellGroup::from_row)
            .collect::<DomainResult<Vec<_>>>()?;
        well_group::order_sibling_groups(&mut plate.well_groups)?;

        Ok(plate)
    }
}

/// Storage rules for plate metadata domains: one row per plate, keyed back
/// to the plate table.
pub struct PlateMetadataKind;

pub const PLATE_METADATA_KIND: &str = "PlateMetadata";

impl DomainKind for PlateMetadataKind {
    fn kind_name(&self) -> &'static str {
        PLATE_METADATA_KIND
    }

    fn base_properties(&self, _domain: &Domain) -> Vec<PropertyStorageSpec> {
        vec![
            PropertyStorageSpec::new("rowid", PropertyType::Integer)
                .primary_key()
                .auto_increment(),
            PropertyStorageSpec::new("lsid", PropertyType::Text)
                .with_scale(300)
                .not_null(),
            PropertyStorageSpec::new("plate_id", PropertyType::Integer).not_null(),
        ]
    }

    fn reserved_names(&self) -> Vec<String> {
        ["rowid", "lsid", "plate_id", "container", "name"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn required_indices(&self, _domain: &Domain) -> Vec<TableIndex> {
        vec![
            TableIndex::unique(&["lsid"]),
            TableIndex::non_unique(&["plate_id"]),
        ]
    }

    fn foreign_keys(&self, _domain: &Domain) -> Vec<ForeignKeySpec> {
        vec![ForeignKeySpec {
            column: "plate_id".to_string(),
            referenced_schema: "labplate".to_string(),
            referenced_table: "plate".to_string(),
            referenced_column: "plate_id".to_string(),
        }]
    }
}

/// LSID for a plate metadata domain in a container.
pub fn plate_metadata_domain_uri(container: Uuid) -> String {
    format!("urn:lsid:labplate:PlateMetadataDomain:{container}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plate_metadata_kind_reserves_its_base_columns() {
        let kind = PlateMetadataKind;
        let reserved = kind.reserved_names();
        assert!(reserved.iter().any(|n| n == "plate_id"));
        assert!(reserved.iter().any(|n| n == "lsid"));
    }

    #[test]
    fn metadata_domain_uri_is_per_container() {
        let a = plate_metadata_domain_uri(Uuid::new_v4());
        let b = plate_metadata_domain_uri(Uuid::new_v4());
        assert_ne!(a, b);
        assert!(a.starts_with("urn:lsid:labplate:PlateMetadataDomain:"));
    }
}
