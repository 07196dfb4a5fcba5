//! Physical schema engine
//!
//! Translates a domain's property list into CREATE/ALTER TABLE work on its
//! provisioned table: column naming, missing-value shadow columns, index
//! maintenance, and drift reporting/repair. All structural mutations that
//! pair with metadata writes run on the caller's open transaction so both
//! commit or roll back together.

use crate::error::{DomainError, DomainResult};
use crate::properties::descriptor::{Domain, PropertyDescriptor};
use crate::properties::kind::DomainKind;
use crate::properties::types::{TableIndex, MV_INDICATOR_SUFFIX};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub mod naming;
pub mod report;
pub mod table_change;

pub use naming::{make_table_name, ColumnAliasAllocator};
pub use report::{ColumnStatus, DomainReport, ProvisioningReport};
pub use table_change::{canonical_index_name, ChangeType, TableChange};

/// A live column on a provisioned table, read from the catalog.
#[derive(Debug, Clone)]
pub struct LiveColumn {
    pub name: String,
    pub data_type: String,
    pub max_length: Option<i32>,
    pub nullable: bool,
}

/// Queryable handle for a provisioned table: physical location plus the
/// logical-to-physical column alias map.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub schema: String,
    pub table: String,
    pub columns: Vec<LiveColumn>,
    /// logical property name -> physical column name
    pub aliases: HashMap<String, String>,
}

pub struct StorageProvisioner {
    pool: PgPool,
}

impl StorageProvisioner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Idempotently create the physical table for a domain. Must be called
    /// with the domain's descriptor row already locked by the caller's
    /// transaction: the storage-table-name re-check under that lock is what
    /// keeps two racing creators from both executing CREATE.
    pub async fn ensure_storage_table(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &mut Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<String> {
        // re-check under the lock: a racing transaction may have created it
        let current: Option<String> = sqlx::query_scalar(
            "SELECT storage_table_name FROM labplate.domain_descriptor WHERE domain_id = $1",
        )
        .bind(domain.descriptor.domain_id)
        .fetch_one(&mut **tx)
        .await?;

        if let Some(table) = current {
            domain.descriptor.storage_table_name = Some(table.clone());
            domain.descriptor.storage_schema_name = Some(kind.storage_schema_name().to_string());
            return Ok(table);
        }

        let table = self.create_table(tx, domain, kind).await?;
        Ok(table)
    }

    async fn create_table(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &mut Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<String> {
        let schema = kind.storage_schema_name().to_string();
        let table = make_table_name(
            domain.descriptor.container,
            domain.descriptor.domain_id,
            &domain.descriptor.name,
        );

        let mut change = TableChange::new(ChangeType::CreateTable, &schema, &table);

        let mut base_names = HashSet::new();
        for spec in kind.base_properties(domain) {
            base_names.insert(spec.name.to_ascii_lowercase());
            change.add_column(spec);
        }

        for property in &domain.properties {
            let Some(spec) = property.storage_spec() else {
                continue;
            };
            if base_names.contains(&spec.name.to_ascii_lowercase()) {
                // Some kinds declare descriptors that intentionally shadow a
                // built-in column; anything else is a caller mistake we skip.
                if !kind.properties_include_base_properties() {
                    info!(
                        property = %property.property_uri,
                        "ignored property with name of built-in column"
                    );
                }
                continue;
            }
            if property.mv_enabled {
                change.add_column(spec.mv_column());
            }
            change.add_column(spec);
        }

        let mut indices = kind.required_indices(domain);
        indices.extend(domain_declared_indices(domain));
        change.indices = indices;
        change.foreign_keys = kind.foreign_keys(domain);

        info!(schema = %schema, table = %table, "creating storage table");
        self.execute_change(tx, &change).await?;

        sqlx::query(
            "UPDATE labplate.domain_descriptor
             SET storage_schema_name = $1, storage_table_name = $2, modified = now()
             WHERE domain_id = $3",
        )
        .bind(&schema)
        .bind(&table)
        .bind(domain.descriptor.domain_id)
        .execute(&mut **tx)
        .await?;

        domain.descriptor.storage_schema_name = Some(schema);
        domain.descriptor.storage_table_name = Some(table.clone());
        kind.invalidate(domain);

        Ok(table)
    }

    /// Add columns for new properties in one ALTER batch. Creates the table
    /// first if the domain has never been provisioned.
    pub async fn add_properties(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &mut Domain,
        kind: &dyn DomainKind,
        properties: &[PropertyDescriptor],
        allow_add_base_property: bool,
    ) -> DomainResult<()> {
        if domain.descriptor.storage_table_name.is_none() {
            self.create_table(tx, domain, kind).await?;
            return Ok(());
        }

        let (schema, table) = self.storage_location(domain)?;
        let mut change = TableChange::new(ChangeType::AddColumns, &schema, &table);

        let base_names = base_name_set(kind, domain);
        for property in properties {
            let Some(spec) = property.storage_spec() else {
                return Err(DomainError::rejected(
                    &property.name,
                    "no storage column allocated before add",
                ));
            };
            if spec.name.is_empty() {
                return Err(DomainError::rejected(
                    &property.name,
                    "can't add property with no name",
                ));
            }
            if !allow_add_base_property && base_names.contains(&spec.name.to_ascii_lowercase()) {
                warn!(
                    property = %property.property_uri,
                    "ignored property with name of built-in column"
                );
                continue;
            }
            if property.mv_enabled {
                change.add_column(spec.mv_column());
            }
            change.add_column(spec);
        }

        self.execute_change(tx, &change).await
    }

    /// Drop the physical columns behind deleted properties, including their
    /// MV shadow columns, in one ALTER batch.
    pub async fn drop_properties(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        kind: &dyn DomainKind,
        properties: &[PropertyDescriptor],
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let mut change = TableChange::new(ChangeType::DropColumns, &schema, &table);

        let base_names = base_name_set(kind, domain);
        for property in properties {
            let Some(column) = &property.storage_column_name else {
                continue;
            };
            if base_names.contains(&column.to_ascii_lowercase()) {
                continue;
            }
            change.drop_column_exact_name(column);
            if property.mv_enabled {
                let mv = self
                    .mv_indicator_column(&mut **tx, &schema, &table, property)
                    .await?;
                change.drop_column_exact_name(&mv);
            }
        }

        self.execute_change(tx, &change).await
    }

    /// Rename one property's physical column. If the property has an active
    /// MV shadow column it is renamed in the same change, unless the MV flag
    /// is being dropped in this same save (`mv_dropped`).
    pub async fn rename_property(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        kind: &dyn DomainKind,
        old_column: &str,
        new_column: &str,
        mv_enabled: bool,
        mv_dropped: bool,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let base_names = base_name_set(kind, domain);
        if base_names.contains(&old_column.to_ascii_lowercase()) {
            return Err(DomainError::Unsupported(format!(
                "cannot rename built-in column {old_column}"
            )));
        }
        if base_names.contains(&new_column.to_ascii_lowercase()) {
            return Err(DomainError::Unsupported(format!(
                "cannot rename {old_column} to built-in column name {new_column}"
            )));
        }

        let mut change = TableChange::new(ChangeType::RenameColumns, &schema, &table);
        change.add_column_rename(old_column, new_column);
        if mv_enabled && !mv_dropped {
            change.add_column_rename(
                &format!("{old_column}_{MV_INDICATOR_SUFFIX}"),
                &format!("{new_column}_{MV_INDICATOR_SUFFIX}"),
            );
        }
        self.execute_change(tx, &change).await
    }

    /// Alter one property's column width.
    pub async fn resize_property(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        kind: &dyn DomainKind,
        property: &PropertyDescriptor,
        new_scale: i32,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let Some(column) = &property.storage_column_name else {
            return Err(DomainError::rejected(&property.name, "no storage column"));
        };
        let base_names = base_name_set(kind, domain);
        if base_names.contains(&column.to_ascii_lowercase()) {
            return Ok(());
        }
        let mut change = TableChange::new(ChangeType::ResizeColumns, &schema, &table);
        change.add_column_resize(column, property.property_type, new_scale);
        self.execute_change(tx, &change).await
    }

    /// In-place column retype for compatible (widening) conversions.
    pub async fn retype_property(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        property: &PropertyDescriptor,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let Some(column) = &property.storage_column_name else {
            return Err(DomainError::rejected(&property.name, "no storage column"));
        };
        let mut change = TableChange::new(ChangeType::ResizeColumns, &schema, &table);
        change.add_column_resize(column, property.property_type, property.scale);
        self.execute_change(tx, &change).await
    }

    /// Add the MV shadow column for a property that just enabled MV tracking.
    pub async fn add_mv_indicator(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        property: &PropertyDescriptor,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let Some(spec) = property.storage_spec() else {
            return Err(DomainError::rejected(&property.name, "no storage column"));
        };
        let mut change = TableChange::new(ChangeType::AddColumns, &schema, &table);
        change.add_column(spec.mv_column());
        self.execute_change(tx, &change).await
    }

    /// Drop the MV shadow column for a property that disabled MV tracking.
    /// The property's own column is untouched.
    pub async fn drop_mv_indicator(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
        property: &PropertyDescriptor,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let mv = self
            .mv_indicator_column(&mut **tx, &schema, &table, property)
            .await?;
        let mut change = TableChange::new(ChangeType::DropColumns, &schema, &table);
        change.drop_column_exact_name(&mv);
        self.execute_change(tx, &change).await
    }

    /// Drop the provisioned table for a domain being deleted.
    pub async fn drop_domain_table(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain: &Domain,
    ) -> DomainResult<()> {
        let Some(table) = &domain.descriptor.storage_table_name else {
            return Ok(());
        };
        let schema = domain
            .descriptor
            .storage_schema_name
            .clone()
            .unwrap_or_else(|| "labplate_storage".to_string());
        if !self.table_exists(&mut **tx, &schema, table).await? {
            warn!(schema = %schema, table = %table, "storage table does not exist, ignoring drop");
            return Ok(());
        }
        let change = TableChange::new(ChangeType::DropTable, &schema, table);
        self.execute_change(tx, &change).await
    }

    /// Upgrade helper: add any kind-mandated base columns missing from the
    /// live table.
    pub async fn ensure_base_properties(
        &self,
        domain: &mut Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<()> {
        let mut tx = self.pool.begin().await?;
        let table = self
            .ensure_storage_table(&mut tx, domain, kind)
            .await?;
        let schema = kind.storage_schema_name().to_string();
        let live = self.live_columns(&mut *tx, &schema, &table).await?;
        let live_names: HashSet<String> =
            live.iter().map(|c| c.name.to_ascii_lowercase()).collect();

        let mut change = TableChange::new(ChangeType::AddColumns, &schema, &table);
        for spec in kind.base_properties(domain) {
            if spec.name.is_empty() {
                return Err(DomainError::Unsupported(
                    "can't add property with no name".to_string(),
                ));
            }
            if !live_names.contains(&spec.name.to_ascii_lowercase()) {
                change.add_column(spec);
            }
        }
        if !change.is_empty() {
            self.execute_change(&mut tx, &change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Drop live indices that are no longer required by the kind + domain.
    /// The primary key is never dropped.
    pub async fn drop_not_required_indices(
        &self,
        domain: &Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<()> {
        if !domain.is_provisioned() {
            return Ok(());
        }
        let (schema, table) = self.storage_location(domain)?;
        let required = self.required_index_names(domain, kind, &table);
        let live = self.live_indices(&schema, &table).await?;

        let to_drop: Vec<String> = live
            .iter()
            .filter(|(_, primary)| !primary)
            .map(|(name, _)| name.clone())
            .filter(|name| !required.contains_key(&name.to_ascii_lowercase()))
            .collect();

        if to_drop.is_empty() {
            return Ok(());
        }
        let mut change = TableChange::new(ChangeType::DropIndicesByName, &schema, &table);
        change.drop_index_names = to_drop;
        let mut tx = self.pool.begin().await?;
        self.execute_change(&mut tx, &change).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Create required indices missing from the live table. Raises if a
    /// required index includes a primary-key column.
    pub async fn add_missing_required_indices(
        &self,
        domain: &Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<()> {
        let (schema, table) = self.storage_location(domain)?;
        let required = self.required_index_names(domain, kind, &table);
        let live = self.live_indices(&schema, &table).await?;
        let live_names: HashSet<String> = live
            .iter()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        let pk_columns = self.primary_key_columns(&self.pool, &schema, &table).await?;

        let mut to_add = Vec::new();
        for (name, index) in &required {
            if live_names.contains(name) {
                continue;
            }
            for col in &index.columns {
                if pk_columns
                    .iter()
                    .any(|pk| pk.eq_ignore_ascii_case(col))
                {
                    return Err(DomainError::Unsupported(format!(
                        "adding an index with primary key columns is not supported; primary keys are {}",
                        pk_columns.join(",")
                    )));
                }
            }
            to_add.push(index.clone());
        }

        if to_add.is_empty() {
            return Ok(());
        }
        let mut change = TableChange::new(ChangeType::AddIndices, &schema, &table);
        change.indices = to_add;
        let mut tx = self.pool.begin().await?;
        self.execute_change(&mut tx, &change).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Add and drop unique constraints (realized as unique indices) in one
    /// transaction, dropping before adding so a constraint can be rebuilt
    /// over a new column set in a single call.
    pub async fn add_or_drop_constraints(
        &self,
        domain: &Domain,
        add: &[TableIndex],
        drop: &[TableIndex],
    ) -> DomainResult<()> {
        if add.is_empty() && drop.is_empty() {
            return Ok(());
        }
        let (schema, table) = self.storage_location(domain)?;
        let mut tx = self.pool.begin().await?;
        if !drop.is_empty() {
            let mut change = TableChange::new(ChangeType::DropIndicesByName, &schema, &table);
            change.drop_index_names = drop
                .iter()
                .map(|ix| canonical_index_name(&table, ix))
                .collect();
            self.execute_change(&mut tx, &change).await?;
        }
        if !add.is_empty() {
            let mut change = TableChange::new(ChangeType::AddIndices, &schema, &table);
            change.indices = add.to_vec();
            self.execute_change(&mut tx, &change).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Live queryable view of a provisioned domain with the logical-to-
    /// physical alias map applied.
    pub async fn table_info(&self, domain: &Domain, kind: &dyn DomainKind) -> DomainResult<TableInfo> {
        let (schema, table) = self.storage_location(domain)?;
        let columns = self.live_columns(&self.pool, &schema, &table).await?;
        if columns.is_empty() {
            return Err(DomainError::TableNotFound(format!("{schema}.{table}")));
        }

        let mut aliases = HashMap::new();
        let mut seen = HashSet::new();
        let base_names = base_name_set(kind, domain);
        for property in &domain.properties {
            if kind.properties_include_base_properties()
                && base_names.contains(&property.name.to_ascii_lowercase())
            {
                continue;
            }
            // Duplicate descriptor names indicate upstream corruption; fail
            // loudly with a diagnosable message instead of mis-mapping.
            if !seen.insert(property.name.to_ascii_lowercase()) {
                return Err(DomainError::Unsupported(format!(
                    "duplicate property descriptor name found for: {table}.{}",
                    property.name
                )));
            }
            if let Some(column) = &property.storage_column_name {
                if columns.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
                    aliases.insert(property.name.clone(), column.clone());
                } else {
                    info!(table = %table, column = %column, "column not found in storage table");
                }
            } else {
                warn!(property = %property.name, table = %table, "no storage column name set");
            }
        }

        Ok(TableInfo {
            schema,
            table,
            columns,
            aliases,
        })
    }

    // ============================================
    // Catalog inspection helpers
    // ============================================

    /// Catalog reads take the caller's executor so inspection inside an open
    /// transaction sees that transaction's own uncommitted DDL.
    pub(crate) async fn live_columns<'e, E>(
        &self,
        executor: E,
        schema: &str,
        table: &str,
    ) -> DomainResult<Vec<LiveColumn>>
    where
        E: PgExecutor<'e>,
    {
        let rows = sqlx::query(
            r#"
            SELECT column_name, data_type, character_maximum_length, is_nullable
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(executor)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| LiveColumn {
                name: row.get::<String, _>("column_name"),
                data_type: row.get::<String, _>("data_type"),
                max_length: row.get::<Option<i32>, _>("character_maximum_length"),
                nullable: row.get::<String, _>("is_nullable") == "YES",
            })
            .collect())
    }

    pub(crate) async fn table_exists<'e, E>(
        &self,
        executor: E,
        schema: &str,
        table: &str,
    ) -> DomainResult<bool>
    where
        E: PgExecutor<'e>,
    {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(executor)
        .await?;
        Ok(count > 0)
    }

    pub(crate) async fn tables_in_schema(&self, schema: &str) -> DomainResult<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    /// (index name, is primary) pairs for a live table.
    async fn live_indices(&self, schema: &str, table: &str) -> DomainResult<Vec<(String, bool)>> {
        let rows = sqlx::query(
            r#"
            SELECT i.relname AS index_name, ix.indisprimary AS is_primary
            FROM pg_class t
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_index ix ON t.oid = ix.indrelid
            JOIN pg_class i ON i.oid = ix.indexrelid
            WHERE n.nspname = $1 AND t.relname = $2
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<String, _>("index_name"),
                    row.get::<bool, _>("is_primary"),
                )
            })
            .collect())
    }

    pub(crate) async fn primary_key_columns<'e, E>(
        &self,
        executor: E,
        schema: &str,
        table: &str,
    ) -> DomainResult<Vec<String>>
    where
        E: PgExecutor<'e>,
    {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT a.attname
            FROM pg_index ix
            JOIN pg_class t ON t.oid = ix.indrelid
            JOIN pg_namespace n ON n.oid = t.relnamespace
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
            WHERE ix.indisprimary AND n.nspname = $1 AND t.relname = $2
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(executor)
        .await?;
        Ok(names)
    }

    /// Resolve the live MV shadow column name for a property, raising when
    /// it is expected but absent.
    async fn mv_indicator_column<'e, E>(
        &self,
        executor: E,
        schema: &str,
        table: &str,
        property: &PropertyDescriptor,
    ) -> DomainResult<String>
    where
        E: PgExecutor<'e>,
    {
        let Some(expected) = property.mv_storage_column_name() else {
            return Err(DomainError::rejected(&property.name, "no storage column"));
        };
        let live = self.live_columns(executor, schema, table).await?;
        live.iter()
            .find(|c| c.name.eq_ignore_ascii_case(&expected))
            .map(|c| c.name.clone())
            .ok_or_else(|| DomainError::ColumnNotFound {
                table: table.to_string(),
                column: expected,
            })
    }

    fn required_index_names(
        &self,
        domain: &Domain,
        kind: &dyn DomainKind,
        table: &str,
    ) -> HashMap<String, TableIndex> {
        let mut required = kind.required_indices(domain);
        required.extend(domain_declared_indices(domain));
        required
            .into_iter()
            .map(|ix| (canonical_index_name(table, &ix), ix))
            .collect()
    }

    fn storage_location(&self, domain: &Domain) -> DomainResult<(String, String)> {
        let table = domain
            .descriptor
            .storage_table_name
            .clone()
            .ok_or_else(|| DomainError::TableNotFound(domain.descriptor.domain_uri.clone()))?;
        let schema = domain
            .descriptor
            .storage_schema_name
            .clone()
            .unwrap_or_else(|| "labplate_storage".to_string());
        Ok((schema, table))
    }

    pub(crate) async fn execute_change(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        change: &TableChange,
    ) -> DomainResult<()> {
        for statement in change.render_sql() {
            debug!(sql = %statement, "executing table change");
            sqlx::query(&statement).execute(&mut **tx).await?;
        }
        Ok(())
    }
}

/// Indices declared on the domain itself (unique constraints over declared
/// properties), as opposed to the kind's mandated indices.
fn domain_declared_indices(domain: &Domain) -> Vec<TableIndex> {
    // Declared per-property uniqueness arrives through the kind today; the
    // hook stays so domain-level indices have one place to join the diff.
    let _ = domain;
    Vec::new()
}

fn base_name_set(kind: &dyn DomainKind, domain: &Domain) -> HashSet<String> {
    kind.base_properties(domain)
        .iter()
        .map(|s| s.name.to_ascii_lowercase())
        .collect()
}
