//! Domain lifecycle service
//!
//! `DomainService` owns the full life of a domain: create, load (through the
//! injected cache), save a batch of property changes, and delete. A save is
//! one transaction that locks the descriptor row, verifies the caller's
//! optimistic token, validates every proposed change against the kind's
//! rules, applies metadata and physical DDL in a fixed order (drops before
//! adds, renames in two phases), and defers audit and cache work until the
//! transaction outcome is known.

use crate::cache::{ContainerCache, DomainCache};
use crate::database::tx::{PostTask, ResolvedTasks, TxContext};
use crate::error::{DomainError, DomainResult};
use crate::models::domain_models::{DomainDescriptorRow, PropertyDescriptorRow};
use crate::properties::audit::{self, DomainAuditService};
use crate::properties::change::{PropertyChange, PropertyDelta, PropertyDraft};
use crate::properties::descriptor::{Domain, DomainDescriptor, PropertyDescriptor};
use crate::properties::kind::{DomainKind, DomainKindRegistry};
use crate::properties::manager::{ContainerProperties, DomainPropertyManager};
use crate::properties::types::{PropertyType, MV_INDICATOR_SUFFIX};
use crate::provisioner::naming::{legal_identifier, temp_rename_identifier, ColumnAliasAllocator};
use crate::provisioner::table_change::{ChangeType, TableChange};
use crate::provisioner::StorageProvisioner;
use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const DESCRIPTOR_COLUMNS: &str = "domain_id, domain_uri, name, container, kind, \
     storage_schema_name, storage_table_name, modified";

const PROPERTY_COLUMNS: &str = "property_id, domain_id, property_uri, name, range_type, scale, \
     required, mv_enabled, storage_column_name, sort_order, description, format, url, \
     default_value, lookup_schema, lookup_query";

/// Caller options for one save.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// First-writer-wins: if the domain already holds properties, return the
    /// stored domain untouched instead of applying changes or failing.
    pub save_only_if_not_exists: bool,
    /// Ask the kind to wipe row data before structural changes (honored only
    /// for kinds that replace all rows on field import).
    pub delete_all_data: bool,
    /// Allow adds whose name collides with a kind base column; normally such
    /// adds are skipped with a warning.
    pub allow_add_base_property: bool,
    /// Overrides the generated audit comment for this save.
    pub audit_comment: Option<String>,
    pub user: Option<String>,
}

/// What a save did.
#[derive(Debug)]
pub struct SaveOutcome {
    pub domain: Arc<Domain>,
    /// False when `save_only_if_not_exists` short-circuited.
    pub changed: bool,
}

struct UpdatePlan {
    baseline: PropertyDescriptor,
    draft: PropertyDraft,
    delta: PropertyDelta,
}

struct SavePlan {
    deletes: Vec<PropertyDescriptor>,
    updates: Vec<UpdatePlan>,
    adds: Vec<PropertyDraft>,
}

impl SavePlan {
    fn is_structural(&self) -> bool {
        !self.deletes.is_empty()
            || !self.adds.is_empty()
            || self.updates.iter().any(|u| u.delta.is_structural())
    }

    fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.updates.is_empty() && self.adds.is_empty()
    }
}

pub struct DomainService {
    pool: PgPool,
    registry: Arc<DomainKindRegistry>,
    provisioner: Arc<StorageProvisioner>,
    audit: Arc<DomainAuditService>,
    domain_cache: Arc<DomainCache>,
    property_cache: Arc<ContainerCache<ContainerProperties>>,
}

impl DomainService {
    pub fn new(
        pool: PgPool,
        registry: Arc<DomainKindRegistry>,
        provisioner: Arc<StorageProvisioner>,
        audit: Arc<DomainAuditService>,
        domain_cache: Arc<DomainCache>,
        property_cache: Arc<ContainerCache<ContainerProperties>>,
    ) -> Self {
        Self {
            pool,
            registry,
            provisioner,
            audit,
            domain_cache,
            property_cache,
        }
    }

    // ============================================
    // Create / load / list
    // ============================================

    /// Create a new domain descriptor, optionally with an initial property
    /// list, and provision its storage table when properties are given.
    pub async fn create_domain(
        &self,
        container: Uuid,
        kind_name: &str,
        name: &str,
        domain_uri: &str,
        initial: Vec<PropertyDraft>,
        options: &SaveOptions,
    ) -> DomainResult<Arc<Domain>> {
        let kind = self
            .registry
            .get(kind_name)
            .ok_or_else(|| DomainError::KindNotFound(kind_name.to_string()))?;

        if let Some(existing) = self.find_descriptor(container, domain_uri).await? {
            if options.save_only_if_not_exists {
                info!(domain = %domain_uri, "domain already exists, returning stored definition");
                return self.load_domain(container, &existing.domain_uri).await;
            }
            return Err(DomainError::Unsupported(format!(
                "a domain named '{}' already exists in this container",
                existing.name
            )));
        }

        let mut ctx = TxContext::begin(&self.pool).await?;
        ctx.invalidate_always(container, domain_uri);

        let result = self
            .create_inner(&mut ctx, container, kind.as_ref(), name, domain_uri, initial, options)
            .await;

        match result {
            Ok(domain) => {
                let tasks = ctx.commit().await?;
                self.run_tasks(tasks).await;
                kind.invalidate(&domain);
                self.load_domain(container, domain_uri).await
            }
            Err(error) => {
                self.resolve_failed(ctx, container, domain_uri).await;
                // a racing creator may have slipped past the pre-check; the
                // descriptor's unique constraint is the arbiter
                if is_descriptor_unique_violation(&error) {
                    if options.save_only_if_not_exists {
                        info!(domain = %domain_uri, "lost create race, returning stored definition");
                        return self.load_domain(container, domain_uri).await;
                    }
                    return Err(DomainError::Unsupported(format!(
                        "a domain with URI '{domain_uri}' already exists in this container"
                    )));
                }
                Err(error)
            }
        }
    }

    async fn create_inner(
        &self,
        ctx: &mut TxContext<'_>,
        container: Uuid,
        kind: &dyn DomainKind,
        name: &str,
        domain_uri: &str,
        initial: Vec<PropertyDraft>,
        options: &SaveOptions,
    ) -> DomainResult<Domain> {
        let row = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "INSERT INTO labplate.domain_descriptor (domain_uri, name, container, kind)
             VALUES ($1, $2, $3, $4)
             RETURNING {DESCRIPTOR_COLUMNS}"
        ))
        .bind(domain_uri)
        .bind(name)
        .bind(container)
        .bind(kind.kind_name())
        .fetch_one(&mut **ctx.tx())
        .await?;

        let mut domain = Domain {
            descriptor: DomainDescriptor::from(row),
            properties: Vec::new(),
        };

        if !initial.is_empty() {
            let plan = self.validate_plan(&domain, kind, initial.into_iter().map(PropertyChange::Add).collect())?;
            self.apply_plan(ctx, &mut domain, kind, plan, options).await?;
            domain = self.reload_in_tx(ctx.tx(), domain.descriptor.domain_id).await?;
        }

        info!(domain = %domain_uri, kind = kind.kind_name(), "domain created");
        ctx.on_commit(PostTask::Audit(audit::created_event(
            &domain,
            options.user.as_deref(),
        )));
        Ok(domain)
    }

    /// Load a domain snapshot through the cache.
    pub async fn load_domain(&self, container: Uuid, domain_uri: &str) -> DomainResult<Arc<Domain>> {
        if let Some(domain) = self.domain_cache.get(container, domain_uri) {
            return Ok(domain);
        }
        let descriptor = self
            .find_descriptor(container, domain_uri)
            .await?
            .ok_or_else(|| DomainError::DomainNotFound(domain_uri.to_string()))?;
        let domain = Arc::new(self.fetch_domain(descriptor).await?);
        self.domain_cache.put(domain.clone());
        Ok(domain)
    }

    pub async fn domain_by_id(&self, domain_id: i32) -> DomainResult<Domain> {
        let row = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor WHERE domain_id = $1"
        ))
        .bind(domain_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DomainError::DomainNotFound(format!("domain id {domain_id}")))?;
        self.fetch_domain(row).await
    }

    pub async fn list_domains(&self, container: Uuid) -> DomainResult<Vec<DomainDescriptor>> {
        let rows = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor
             WHERE container = $1 ORDER BY name"
        ))
        .bind(container)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(DomainDescriptor::from).collect())
    }

    // ============================================
    // Save
    // ============================================

    /// Apply a batch of property changes against a loaded snapshot.
    pub async fn save(
        &self,
        snapshot: &Domain,
        changes: Vec<PropertyChange>,
        options: &SaveOptions,
    ) -> DomainResult<SaveOutcome> {
        let container = snapshot.descriptor.container;
        let domain_uri = snapshot.descriptor.domain_uri.clone();
        let kind = self
            .registry
            .get(&snapshot.descriptor.kind)
            .ok_or_else(|| DomainError::KindNotFound(snapshot.descriptor.kind.clone()))?;

        let mut ctx = TxContext::begin(&self.pool).await?;
        ctx.invalidate_always(container, &domain_uri);

        let result = self
            .save_inner(&mut ctx, snapshot, kind.as_ref(), changes, options)
            .await;

        match result {
            Ok(outcome) => {
                let tasks = ctx.commit().await?;
                self.run_tasks(tasks).await;
                kind.invalidate(&outcome.domain);
                Ok(outcome)
            }
            Err(error) => {
                self.resolve_failed(ctx, container, &domain_uri).await;
                Err(error)
            }
        }
    }

    async fn save_inner(
        &self,
        ctx: &mut TxContext<'_>,
        snapshot: &Domain,
        kind: &dyn DomainKind,
        changes: Vec<PropertyChange>,
        options: &SaveOptions,
    ) -> DomainResult<SaveOutcome> {
        // Row lock: serializes every save against this domain.
        let locked = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor
             WHERE domain_id = $1 FOR UPDATE"
        ))
        .bind(snapshot.descriptor.domain_id)
        .fetch_optional(&mut **ctx.tx())
        .await?
        .ok_or_else(|| DomainError::DomainNotFound(snapshot.descriptor.domain_uri.clone()))?;

        let mut baseline = self.reload_in_tx(ctx.tx(), locked.domain_id).await?;

        if options.save_only_if_not_exists && !baseline.properties.is_empty() {
            info!(
                domain = %baseline.descriptor.domain_uri,
                "domain already has properties, keeping stored definition"
            );
            return Ok(SaveOutcome {
                domain: Arc::new(baseline),
                changed: false,
            });
        }

        if locked.modified != snapshot.descriptor.modified {
            return Err(DomainError::OptimisticConflict {
                domain_uri: snapshot.descriptor.domain_uri.clone(),
            });
        }

        let before = baseline.clone();
        let plan = self.validate_plan(&baseline, kind, changes)?;
        if plan.is_empty() {
            debug!(domain = %baseline.descriptor.domain_uri, "nothing to save");
            return Ok(SaveOutcome {
                domain: Arc::new(baseline),
                changed: false,
            });
        }
        self.apply_plan(ctx, &mut baseline, kind, plan, options).await?;

        sqlx::query(
            "UPDATE labplate.domain_descriptor SET modified = now() WHERE domain_id = $1",
        )
        .bind(baseline.descriptor.domain_id)
        .execute(&mut **ctx.tx())
        .await?;

        let after = self.reload_in_tx(ctx.tx(), baseline.descriptor.domain_id).await?;
        let mut event = audit::modified_event(&before, &after, options.user.as_deref());
        if let Some(comment) = &options.audit_comment {
            event.comment = Some(comment.clone());
        }
        ctx.on_commit(PostTask::Audit(event));
        ctx.on_commit(PostTask::InvalidateContainer {
            container: after.descriptor.container,
        });

        info!(domain = %after.descriptor.domain_uri, "domain saved");
        Ok(SaveOutcome {
            domain: Arc::new(after),
            changed: true,
        })
    }

    // ============================================
    // Delete
    // ============================================

    /// Delete a domain: its provisioned table, property rows, validators and
    /// formats, and finally the descriptor itself.
    pub async fn delete_domain(&self, snapshot: &Domain, options: &SaveOptions) -> DomainResult<()> {
        let container = snapshot.descriptor.container;
        let domain_uri = snapshot.descriptor.domain_uri.clone();
        let kind = self
            .registry
            .get(&snapshot.descriptor.kind)
            .ok_or_else(|| DomainError::KindNotFound(snapshot.descriptor.kind.clone()))?;

        let mut ctx = TxContext::begin(&self.pool).await?;
        ctx.invalidate_always(container, &domain_uri);

        let result = self
            .delete_inner(&mut ctx, snapshot, options)
            .await;

        match result {
            Ok(deleted) => {
                let tasks = ctx.commit().await?;
                self.run_tasks(tasks).await;
                kind.invalidate(&deleted);
                Ok(())
            }
            Err(error) => {
                self.resolve_failed(ctx, container, &domain_uri).await;
                Err(error)
            }
        }
    }

    async fn delete_inner(
        &self,
        ctx: &mut TxContext<'_>,
        snapshot: &Domain,
        options: &SaveOptions,
    ) -> DomainResult<Domain> {
        let locked = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor
             WHERE domain_id = $1 FOR UPDATE"
        ))
        .bind(snapshot.descriptor.domain_id)
        .fetch_optional(&mut **ctx.tx())
        .await?
        .ok_or_else(|| DomainError::DomainNotFound(snapshot.descriptor.domain_uri.clone()))?;

        let domain = self.reload_in_tx(ctx.tx(), locked.domain_id).await?;

        self.provisioner.drop_domain_table(ctx.tx(), &domain).await?;

        for property in &domain.properties {
            DomainPropertyManager::delete_all_for_property(ctx.tx(), property.property_id).await?;
        }
        sqlx::query("DELETE FROM labplate.property_descriptor WHERE domain_id = $1")
            .bind(domain.descriptor.domain_id)
            .execute(&mut **ctx.tx())
            .await?;
        sqlx::query("DELETE FROM labplate.domain_descriptor WHERE domain_id = $1")
            .bind(domain.descriptor.domain_id)
            .execute(&mut **ctx.tx())
            .await?;

        ctx.on_commit(PostTask::Audit(audit::deleted_event(
            &domain,
            options.user.as_deref(),
        )));
        ctx.on_commit(PostTask::InvalidateContainer {
            container: domain.descriptor.container,
        });

        info!(domain = %domain.descriptor.domain_uri, "domain deleted");
        Ok(domain)
    }

    // ============================================
    // Validation
    // ============================================

    fn validate_plan(
        &self,
        baseline: &Domain,
        kind: &dyn DomainKind,
        changes: Vec<PropertyChange>,
    ) -> DomainResult<SavePlan> {
        let mut plan = SavePlan {
            deletes: Vec::new(),
            updates: Vec::new(),
            adds: Vec::new(),
        };

        let mut touched: HashSet<i32> = HashSet::new();
        for change in changes {
            match change {
                PropertyChange::Delete { property_id } => {
                    let property = baseline
                        .property_by_id(property_id)
                        .ok_or_else(|| {
                            DomainError::rejected(
                                format!("#{property_id}"),
                                "no such property in this domain",
                            )
                        })?
                        .clone();
                    if !touched.insert(property_id) {
                        return Err(DomainError::rejected(&property.name, "changed twice in one save"));
                    }
                    plan.deletes.push(property);
                }
                PropertyChange::Update { property_id, draft } => {
                    let property = baseline
                        .property_by_id(property_id)
                        .ok_or_else(|| {
                            DomainError::rejected(
                                format!("#{property_id}"),
                                "no such property in this domain",
                            )
                        })?
                        .clone();
                    if !touched.insert(property_id) {
                        return Err(DomainError::rejected(&property.name, "changed twice in one save"));
                    }
                    validate_draft(kind, &draft)?;
                    let delta = PropertyDelta::classify(&property, &draft);
                    if delta.renamed && delta.mv_enabled_now {
                        return Err(DomainError::rejected(
                            &property.name,
                            "cannot rename a property and enable missing value indicators in the same save",
                        ));
                    }
                    if delta.recreate_required || delta.retyped_in_place {
                        if property.property_type == PropertyType::UniqueId
                            || draft.property_type == PropertyType::UniqueId
                        {
                            return Err(DomainError::rejected(
                                &property.name,
                                "the type of a unique id property cannot change",
                            ));
                        }
                    }
                    plan.updates.push(UpdatePlan {
                        baseline: property,
                        draft,
                        delta,
                    });
                }
                PropertyChange::Add(draft) => {
                    validate_draft(kind, &draft)?;
                    plan.adds.push(draft);
                }
            }
        }

        // Final logical name set must be collision free, including against
        // every property's would-be MV shadow alias.
        let mut final_names: Vec<String> = Vec::new();
        for property in &baseline.properties {
            if plan.deletes.iter().any(|d| d.property_id == property.property_id) {
                continue;
            }
            match plan
                .updates
                .iter()
                .find(|u| u.baseline.property_id == property.property_id)
            {
                Some(update) => final_names.push(update.draft.name.clone()),
                None => final_names.push(property.name.clone()),
            }
        }
        for draft in &plan.adds {
            final_names.push(draft.name.clone());
        }

        let mut seen = HashSet::new();
        for name in &final_names {
            if !seen.insert(name.to_ascii_lowercase()) {
                return Err(DomainError::rejected(name, "duplicate property name"));
            }
        }
        let legal: Vec<String> = final_names.iter().map(|n| legal_identifier(n)).collect();
        for (i, name) in legal.iter().enumerate() {
            if let Some(prefix) = name.strip_suffix(&format!("_{MV_INDICATOR_SUFFIX}")) {
                if legal.iter().enumerate().any(|(j, other)| i != j && other == prefix) {
                    return Err(DomainError::rejected(
                        &final_names[i],
                        "conflicts with another property's missing value indicator column",
                    ));
                }
            }
        }

        Ok(plan)
    }

    // ============================================
    // Apply
    // ============================================

    async fn apply_plan(
        &self,
        ctx: &mut TxContext<'_>,
        domain: &mut Domain,
        kind: &dyn DomainKind,
        mut plan: SavePlan,
        options: &SaveOptions,
    ) -> DomainResult<()> {
        self.validate_lookup_targets(ctx, &plan).await?;

        let structural = plan.is_structural();
        let was_provisioned = domain.is_provisioned();

        if was_provisioned
            && structural
            && options.delete_all_data
            && kind.delete_all_data_on_field_import()
        {
            self.truncate_rows(ctx.tx(), domain).await?;
        }

        // -- metadata: deletes
        for property in &plan.deletes {
            DomainPropertyManager::delete_all_for_property(ctx.tx(), property.property_id).await?;
            sqlx::query("DELETE FROM labplate.property_descriptor WHERE property_id = $1")
                .bind(property.property_id)
                .execute(&mut **ctx.tx())
                .await?;
        }
        if was_provisioned && !plan.deletes.is_empty() {
            self.provisioner
                .drop_properties(ctx.tx(), domain, kind, &plan.deletes)
                .await?;
        }

        // -- allocator seeded with base columns and every surviving column
        let mut allocator = ColumnAliasAllocator::new();
        for spec in kind.base_properties(domain) {
            allocator.claim(&spec.name);
        }
        let deleted: HashSet<i32> = plan.deletes.iter().map(|p| p.property_id).collect();
        let renamed: HashSet<i32> = plan
            .updates
            .iter()
            .filter(|u| u.delta.renamed)
            .map(|u| u.baseline.property_id)
            .collect();
        for property in &domain.properties {
            if deleted.contains(&property.property_id) || renamed.contains(&property.property_id) {
                continue;
            }
            if let Some(column) = &property.storage_column_name {
                allocator.claim(column);
                allocator.claim(&format!("{column}_{MV_INDICATOR_SUFFIX}"));
            }
        }

        // -- renames: allocate targets, then metadata, then two-phase DDL
        let mut column_renames: Vec<(String, String, bool)> = Vec::new();
        let mut pre_rename_columns: std::collections::HashMap<i32, String> =
            std::collections::HashMap::new();
        for update in plan.updates.iter_mut().filter(|u| u.delta.renamed) {
            let old_column = update.baseline.storage_column_name.clone().ok_or_else(|| {
                DomainError::rejected(&update.baseline.name, "no storage column to rename")
            })?;
            let new_column = allocator.allocate(&update.draft.name);
            // a shadow being dropped in this same save keeps its old name and
            // is dropped by that name below
            let mv_carried = update.baseline.mv_enabled && !update.delta.mv_disabled_now;
            column_renames.push((old_column.clone(), new_column.clone(), mv_carried));
            pre_rename_columns.insert(update.baseline.property_id, old_column);
            update.baseline.storage_column_name = Some(new_column);
        }
        if was_provisioned && !column_renames.is_empty() {
            // phase one parks every column on a collision-free temp name so
            // swap chains (a->b, b->a) never trip over a live name
            let mut parked = Vec::with_capacity(column_renames.len());
            for (old_column, new_column, mv_carried) in &column_renames {
                let temp = temp_rename_identifier();
                self.provisioner
                    .rename_property(ctx.tx(), domain, kind, old_column, &temp, *mv_carried, false)
                    .await?;
                parked.push((temp, new_column.clone(), *mv_carried));
            }
            for (temp, new_column, mv_carried) in parked {
                self.provisioner
                    .rename_property(ctx.tx(), domain, kind, &temp, &new_column, mv_carried, false)
                    .await?;
            }
        }

        // metadata names need the same two phases: the unique index on
        // (domain_id, lower(name)) is not deferrable, so a swap chain parks
        // each renamed row on a temp name before the final UPDATE below
        for update in plan.updates.iter().filter(|u| u.delta.renamed) {
            sqlx::query("UPDATE labplate.property_descriptor SET name = $1 WHERE property_id = $2")
                .bind(temp_rename_identifier())
                .bind(update.baseline.property_id)
                .execute(&mut **ctx.tx())
                .await?;
        }

        // -- updates: metadata write plus per-delta structural work
        let (schema, table) = if was_provisioned {
            let t = domain.descriptor.storage_table_name.clone();
            (
                domain
                    .descriptor
                    .storage_schema_name
                    .clone()
                    .unwrap_or_else(|| kind.storage_schema_name().to_string()),
                t,
            )
        } else {
            (kind.storage_schema_name().to_string(), None)
        };

        for update in &plan.updates {
            let column = update.baseline.storage_column_name.clone();
            let updated = updated_descriptor(&update.baseline, &update.draft);

            sqlx::query(
                "UPDATE labplate.property_descriptor
                 SET name = $1, range_type = $2, scale = $3, required = $4, mv_enabled = $5,
                     storage_column_name = $6, description = $7, format = $8, url = $9,
                     default_value = $10, lookup_schema = $11, lookup_query = $12
                 WHERE property_id = $13",
            )
            .bind(&updated.name)
            .bind(updated.property_type.as_str())
            .bind(updated.scale)
            .bind(updated.required)
            .bind(updated.mv_enabled)
            .bind(&updated.storage_column_name)
            .bind(&updated.description)
            .bind(&updated.format)
            .bind(&updated.url)
            .bind(&updated.default_value)
            .bind(updated.lookup.as_ref().map(|l| l.schema.clone()))
            .bind(updated.lookup.as_ref().map(|l| l.query.clone()))
            .bind(updated.property_id)
            .execute(&mut **ctx.tx())
            .await?;

            if !was_provisioned {
                continue;
            }
            let (Some(table), Some(column)) = (table.as_deref(), column.as_deref()) else {
                continue;
            };

            if update.delta.recreate_required {
                // incompatible retype: drop and recreate the column in place,
                // existing values are discarded
                warn!(
                    property = %updated.name,
                    "incompatible type change, column will be recreated and its data dropped"
                );
                let mut drops = TableChange::new(ChangeType::DropColumns, &schema, table);
                drops.drop_column_exact_name(column);
                if update.baseline.mv_enabled {
                    drops.drop_column_exact_name(&format!("{column}_{MV_INDICATOR_SUFFIX}"));
                }
                self.provisioner.execute_change(ctx.tx(), &drops).await?;

                let mut adds = TableChange::new(ChangeType::AddColumns, &schema, table);
                if let Some(spec) = updated.storage_spec() {
                    if updated.mv_enabled {
                        adds.add_column(spec.mv_column());
                    }
                    adds.add_column(spec);
                }
                self.provisioner.execute_change(ctx.tx(), &adds).await?;
                continue;
            }

            if update.delta.mv_disabled_now {
                let mut target = update.baseline.clone();
                if let Some(old_column) = pre_rename_columns.get(&update.baseline.property_id) {
                    target.storage_column_name = Some(old_column.clone());
                }
                self.provisioner
                    .drop_mv_indicator(ctx.tx(), domain, &target)
                    .await?;
            }
            if update.delta.mv_enabled_now {
                self.provisioner
                    .add_mv_indicator(ctx.tx(), domain, &updated)
                    .await?;
            }
            if update.delta.resized_shrink {
                let overflow = self
                    .count_where(
                        ctx.tx(),
                        &schema,
                        table,
                        &format!("LENGTH(\"{column}\") > {}", updated.scale),
                    )
                    .await?;
                if overflow > 0 {
                    return Err(DomainError::rejected(
                        &updated.name,
                        format!("{overflow} row(s) hold values longer than the new size"),
                    ));
                }
            }
            if update.delta.resized_grow || update.delta.resized_shrink {
                self.provisioner
                    .resize_property(ctx.tx(), domain, kind, &updated, updated.scale)
                    .await?;
            }
            if update.delta.retyped_in_place {
                self.provisioner.retype_property(ctx.tx(), domain, &updated).await?;
            }
            if update.delta.newly_required {
                let mut predicate = format!("\"{column}\" IS NULL");
                if updated.mv_enabled {
                    predicate.push_str(&format!(
                        " AND \"{column}_{MV_INDICATOR_SUFFIX}\" IS NULL"
                    ));
                }
                let nulls = self.count_where(ctx.tx(), &schema, table, &predicate).await?;
                if nulls > 0 {
                    return Err(DomainError::rejected(
                        &updated.name,
                        format!("cannot be required, {nulls} existing row(s) have no value"),
                    ));
                }
            }
        }

        // -- adds: required-on-existing-rows guard, metadata, DDL, backfill
        if was_provisioned {
            if let Some(table) = table.as_deref() {
                let rows = self.count_where(ctx.tx(), &schema, table, "TRUE").await?;
                if rows > 0 {
                    for draft in &plan.adds {
                        if draft.required
                            && draft.default_value.is_none()
                            && draft.property_type != PropertyType::UniqueId
                        {
                            return Err(DomainError::rejected(
                                &draft.name,
                                format!(
                                    "cannot add a required property, the table already holds {rows} row(s)"
                                ),
                            ));
                        }
                    }
                }
            }
        }

        let next_sort = domain
            .properties
            .iter()
            .map(|p| p.sort_order)
            .max()
            .unwrap_or(-1)
            + 1;
        // renamed properties keep their original URI, so a re-added old name
        // must mint around the retained one
        let mut used_uris: HashSet<String> = domain
            .properties
            .iter()
            .filter(|p| !deleted.contains(&p.property_id))
            .map(|p| p.property_uri.clone())
            .collect();
        let mut added: Vec<PropertyDescriptor> = Vec::new();
        for (offset, draft) in plan.adds.iter().enumerate() {
            let column = allocator.allocate(&draft.name);
            let base_uri = format!(
                "{}#{}",
                domain.descriptor.domain_uri,
                legal_identifier(&draft.name)
            );
            let mut property_uri = base_uri.clone();
            let mut attempt = 1;
            while !used_uris.insert(property_uri.clone()) {
                property_uri = format!("{base_uri}-{attempt}");
                attempt += 1;
            }
            let row = sqlx::query_as::<_, PropertyDescriptorRow>(&format!(
                "INSERT INTO labplate.property_descriptor
                     (domain_id, property_uri, name, range_type, scale, required, mv_enabled,
                      storage_column_name, sort_order, description, format, url, default_value,
                      lookup_schema, lookup_query)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                 RETURNING {PROPERTY_COLUMNS}"
            ))
            .bind(domain.descriptor.domain_id)
            .bind(&property_uri)
            .bind(&draft.name)
            .bind(draft.property_type.as_str())
            .bind(draft.effective_scale())
            .bind(draft.required)
            .bind(draft.mv_enabled)
            .bind(&column)
            .bind(next_sort + offset as i32)
            .bind(&draft.description)
            .bind(&draft.format)
            .bind(&draft.url)
            .bind(&draft.default_value)
            .bind(draft.lookup.as_ref().map(|l| l.schema.clone()))
            .bind(draft.lookup.as_ref().map(|l| l.query.clone()))
            .fetch_one(&mut **ctx.tx())
            .await?;
            let descriptor = PropertyDescriptor::from_row(row).ok_or_else(|| {
                DomainError::rejected(&draft.name, "stored range type failed to parse back")
            })?;
            added.push(descriptor);
        }

        // refresh the in-memory view before provisioning so create-table sees
        // the final property list
        *domain = self.reload_in_tx(ctx.tx(), domain.descriptor.domain_id).await?;

        if !was_provisioned {
            if !domain.properties.is_empty() {
                self.provisioner
                    .ensure_storage_table(ctx.tx(), domain, kind)
                    .await?;
            }
        } else if !added.is_empty() {
            self.provisioner
                .add_properties(ctx.tx(), domain, kind, &added, options.allow_add_base_property)
                .await?;
        }

        // declared defaults land on pre-existing rows in the same transaction;
        // the required-add guard above counts on this
        if was_provisioned {
            if let Some(table) = domain.descriptor.storage_table_name.clone() {
                for descriptor in &added {
                    let (Some(column), Some(default)) = (
                        descriptor.storage_column_name.as_deref(),
                        descriptor.default_value.as_deref(),
                    ) else {
                        continue;
                    };
                    if descriptor.property_type == PropertyType::UniqueId {
                        continue;
                    }
                    let sql = format!(
                        "UPDATE \"{schema}\".\"{table}\" \
                         SET \"{column}\" = CAST($1 AS {}) \
                         WHERE \"{column}\" IS NULL",
                        descriptor.property_type.sql_type(descriptor.scale)
                    );
                    sqlx::query(&sql).bind(default).execute(&mut **ctx.tx()).await?;
                }
            }
        }

        // sequence-backed identifiers are backfilled onto existing rows
        if was_provisioned {
            if let Some(table) = domain.descriptor.storage_table_name.clone() {
                for descriptor in &added {
                    if descriptor.property_type != PropertyType::UniqueId {
                        continue;
                    }
                    if let Some(column) = &descriptor.storage_column_name {
                        let sql = format!(
                            "UPDATE \"{schema}\".\"{table}\" \
                             SET \"{column}\" = lpad(nextval('labplate.unique_id_seq')::text, 9, '0') \
                             WHERE \"{column}\" IS NULL"
                        );
                        sqlx::query(&sql).execute(&mut **ctx.tx()).await?;
                    }
                }
            }
        }

        Ok(())
    }

    // ============================================
    // Helpers
    // ============================================

    async fn truncate_rows(
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
        info!(table = %table, "deleting all rows before field import");
        sqlx::query(&format!("DELETE FROM \"{schema}\".\"{table}\""))
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Lookup targets that resolve to a live table must be keyed by a single
    /// column whose type the property can hold. Unresolved targets pass; they
    /// are bound lazily at query time.
    async fn validate_lookup_targets(
        &self,
        ctx: &mut TxContext<'_>,
        plan: &SavePlan,
    ) -> DomainResult<()> {
        let drafts = plan
            .adds
            .iter()
            .chain(plan.updates.iter().map(|u| &u.draft));
        for draft in drafts {
            let Some(lookup) = &draft.lookup else {
                continue;
            };
            let columns = self
                .provisioner
                .live_columns(&mut **ctx.tx(), &lookup.schema, &lookup.query)
                .await?;
            if columns.is_empty() {
                continue;
            }
            let pk = self
                .provisioner
                .primary_key_columns(&mut **ctx.tx(), &lookup.schema, &lookup.query)
                .await?;
            let [key] = pk.as_slice() else {
                return Err(DomainError::rejected(
                    &draft.name,
                    format!(
                        "lookup target {}.{} must have a single-column primary key",
                        lookup.schema, lookup.query
                    ),
                ));
            };
            let Some(key_column) = columns.iter().find(|c| c.name.eq_ignore_ascii_case(key))
            else {
                continue;
            };
            if !lookup_key_matches(draft.property_type, &key_column.data_type) {
                return Err(DomainError::rejected(
                    &draft.name,
                    format!(
                        "lookup target key '{key}' is {}, which a {} property cannot hold",
                        key_column.data_type,
                        draft.property_type.as_str()
                    ),
                ));
            }
        }
        Ok(())
    }

    async fn count_where(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        schema: &str,
        table: &str,
        predicate: &str,
    ) -> DomainResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM \"{schema}\".\"{table}\" WHERE {predicate}");
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut **tx).await?;
        Ok(count)
    }

    async fn find_descriptor(
        &self,
        container: Uuid,
        domain_uri: &str,
    ) -> DomainResult<Option<DomainDescriptorRow>> {
        let row = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor
             WHERE container = $1 AND domain_uri = $2"
        ))
        .bind(container)
        .bind(domain_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn fetch_domain(&self, descriptor: DomainDescriptorRow) -> DomainResult<Domain> {
        let rows = sqlx::query_as::<_, PropertyDescriptorRow>(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM labplate.property_descriptor
             WHERE domain_id = $1 ORDER BY sort_order, property_id"
        ))
        .bind(descriptor.domain_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(assemble(descriptor, rows))
    }

    async fn reload_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        domain_id: i32,
    ) -> DomainResult<Domain> {
        let descriptor = sqlx::query_as::<_, DomainDescriptorRow>(&format!(
            "SELECT {DESCRIPTOR_COLUMNS} FROM labplate.domain_descriptor WHERE domain_id = $1"
        ))
        .bind(domain_id)
        .fetch_one(&mut **tx)
        .await?;
        let rows = sqlx::query_as::<_, PropertyDescriptorRow>(&format!(
            "SELECT {PROPERTY_COLUMNS} FROM labplate.property_descriptor
             WHERE domain_id = $1 ORDER BY sort_order, property_id"
        ))
        .bind(domain_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(assemble(descriptor, rows))
    }

    async fn run_tasks(&self, tasks: ResolvedTasks) {
        for task in tasks.0 {
            match task {
                PostTask::Audit(event) => {
                    if let Err(error) = self.audit.record(event).await {
                        warn!(error = %error, "failed to record domain audit event");
                    }
                }
                PostTask::InvalidateDomain {
                    container,
                    domain_uri,
                } => self.domain_cache.invalidate(container, &domain_uri),
                PostTask::InvalidateContainer { container } => {
                    self.property_cache.invalidate(container);
                    self.domain_cache.invalidate_container(container);
                }
            }
        }
    }

    async fn resolve_failed(&self, ctx: TxContext<'_>, container: Uuid, domain_uri: &str) {
        match ctx.rollback().await {
            Ok(tasks) => self.run_tasks(tasks).await,
            Err(error) => {
                warn!(error = %error, "rollback failed after aborted save");
                self.domain_cache.invalidate(container, domain_uri);
            }
        }
    }
}

fn assemble(descriptor: DomainDescriptorRow, rows: Vec<PropertyDescriptorRow>) -> Domain {
    let properties = rows
        .into_iter()
        .filter_map(|row| {
            let name = row.name.clone();
            let parsed = PropertyDescriptor::from_row(row);
            if parsed.is_none() {
                warn!(property = %name, "skipping property with unknown range type");
            }
            parsed
        })
        .collect();
    Domain {
        descriptor: DomainDescriptor::from(descriptor),
        properties,
    }
}

fn updated_descriptor(baseline: &PropertyDescriptor, draft: &PropertyDraft) -> PropertyDescriptor {
    PropertyDescriptor {
        property_id: baseline.property_id,
        domain_id: baseline.domain_id,
        property_uri: baseline.property_uri.clone(),
        name: draft.name.clone(),
        property_type: draft.property_type,
        scale: draft.effective_scale(),
        required: draft.required,
        mv_enabled: draft.mv_enabled,
        storage_column_name: baseline.storage_column_name.clone(),
        sort_order: baseline.sort_order,
        description: draft.description.clone(),
        format: draft.format.clone(),
        url: draft.url.clone(),
        default_value: draft.default_value.clone(),
        lookup: draft.lookup.clone(),
    }
}

/// Whether a property of the given kind can hold keys of a lookup target's
/// primary-key column, by the catalog's `data_type` spelling.
fn lookup_key_matches(property_type: PropertyType, pk_data_type: &str) -> bool {
    match pk_data_type {
        "integer" | "smallint" => matches!(property_type, PropertyType::Integer),
        "bigint" => matches!(property_type, PropertyType::Integer | PropertyType::BigInt),
        "character varying" | "text" => matches!(
            property_type,
            PropertyType::Text | PropertyType::MultiLineText | PropertyType::UniqueId
        ),
        "uuid" => matches!(property_type, PropertyType::Uuid),
        _ => false,
    }
}

fn is_descriptor_unique_violation(error: &DomainError) -> bool {
    let DomainError::Sql(sqlx::Error::Database(db)) = error else {
        return false;
    };
    db.code().as_deref() == Some("23505")
        && db.constraint() == Some("uq_domain_descriptor_container_uri")
}

fn url_token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{[^}]+\}").unwrap_or_else(|_| unreachable!()))
}

fn validate_draft(kind: &dyn DomainKind, draft: &PropertyDraft) -> DomainResult<()> {
    let trimmed = draft.name.trim();
    if trimmed.is_empty() {
        return Err(DomainError::rejected(&draft.name, "blank property name"));
    }
    if kind
        .reserved_names()
        .iter()
        .any(|r| r.eq_ignore_ascii_case(trimmed))
    {
        return Err(DomainError::rejected(trimmed, "reserved name"));
    }
    if draft.mv_enabled && !draft.property_type.mv_applies() {
        return Err(DomainError::rejected(
            trimmed,
            "missing value indicators are not supported for this type",
        ));
    }
    if let Some(scale) = draft.scale {
        if scale < 0 {
            return Err(DomainError::rejected(trimmed, "negative size"));
        }
    }
    if let Some(format) = &draft.format {
        if format.trim().is_empty() {
            return Err(DomainError::rejected(trimmed, "blank display format"));
        }
        if let Err(message) = validate_format(draft.property_type, format) {
            return Err(DomainError::rejected(trimmed, message));
        }
    }
    if let Some(url_pattern) = &draft.url {
        // substitution tokens are legal anywhere in the pattern; the rest
        // must parse as an absolute URL
        let substituted = url_token_pattern().replace_all(url_pattern, "x");
        if Url::parse(&substituted).is_err() {
            return Err(DomainError::rejected(
                trimmed,
                format!("invalid URL pattern: {url_pattern}"),
            ));
        }
    }
    if let Some(lookup) = &draft.lookup {
        if lookup.schema.trim().is_empty() || lookup.query.trim().is_empty() {
            return Err(DomainError::rejected(
                trimmed,
                "lookup needs both a schema and a query",
            ));
        }
    }
    Ok(())
}

/// Check a display format string against the property's kind: strftime
/// patterns for date kinds, digit-placeholder patterns for numeric kinds.
/// Text kinds accept any non-blank format.
fn validate_format(property_type: PropertyType, format: &str) -> Result<(), String> {
    match property_type {
        PropertyType::Date | PropertyType::DateTime => {
            let broken = StrftimeItems::new(format).any(|item| matches!(item, Item::Error));
            if broken {
                Err(format!("invalid date format: {format}"))
            } else {
                Ok(())
            }
        }
        PropertyType::Integer
        | PropertyType::BigInt
        | PropertyType::Double
        | PropertyType::Decimal => {
            let has_placeholder = format.chars().any(|c| c == '0' || c == '#');
            let legal = format
                .chars()
                .all(|c| matches!(c, '0' | '#' | '.' | ',' | '%' | '-' | '+' | 'E' | ' '));
            if has_placeholder && legal {
                Ok(())
            } else {
                Err(format!("invalid number format: {format}"))
            }
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::kind::test_kinds::BasicTestKind;

    #[test]
    fn draft_validation_rejects_reserved_and_blank_names() {
        let kind = BasicTestKind;
        assert!(validate_draft(&kind, &PropertyDraft::new("  ", PropertyType::Text)).is_err());
        assert!(validate_draft(&kind, &PropertyDraft::new("Container", PropertyType::Text)).is_err());
        assert!(validate_draft(&kind, &PropertyDraft::new("Titer", PropertyType::Double)).is_ok());
    }

    #[test]
    fn draft_validation_rejects_mv_on_unique_id() {
        let kind = BasicTestKind;
        let draft = PropertyDraft::new("Barcode", PropertyType::UniqueId).mv_enabled();
        assert!(validate_draft(&kind, &draft).is_err());
    }

    #[test]
    fn url_patterns_allow_substitution_tokens() {
        let kind = BasicTestKind;
        let ok = PropertyDraft::new("Link", PropertyType::Text)
            .with_url("https://example.org/item?id=${Barcode}");
        assert!(validate_draft(&kind, &ok).is_ok());
        let bad = PropertyDraft::new("Link", PropertyType::Text).with_url("not a url ${x}");
        assert!(validate_draft(&kind, &bad).is_err());
    }

    #[test]
    fn date_formats_must_parse_as_strftime() {
        let kind = BasicTestKind;
        let ok = PropertyDraft::new("Drawn", PropertyType::Date).with_format("%Y-%m-%d");
        assert!(validate_draft(&kind, &ok).is_ok());
        let bad = PropertyDraft::new("Drawn", PropertyType::Date).with_format("taken on %");
        assert!(validate_draft(&kind, &bad).is_err());
    }

    #[test]
    fn number_formats_need_a_digit_placeholder() {
        let kind = BasicTestKind;
        let ok = PropertyDraft::new("Titer", PropertyType::Double).with_format("0.00");
        assert!(validate_draft(&kind, &ok).is_ok());
        let bad = PropertyDraft::new("Titer", PropertyType::Double).with_format("%Y-%m-%d");
        assert!(validate_draft(&kind, &bad).is_err());
    }

    #[test]
    fn lookup_keys_match_by_type_family() {
        assert!(lookup_key_matches(PropertyType::Integer, "integer"));
        assert!(lookup_key_matches(PropertyType::BigInt, "bigint"));
        assert!(lookup_key_matches(PropertyType::Text, "character varying"));
        assert!(lookup_key_matches(PropertyType::Uuid, "uuid"));
        assert!(!lookup_key_matches(PropertyType::Text, "integer"));
        assert!(!lookup_key_matches(PropertyType::Double, "double precision"));
    }

    #[test]
    fn updated_descriptor_keeps_identity_and_column() {
        let baseline = PropertyDescriptor {
            property_id: 9,
            domain_id: 2,
            property_uri: "urn:labplate:prop:old".into(),
            name: "Old".into(),
            property_type: PropertyType::Text,
            scale: 100,
            required: false,
            mv_enabled: false,
            storage_column_name: Some("old".into()),
            sort_order: 3,
            description: None,
            format: None,
            url: None,
            default_value: None,
            lookup: None,
        };
        let draft = PropertyDraft::new("New", PropertyType::Text).with_scale(200);
        let updated = updated_descriptor(&baseline, &draft);
        assert_eq!(updated.property_id, 9);
        assert_eq!(updated.property_uri, "urn:labplate:prop:old");
        assert_eq!(updated.storage_column_name.as_deref(), Some("old"));
        assert_eq!(updated.name, "New");
        assert_eq!(updated.scale, 200);
    }
}
