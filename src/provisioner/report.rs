//! Provisioning drift report and repair
//!
//! Metadata is ground truth. The report compares each provisioned domain's
//! descriptor list against the live catalog and names every divergence; repair
//! executes the suggested fixes (drops first, then adds) and invalidates the
//! kind's cached view.

use crate::error::{DomainError, DomainResult};
use crate::properties::descriptor::Domain;
use crate::properties::kind::DomainKind;
use crate::properties::types::MV_INDICATOR_SUFFIX;
use crate::provisioner::table_change::{ChangeType, TableChange};
use crate::provisioner::StorageProvisioner;
use std::collections::HashSet;
use tracing::{info, warn};

/// Reconciliation status of one expected column.
#[derive(Debug, Clone)]
pub struct ColumnStatus {
    pub property_name: String,
    pub expected_column: String,
    pub present: bool,
    pub mv_expected: bool,
    pub mv_present: bool,
    /// Human-readable suggested fix, empty when the column is healthy.
    pub fixes: Vec<String>,
}

impl ColumnStatus {
    pub fn is_healthy(&self) -> bool {
        self.fixes.is_empty()
    }
}

/// Report for one domain's provisioned table.
#[derive(Debug, Clone)]
pub struct DomainReport {
    pub domain_id: i32,
    pub domain_uri: String,
    pub schema: String,
    pub table: String,
    pub table_exists: bool,
    pub columns: Vec<ColumnStatus>,
    /// Live columns with no descriptor, base column, or MV shadow behind them.
    pub orphan_columns: Vec<String>,
}

impl DomainReport {
    pub fn is_healthy(&self) -> bool {
        self.table_exists
            && self.orphan_columns.is_empty()
            && self.columns.iter().all(ColumnStatus::is_healthy)
    }
}

/// Whole-schema reconciliation sweep.
#[derive(Debug, Clone)]
pub struct ProvisioningReport {
    pub domains: Vec<DomainReport>,
    /// Tables in the storage schema no descriptor points at.
    pub orphan_tables: Vec<String>,
}

impl ProvisioningReport {
    pub fn is_healthy(&self) -> bool {
        self.orphan_tables.is_empty() && self.domains.iter().all(DomainReport::is_healthy)
    }
}

impl StorageProvisioner {
    /// Reconcile one provisioned domain against the live catalog.
    pub async fn domain_report(
        &self,
        domain: &Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<DomainReport> {
        let table = domain
            .descriptor
            .storage_table_name
            .clone()
            .ok_or_else(|| DomainError::TableNotFound(domain.descriptor.domain_uri.clone()))?;
        let schema = domain
            .descriptor
            .storage_schema_name
            .clone()
            .unwrap_or_else(|| kind.storage_schema_name().to_string());

        let live = self.live_columns(self.pool(), &schema, &table).await?;
        let table_exists =
            !live.is_empty() || self.table_exists(self.pool(), &schema, &table).await?;
        let live_names: HashSet<String> =
            live.iter().map(|c| c.name.to_ascii_lowercase()).collect();

        let mut accounted: HashSet<String> = kind
            .base_properties(domain)
            .iter()
            .map(|s| s.name.to_ascii_lowercase())
            .collect();

        let mut columns = Vec::new();
        for property in &domain.properties {
            let Some(expected) = property.storage_column_name.clone() else {
                columns.push(ColumnStatus {
                    property_name: property.name.clone(),
                    expected_column: String::new(),
                    present: false,
                    mv_expected: property.mv_enabled,
                    mv_present: false,
                    fixes: vec![format!(
                        "No storage column allocated for '{}'",
                        property.name
                    )],
                });
                continue;
            };
            let expected_lower = expected.to_ascii_lowercase();
            let mv_column = format!("{expected_lower}_{MV_INDICATOR_SUFFIX}");
            let present = live_names.contains(&expected_lower);
            let mv_present = live_names.contains(&mv_column);
            accounted.insert(expected_lower);
            accounted.insert(mv_column);

            let mut fixes = Vec::new();
            if table_exists && !present {
                fixes.push(format!("Create column '{expected}'"));
            }
            if table_exists && property.mv_enabled && !mv_present {
                fixes.push(format!(
                    "Create column '{expected}_{MV_INDICATOR_SUFFIX}'"
                ));
            }
            if table_exists && !property.mv_enabled && mv_present {
                fixes.push(format!(
                    "Drop column '{expected}_{MV_INDICATOR_SUFFIX}'"
                ));
            }

            columns.push(ColumnStatus {
                property_name: property.name.clone(),
                expected_column: expected,
                present,
                mv_expected: property.mv_enabled,
                mv_present,
                fixes,
            });
        }

        let orphan_columns = live
            .iter()
            .map(|c| c.name.clone())
            .filter(|name| !accounted.contains(&name.to_ascii_lowercase()))
            .collect();

        Ok(DomainReport {
            domain_id: domain.descriptor.domain_id,
            domain_uri: domain.descriptor.domain_uri.clone(),
            schema,
            table,
            table_exists,
            columns,
            orphan_columns,
        })
    }

    /// Reconcile every provisioned domain and flag storage-schema tables no
    /// descriptor points at.
    pub async fn provisioning_report(
        &self,
        domains: &[(Domain, std::sync::Arc<dyn DomainKind>)],
    ) -> DomainResult<ProvisioningReport> {
        let mut reports = Vec::with_capacity(domains.len());
        let mut claimed_tables: HashSet<(String, String)> = HashSet::new();
        let mut schemas: HashSet<String> = HashSet::new();

        for (domain, kind) in domains {
            if !domain.is_provisioned() {
                continue;
            }
            let report = self.domain_report(domain, kind.as_ref()).await?;
            claimed_tables.insert((report.schema.clone(), report.table.to_ascii_lowercase()));
            schemas.insert(report.schema.clone());
            reports.push(report);
        }

        let mut orphan_tables = Vec::new();
        for schema in &schemas {
            for table in self.tables_in_schema(schema).await? {
                if !claimed_tables.contains(&(schema.clone(), table.to_ascii_lowercase())) {
                    orphan_tables.push(format!("{schema}.{table}"));
                }
            }
        }

        Ok(ProvisioningReport {
            domains: reports,
            orphan_tables,
        })
    }

    /// Bring one domain's live table back in line with its metadata: drop
    /// unaccounted columns first, then add missing ones, then drop the kind's
    /// cached view.
    pub async fn repair_domain(
        &self,
        domain: &Domain,
        kind: &dyn DomainKind,
    ) -> DomainResult<DomainReport> {
        let report = self.domain_report(domain, kind).await?;
        if !report.table_exists {
            return Err(DomainError::TableNotFound(format!(
                "{}.{}",
                report.schema, report.table
            )));
        }
        if report.is_healthy() {
            return Ok(report);
        }

        let mut drops = TableChange::new(ChangeType::DropColumns, &report.schema, &report.table);
        for orphan in &report.orphan_columns {
            warn!(table = %report.table, column = %orphan, "repair: dropping orphan column");
            drops.drop_column_exact_name(orphan);
        }
        for status in &report.columns {
            if !status.mv_expected && status.mv_present {
                drops.drop_column_exact_name(&format!(
                    "{}_{MV_INDICATOR_SUFFIX}",
                    status.expected_column
                ));
            }
        }

        let mut adds = TableChange::new(ChangeType::AddColumns, &report.schema, &report.table);
        for status in &report.columns {
            let Some(property) = domain.property_by_name(&status.property_name) else {
                continue;
            };
            let Some(spec) = property.storage_spec() else {
                continue;
            };
            if !status.present {
                info!(table = %report.table, column = %status.expected_column, "repair: creating column");
                adds.add_column(spec.clone());
            }
            if status.mv_expected && !status.mv_present {
                adds.add_column(spec.mv_column());
            }
        }

        let mut tx = self.pool().begin().await?;
        if !drops.is_empty() {
            self.execute_change(&mut tx, &drops).await?;
        }
        if !adds.is_empty() {
            self.execute_change(&mut tx, &adds).await?;
        }
        tx.commit().await?;
        kind.invalidate(domain);

        self.domain_report(domain, kind).await
    }
}
