//! Operational entry point: apply migrations, check connectivity, and run
//! the provisioning reconciliation report.
//!
//! Usage: labplate_admin [migrate|status|report]

use anyhow::{bail, Context, Result};
use labplate::database::DatabaseManager;
use labplate::plate::manager::PlateMetadataKind;
use labplate::properties::kind::DomainKindRegistry;
use labplate::provisioner::StorageProvisioner;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    labplate::logging::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "status".to_string());
    let db = DatabaseManager::with_default_config()
        .await
        .context("connecting to database")?;

    match command.as_str() {
        "migrate" => {
            db.run_migrations().await.context("applying migrations")?;
            println!("migrations applied");
        }
        "status" => {
            db.health_check().await.context("database health check")?;
            let domains: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM labplate.domain_descriptor")
                    .fetch_one(db.pool())
                    .await?;
            let plates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM labplate.plate")
                .fetch_one(db.pool())
                .await?;
            println!("ok: {domains} domain(s), {plates} plate(s)");
        }
        "report" => {
            let mut registry = DomainKindRegistry::new();
            registry.register(Arc::new(PlateMetadataKind));
            let provisioner = StorageProvisioner::new(db.pool().clone());

            let domain_ids: Vec<i32> =
                sqlx::query_scalar("SELECT domain_id FROM labplate.domain_descriptor ORDER BY domain_id")
                    .fetch_all(db.pool())
                    .await?;

            let mut domains = Vec::new();
            for domain_id in domain_ids {
                let descriptor = sqlx::query_as::<_, labplate::models::DomainDescriptorRow>(
                    "SELECT domain_id, domain_uri, name, container, kind, storage_schema_name,
                            storage_table_name, modified
                     FROM labplate.domain_descriptor WHERE domain_id = $1",
                )
                .bind(domain_id)
                .fetch_one(db.pool())
                .await?;
                let Some(kind) = registry.get(&descriptor.kind) else {
                    info!(domain = %descriptor.domain_uri, kind = %descriptor.kind,
                          "skipping domain with unregistered kind");
                    continue;
                };
                let properties = sqlx::query_as::<_, labplate::models::PropertyDescriptorRow>(
                    "SELECT property_id, domain_id, property_uri, name, range_type, scale,
                            required, mv_enabled, storage_column_name, sort_order, description,
                            format, url, default_value, lookup_schema, lookup_query
                     FROM labplate.property_descriptor WHERE domain_id = $1
                     ORDER BY sort_order, property_id",
                )
                .bind(domain_id)
                .fetch_all(db.pool())
                .await?;
                let domain = labplate::properties::Domain {
                    descriptor: descriptor.into(),
                    properties: properties
                        .into_iter()
                        .filter_map(labplate::properties::PropertyDescriptor::from_row)
                        .collect(),
                };
                domains.push((domain, kind));
            }

            let report = provisioner.provisioning_report(&domains).await?;
            for domain in &report.domains {
                let state = if domain.is_healthy() { "ok" } else { "DRIFTED" };
                println!("{} {}.{} [{state}]", domain.domain_uri, domain.schema, domain.table);
                for column in &domain.columns {
                    for fix in &column.fixes {
                        println!("    {fix}");
                    }
                }
                for orphan in &domain.orphan_columns {
                    println!("    Orphan column '{orphan}'");
                }
            }
            for table in &report.orphan_tables {
                println!("orphan table {table}");
            }
            if report.is_healthy() {
                println!("all provisioned tables match their metadata");
            }
        }
        other => bail!("unknown command: {other} (expected migrate, status or report)"),
    }

    Ok(())
}
