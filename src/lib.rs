//! labplate: dynamic domains and plate-based assay data over Postgres
//!
//! Two halves share one metadata schema:
//!
//! - `properties` + `provisioner`: user-defined typed property collections
//!   (domains) whose definitions live in metadata tables and whose data lives
//!   in provisioned physical tables, evolved by transactional saves.
//! - `plate`: plates, templates, well groups and replicate statistics, with
//!   plate metadata fields stored as a dynamic domain.
//!
//! Services are constructed with an explicit `PgPool` plus injected caches
//! and registries; nothing is process-global.

pub mod cache;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod plate;
pub mod properties;
pub mod provisioner;

pub use cache::{ContainerCache, DomainCache};
pub use database::{DatabaseConfig, DatabaseManager};
pub use error::{DomainError, DomainResult};
pub use plate::{Plate, PlateManager, Position, SummaryStats, WellGroup};
pub use properties::{
    Domain, DomainKind, DomainKindRegistry, DomainService, PropertyChange, PropertyDraft,
    PropertyType, SaveOptions,
};
pub use provisioner::StorageProvisioner;
