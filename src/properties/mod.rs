//! Dynamic domain/property system
//!
//! User-defined, typed property collections (domains) whose definitions live
//! in metadata tables and whose data lives in provisioned physical tables.
//! `DomainService` is the entry point; everything else supports it.

pub mod audit;
pub mod change;
pub mod descriptor;
pub mod domain;
pub mod kind;
pub mod manager;
pub mod types;

pub use audit::DomainAuditService;
pub use change::{PropertyChange, PropertyDelta, PropertyDraft};
pub use descriptor::{Domain, DomainDescriptor, Lookup, PropertyDescriptor};
pub use domain::{DomainService, SaveOptions, SaveOutcome};
pub use kind::{DomainKind, DomainKindRegistry};
pub use manager::{ConditionalFormatDraft, DomainPropertyManager, ValidatorDraft};
pub use types::{PropertyStorageSpec, PropertyType, TableIndex};
