//! Row structs shared by the domain and plate services
//!
//! These mirror the metadata tables one-to-one and derive `sqlx::FromRow`
//! so services can use runtime-checked `query_as` calls.

pub mod domain_models;
pub mod plate_models;

pub use domain_models::{
    ConditionalFormatRow, DomainAuditRow, DomainDescriptorRow, NewDomainAuditEvent,
    PropertyDescriptorRow, PropertyValidatorRow,
};
pub use plate_models::{PlateRow, PlateTypeRow, WellGroupRow, WellRow};
