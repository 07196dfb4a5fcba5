//! Error handling for the domain/provisioning engine
//!
//! This module provides idiomatic Rust error types using thiserror for
//! better error messages and proper error chain handling.

use thiserror::Error;

/// Main error type for domain and provisioning operations
#[derive(Error, Debug)]
pub enum DomainError {
    /// A requested property change failed validation. The save aborts with no
    /// partial state committed and the message names the offending property.
    #[error("Property change rejected for '{property}': {message}")]
    PropertyChangeRejected { property: String, message: String },

    /// The stored descriptor version no longer matches the caller's loaded
    /// snapshot. The caller must reload and retry.
    #[error("Domain '{domain_uri}' was modified by another session; reload and retry")]
    OptimisticConflict { domain_uri: String },

    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    #[error("Domain kind not registered: {0}")]
    KindNotFound(String),

    #[error("No storage table provisioned for domain: {0}")]
    TableNotFound(String),

    #[error("Column '{column}' not found in table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Database error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DomainError {
    /// Shorthand for the field-scoped validation failure used throughout
    /// `DomainService::save`.
    pub fn rejected(property: impl Into<String>, message: impl Into<String>) -> Self {
        DomainError::PropertyChangeRejected {
            property: property.into(),
            message: message.into(),
        }
    }

    /// True for errors the caller can recover from by fixing input or
    /// reloading (validation and concurrency failures).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DomainError::PropertyChangeRejected { .. } | DomainError::OptimisticConflict { .. }
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;
