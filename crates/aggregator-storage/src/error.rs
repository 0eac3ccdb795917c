//! Storage Error Types
//!
//! This module defines all error types that can occur during storage operations.
//!
//! ## Error Categories
//!
//! ### Lookup Errors
//! - `NotFound`: Requested cluster, org, rule hit or toggle doesn't exist
//!
//! ### Write Errors
//! - `StaleReport`: Candidate report is not newer than the stored one. Expected
//!   under transport redelivery; callers usually just log it and move on.
//! - `ConstraintViolation`: Duplicate key (e.g. the same consumer error twice)
//!
//! ### Configuration Errors
//! - `UnsupportedBackend`: Backend name is neither SQLite nor PostgreSQL (fatal)
//! - `Config`: Configuration file couldn't be read or is incomplete
//! - `Migration`: Embedded schema migrations failed
//!
//! ### Database Errors
//! - `Database`: Any other driver failure (connection, query, decode, ...)
//!
//! ## Usage
//!
//! ```ignore
//! use aggregator_storage::{Storage, StorageError};
//!
//! match storage.write_report(org, &cluster, &report, &rules, checked_at, offset).await {
//!     Ok(()) => {}
//!     Err(StorageError::StaleReport { .. }) => tracing::info!("skipping old report"),
//!     Err(e) => return Err(e),
//! }
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Item with ID {item} was not found in the storage")]
    NotFound { item: String },

    #[error("Report for cluster {cluster} checked at {checked_at} is not newer than stored report from {stored}")]
    StaleReport {
        cluster: String,
        checked_at: DateTime<Utc>,
        stored: DateTime<Utc>,
    },

    #[error("Backend {0} is not supported")]
    UnsupportedBackend(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn not_found(item: impl Into<String>) -> Self {
        StorageError::NotFound { item: item.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, StorageError::StaleReport { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StorageError::ConstraintViolation(db.message().to_string())
            }
            _ => StorageError::Database(e),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StorageError::Migration(e.to_string())
    }
}
