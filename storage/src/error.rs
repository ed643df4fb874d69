//! Storage error types.
//!
//! Used by store implementations and callers of storage APIs.

use relay_core::RelayError;
use thiserror::Error;

/// Errors that can occur when using storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

impl From<StorageError> for RelayError {
    fn from(e: StorageError) -> Self {
        RelayError::Storage(e.to_string())
    }
}
