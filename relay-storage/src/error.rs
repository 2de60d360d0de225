//! Storage error types

use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure; fatal at startup
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// JSON column (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Entity lookup miss where the caller required presence
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Constraint violation with a readable message
    #[error("Constraint violated: {0}")]
    Constraint(String),
}

impl StorageError {
    /// Create a not-found error
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}
