//! Error types for agentgate-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`JobStore`](crate::JobStore) and
/// [`AuditStore`](crate::AuditStore) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No job with this id exists.
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: String },

    /// A job with this id was already inserted.
    #[error("job already exists: {job_id}")]
    DuplicateJob { job_id: String },

    /// Audit append did not extend the chain by exactly one.
    #[error("audit sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    /// A stored digest was not 64 hex characters.
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Row could not be converted to or from its stored shape.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure (connection dropped, query rejected, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for failures that may succeed if retried against the same backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}
