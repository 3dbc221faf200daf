//! Error types shared across repository implementations.

/// Errors from repository (database) operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}
