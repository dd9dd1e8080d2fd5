use crate::core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Storage layer error type.
///
/// Wraps backend and serialization errors while preserving the full error
/// chain for debugging.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// A database operation failed.
    #[cfg(feature = "sqlite")]
    #[error("database operation failed")]
    Database(#[from] sqlx::Error),

    /// Failed to open or configure the backend.
    #[error("connection error: {0}")]
    Connection(String),

    /// A core error, such as a rejected status transition.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A stored JSON column could not be encoded or decoded.
    #[error("serialization failed")]
    Serialization(#[from] serde_json::Error),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("privacy request not found: {0}")]
    RequestNotFound(Uuid),

    /// A stored row violates an invariant of the schema.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The request queue has been closed.
    #[error("request queue closed")]
    QueueClosed,
}

pub type Result<T> = std::result::Result<T, StorageError>;
