use crate::connector::{ConnectorError, RegistryError};
use crate::core::{ActionType, TaskStatus};
use crate::graph::{CollectionAddress, GraphError};
use crate::storage::StorageError;
use crate::traversal::TraversalError;
use thiserror::Error;
use uuid::Uuid;

/// Execution layer error type.
///
/// Build and plan errors surface here before any task row is written.
/// Failures of a single connector call are not errors of this type: they are
/// recorded on the task and propagated to its downstream closure.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Traversal(#[from] TraversalError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("privacy request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A task changed underneath its owner, which should never happen while
    /// the owner holds the claim.
    #[error("task {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("no connector for connection '{connection_key}' of dataset '{dataset}'")]
    NoConnector {
        dataset: String,
        connection_key: String,
    },

    #[error("collection {0} is not part of the dataset graph")]
    UnknownCollection(CollectionAddress),

    /// An async completion carried data for the wrong kind of task.
    #[error("completion payload does not match {action} task {task_id}")]
    InvalidPayload { task_id: Uuid, action: ActionType },

    /// A spawned task execution panicked.
    #[error("task panicked: {0}")]
    TaskPanic(String),
}

pub type Result<T> = std::result::Result<T, ExecutionError>;
