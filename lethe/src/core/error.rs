use super::task::TaskStatus;
use thiserror::Error;

/// Core error type for the lethe execution core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// An unknown task status string was encountered during parsing.
    #[error("invalid task status: {0}")]
    InvalidStatus(String),

    /// An unknown action type string was encountered during parsing.
    #[error("invalid action type: {0}")]
    InvalidAction(String),

    /// An unknown privacy request status string was encountered during parsing.
    #[error("invalid request status: {0}")]
    InvalidRequestStatus(String),

    /// A task status change that the state machine does not allow.
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

pub type Result<T> = std::result::Result<T, CoreError>;
