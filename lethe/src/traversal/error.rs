use crate::graph::{format_path, CollectionAddress, GraphError};
use thiserror::Error;

/// Planning failures. Raised before any task exists and never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraversalError {
    /// No collection has an identity field matching the request's seeds
    #[error("no collection can be reached from identities {seeds:?}")]
    NoStartingNodes { seeds: Vec<String> },

    /// The access dependency graph is cyclic
    #[error("access traversal contains a cycle: {}", format_path(.path))]
    AccessCycle { path: Vec<CollectionAddress> },

    /// The `erase_after` graph is cyclic
    #[error("erase_after dependencies contain a cycle: {}", format_path(.path))]
    ErasureCycle { path: Vec<CollectionAddress> },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
