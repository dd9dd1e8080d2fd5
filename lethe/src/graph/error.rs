//! Error types for building dataset graphs
//!
//! Every variant is a validation failure: it is raised while a graph is
//! built and is never retried.

use super::address::{CollectionAddress, FieldAddress};
use thiserror::Error;

/// Result type for graph operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Errors that can occur while building a dataset graph
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// A reference points at a collection that is not part of the graph
    #[error(
        "field {field} references {target}, but collection {} does not exist",
        .target.collection_address()
    )]
    DanglingReference {
        field: FieldAddress,
        target: FieldAddress,
    },

    /// A reference points at a field that its collection does not declare
    #[error(
        "field {field} references {target}, which is not a field of {}",
        .target.collection_address()
    )]
    UnknownField {
        field: FieldAddress,
        target: FieldAddress,
    },

    /// Both ends of an edge belong to the same collection
    #[error("edge {from} -> {to} references its own collection")]
    SelfReference { from: FieldAddress, to: FieldAddress },

    /// An `after` or `erase_after` entry names a missing collection
    #[error("collection {collection} depends on {target}, which does not exist")]
    DanglingDependency {
        collection: CollectionAddress,
        target: CollectionAddress,
    },

    /// A collection lists itself in `after` or `erase_after`
    #[error("collection {collection} cannot depend on itself")]
    SelfDependency { collection: CollectionAddress },

    /// A dataset-level `after` entry names a missing dataset
    #[error("dataset '{dataset}' runs after unknown dataset '{target}'")]
    UnknownDataset { dataset: String, target: String },

    /// Two collections share an address
    #[error("duplicate collection {address}")]
    DuplicateCollection { address: CollectionAddress },

    /// An address string could not be parsed
    #[error("invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// The dependency graph contains a cycle
    #[error("cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<CollectionAddress> },
}

impl GraphError {
    pub fn dangling_reference(field: FieldAddress, target: FieldAddress) -> Self {
        Self::DanglingReference { field, target }
    }

    pub fn unknown_field(field: FieldAddress, target: FieldAddress) -> Self {
        Self::UnknownField { field, target }
    }

    pub fn self_reference(from: FieldAddress, to: FieldAddress) -> Self {
        Self::SelfReference { from, to }
    }

    pub fn dangling_dependency(collection: CollectionAddress, target: CollectionAddress) -> Self {
        Self::DanglingDependency { collection, target }
    }

    pub fn invalid_address(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn cycle(path: Vec<CollectionAddress>) -> Self {
        Self::Cycle { path }
    }
}

/// Renders a cycle as `[ds:a, ds:b, ds:a]`.
pub fn format_path(path: &[CollectionAddress]) -> String {
    let parts: Vec<String> = path.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}
