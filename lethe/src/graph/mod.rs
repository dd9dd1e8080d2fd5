//! Dataset graph model and builder
//!
//! - [`address`]: collection and field addresses
//! - [`model`]: datasets, collections, fields and nodes
//! - [`edge`]: directed and bidirectional edges between fields
//! - [`definition`]: the serde schema datasets are loaded from
//! - [`DatasetGraph`]: the validated graph, built once per planning cycle
//! - [`DependencyGraph`]: "runs after" constraints with Kahn ordering and
//!   cycle reporting

pub mod address;
mod dataset_graph;
pub mod definition;
mod dependency;
pub mod edge;
mod error;
pub mod model;

pub use address::{CollectionAddress, FieldAddress, FieldPath};
pub use dataset_graph::DatasetGraph;
pub use definition::{CollectionDefinition, DatasetDefinition, FieldDefinition, ReferenceDefinition};
pub use dependency::DependencyGraph;
pub use edge::Edge;
pub use error::{format_path, GraphError, GraphResult};
pub use model::{Collection, Field, FieldReference, GraphDataset, Node, ReferenceDirection};
