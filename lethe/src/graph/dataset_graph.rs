//! The validated graph of collections and the edges between them.
//!
//! # Design
//!
//! Nodes live in an arena (`Vec<Node>`) in declaration order and are found
//! through an index keyed by [`CollectionAddress`]. Edges refer to nodes only
//! by address, so the graph holds no internal references and can be cloned,
//! compared and serialized freely.
//!
//! Building never touches the caller's datasets. Each call produces a fresh
//! value, and building the same input twice produces equal graphs.

use super::address::{CollectionAddress, FieldAddress};
use super::edge::Edge;
use super::error::{GraphError, GraphResult};
use super::model::{GraphDataset, Node, ReferenceDirection};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetGraph {
    /// Declaration order
    nodes: Vec<Node>,
    index: HashMap<CollectionAddress, usize>,
    edges: BTreeSet<Edge>,
    /// Identity-labelled field -> seed name
    identity_seeds: BTreeMap<FieldAddress, String>,
    connection_keys: BTreeMap<String, String>,
    dataset_after: BTreeMap<String, BTreeSet<String>>,
}

impl DatasetGraph {
    /// Builds and validates a graph from one or more datasets.
    ///
    /// Fails if a reference or dependency points at something that does not
    /// exist, if an edge would connect a collection to itself, or if two
    /// collections share an address.
    pub fn build(datasets: &[GraphDataset]) -> GraphResult<Self> {
        let mut nodes = Vec::new();
        let mut index = HashMap::new();
        let mut connection_keys = BTreeMap::new();
        let mut dataset_after = BTreeMap::new();

        for dataset in datasets {
            connection_keys.insert(dataset.name.clone(), dataset.connection_key.clone());
            dataset_after.insert(dataset.name.clone(), dataset.after.clone());

            for collection in &dataset.collections {
                let address = dataset.address(&collection.name);
                if index.contains_key(&address) {
                    return Err(GraphError::DuplicateCollection { address });
                }
                index.insert(address.clone(), nodes.len());
                nodes.push(Node::new(address, collection.clone()));
            }
        }

        for (dataset, after) in &dataset_after {
            if let Some(target) = after.iter().find(|t| !connection_keys.contains_key(*t)) {
                return Err(GraphError::UnknownDataset {
                    dataset: dataset.clone(),
                    target: target.clone(),
                });
            }
        }

        let mut graph = Self {
            nodes,
            index,
            edges: BTreeSet::new(),
            identity_seeds: BTreeMap::new(),
            connection_keys,
            dataset_after,
        };
        graph.validate_dependencies()?;
        graph.resolve_references()?;

        debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            seeds = graph.identity_seeds.len(),
            "built dataset graph"
        );
        Ok(graph)
    }

    fn validate_dependencies(&self) -> GraphResult<()> {
        for node in &self.nodes {
            let collection = node.collection();
            for target in collection.after.iter().chain(&collection.erase_after) {
                if target == node.address() {
                    return Err(GraphError::SelfDependency {
                        collection: node.address().clone(),
                    });
                }
                if !self.index.contains_key(target) {
                    return Err(GraphError::dangling_dependency(
                        node.address().clone(),
                        target.clone(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn resolve_references(&mut self) -> GraphResult<()> {
        let mut edges = BTreeSet::new();
        let mut identity_seeds = BTreeMap::new();

        for node in &self.nodes {
            for (path, field) in node.collection().all_fields() {
                let address = node.address().field(path);

                if let Some(label) = &field.identity {
                    identity_seeds.insert(address.clone(), label.clone());
                }

                for reference in &field.references {
                    let target = &reference.target;
                    let Some(target_node) = self.node(target.collection_address()) else {
                        return Err(GraphError::dangling_reference(address, target.clone()));
                    };

                    let edge = match reference.direction {
                        ReferenceDirection::From => Edge::directed(target.clone(), address.clone()),
                        ReferenceDirection::To => Edge::directed(address.clone(), target.clone()),
                        ReferenceDirection::Unspecified => {
                            Edge::bidirectional(address.clone(), target.clone())
                        }
                    }?;

                    if target_node.collection().field(target.path()).is_none() {
                        return Err(GraphError::unknown_field(address, target.clone()));
                    }
                    edges.insert(edge);
                }
            }
        }

        self.edges = edges;
        self.identity_seeds = identity_seeds;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, address: &CollectionAddress) -> Option<&Node> {
        self.index.get(address).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, address: &CollectionAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Declaration index of a collection, used to break ordering ties.
    pub fn position(&self, address: &CollectionAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn identity_seeds(&self) -> &BTreeMap<FieldAddress, String> {
        &self.identity_seeds
    }

    pub fn connection_key(&self, dataset: &str) -> Option<&str> {
        self.connection_keys.get(dataset).map(String::as_str)
    }

    /// Datasets that `dataset` runs after.
    pub fn dataset_after(&self, dataset: &str) -> impl Iterator<Item = &String> {
        self.dataset_after.get(dataset).into_iter().flatten()
    }
}
