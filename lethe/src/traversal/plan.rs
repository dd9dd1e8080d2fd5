use crate::core::ActionType;
use crate::graph::{CollectionAddress, FieldAddress, FieldPath};
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An edge along which an upstream collection feeds this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputEdge {
    /// Field of the upstream collection whose values are read
    pub source: FieldAddress,
    /// Field of this collection the values are matched against
    pub target: FieldPath,
}

/// A planned unit of work for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub address: CollectionAddress,
    pub upstream: Vec<CollectionAddress>,
    pub downstream: Vec<CollectionAddress>,
    /// Access only: edges that supply identity inputs from upstream rows.
    pub inbound_edges: Vec<InputEdge>,
    /// Access only: identity fields matched directly by a seed, with the seed name.
    pub seed_fields: Vec<(FieldPath, String)>,
}

/// Ordered task descriptors for one action over the reachable collections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub action: ActionType,
    pub tasks: Vec<TaskDescriptor>,
}

impl ExecutionPlan {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, address: &CollectionAddress) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|task| &task.address == address)
    }

    /// Execution order.
    pub fn order(&self) -> Vec<&CollectionAddress> {
        self.tasks.iter().map(|task| &task.address).collect()
    }

    /// Every collection downstream of `address`, transitively, in plan order.
    pub fn downstream_closure(&self, address: &CollectionAddress) -> Vec<CollectionAddress> {
        let mut closure: Vec<CollectionAddress> = Vec::new();
        let mut frontier = vec![address.clone()];
        while let Some(current) = frontier.pop() {
            if let Some(task) = self.task(&current) {
                for next in &task.downstream {
                    if !closure.contains(next) {
                        closure.push(next.clone());
                        frontier.push(next.clone());
                    }
                }
            }
        }
        closure.sort_by_key(|a| self.tasks.iter().position(|t| &t.address == a));
        closure
    }

    /// Generates a DOT representation of the plan for Graphviz.
    ///
    /// Render with `dot -Tpng plan.dot -o plan.png`.
    pub fn to_dot(&self) -> String {
        let mut graph = DiGraph::<String, ()>::new();
        let mut node_indices = HashMap::new();

        for task in &self.tasks {
            let node_idx = graph.add_node(format!("{} ({})", task.address, self.action));
            node_indices.insert(&task.address, node_idx);
        }

        for task in &self.tasks {
            let target_idx = node_indices[&task.address];
            for upstream in &task.upstream {
                if let Some(&source_idx) = node_indices.get(upstream) {
                    graph.add_edge(source_idx, target_idx, ());
                }
            }
        }

        format!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]))
    }
}
