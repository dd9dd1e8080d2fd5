//! Dependency graph over collections
//!
//! The planner builds one of these per ordering concern: one for access and
//! a separate one from `erase_after` hints for erasure.
//!
//! # Design
//!
//! The graph uses a bidirectional adjacency list representation:
//! - `successors`: collections that run after this one (outgoing edges)
//! - `predecessors`: collections this one runs after (incoming edges)
//!
//! Unlike an incremental DAG, adding an edge never checks for cycles. Cycles
//! are found when the order is computed, so the error can name the whole
//! cycle instead of only the edge that closed it.

use super::address::CollectionAddress;
use super::error::{GraphError, GraphResult};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Default)]
struct DependencyNode {
    predecessors: Vec<CollectionAddress>,
    successors: Vec<CollectionAddress>,
}

/// A directed graph of "runs after" constraints between collections.
///
/// ```
/// use lethe::graph::{CollectionAddress, DependencyGraph};
///
/// let orders = CollectionAddress::new("ds", "orders");
/// let refunds = CollectionAddress::new("ds", "refunds");
///
/// let mut graph = DependencyGraph::new();
/// graph.add_node(orders.clone());
/// graph.add_node(refunds.clone());
/// graph.add_dependency(&refunds, &orders).unwrap();
///
/// assert_eq!(graph.topological_sort().unwrap(), vec![orders, refunds]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<CollectionAddress, DependencyNode>,
    /// Insertion order for deterministic iteration
    insertion_order: Vec<CollectionAddress>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Adds a node. Adding an existing node is a no-op.
    pub fn add_node(&mut self, address: CollectionAddress) {
        if self.nodes.contains_key(&address) {
            return;
        }
        self.insertion_order.push(address.clone());
        self.nodes.insert(address, DependencyNode::default());
    }

    pub fn contains(&self, address: &CollectionAddress) -> bool {
        self.nodes.contains_key(address)
    }

    /// Records that `node` runs after `dependency`. Idempotent.
    pub fn add_dependency(
        &mut self,
        node: &CollectionAddress,
        dependency: &CollectionAddress,
    ) -> GraphResult<()> {
        if node == dependency {
            return Err(GraphError::SelfDependency {
                collection: node.clone(),
            });
        }
        if !self.nodes.contains_key(dependency) {
            return Err(GraphError::dangling_dependency(node.clone(), dependency.clone()));
        }
        let Some(entry) = self.nodes.get_mut(node) else {
            return Err(GraphError::dangling_dependency(dependency.clone(), node.clone()));
        };
        if entry.predecessors.contains(dependency) {
            return Ok(());
        }
        entry.predecessors.push(dependency.clone());

        if let Some(entry) = self.nodes.get_mut(dependency) {
            entry.successors.push(node.clone());
        }
        Ok(())
    }

    /// Collections that `address` runs after, in insertion order.
    pub fn predecessors(&self, address: &CollectionAddress) -> Vec<CollectionAddress> {
        self.sorted(self.nodes.get(address).map(|n| n.predecessors.as_slice()))
    }

    /// Collections that run after `address`, in insertion order.
    pub fn successors(&self, address: &CollectionAddress) -> Vec<CollectionAddress> {
        self.sorted(self.nodes.get(address).map(|n| n.successors.as_slice()))
    }

    fn sorted(&self, addresses: Option<&[CollectionAddress]>) -> Vec<CollectionAddress> {
        let mut addresses = addresses.map(<[_]>::to_vec).unwrap_or_default();
        addresses.sort_by_key(|a| self.order_of(a));
        addresses
    }

    fn order_of(&self, address: &CollectionAddress) -> usize {
        self.insertion_order
            .iter()
            .position(|x| x == address)
            .unwrap_or(usize::MAX)
    }

    /// Returns a valid execution order.
    ///
    /// Uses Kahn's algorithm; among nodes whose dependencies are all met, the
    /// earliest inserted goes first.
    ///
    /// Fails with [`GraphError::Cycle`] naming the full cycle, starting and
    /// ending at the earliest inserted node on it.
    pub fn topological_sort(&self) -> GraphResult<Vec<CollectionAddress>> {
        let mut in_degrees: HashMap<&CollectionAddress, usize> = self
            .nodes
            .iter()
            .map(|(id, node)| (id, node.predecessors.len()))
            .collect();

        let mut ready: Vec<&CollectionAddress> = self
            .insertion_order
            .iter()
            .filter(|id| in_degrees.get(id) == Some(&0))
            .collect();
        let mut result = Vec::with_capacity(self.nodes.len());

        // `ready` is kept sorted by insertion order so ties resolve by
        // declaration rather than by discovery.
        while !ready.is_empty() {
            let node = ready.remove(0);
            result.push(node.clone());

            for successor in &self.nodes[node].successors {
                if let Some(degree) = in_degrees.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        let position = self.order_of(successor);
                        let at = ready
                            .iter()
                            .position(|r| self.order_of(r) > position)
                            .unwrap_or(ready.len());
                        ready.insert(at, successor);
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            let path = self
                .find_cycle()
                .unwrap_or_else(|| self.insertion_order.clone());
            return Err(GraphError::cycle(path));
        }

        Ok(result)
    }

    /// Finds a cycle using DFS with three-color marking:
    /// - White (not visited): not in any set
    /// - Gray (visiting): on `stack`
    /// - Black (visited): in `visited` but not on `stack`
    ///
    /// The returned path repeats its first node at the end.
    pub fn find_cycle(&self) -> Option<Vec<CollectionAddress>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for id in &self.insertion_order {
            if !visited.contains(id) {
                if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut stack) {
                    return Some(self.rotate(cycle));
                }
            }
        }
        None
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a CollectionAddress,
        visited: &mut HashSet<&'a CollectionAddress>,
        stack: &mut Vec<&'a CollectionAddress>,
    ) -> Option<Vec<CollectionAddress>> {
        visited.insert(node);
        stack.push(node);

        for successor in self.successors_ref(node) {
            if let Some(start) = stack.iter().position(|s| *s == successor) {
                // Back edge: the stack from `start` is the cycle
                return Some(stack[start..].iter().map(|s| (*s).clone()).collect());
            }
            if !visited.contains(successor) {
                if let Some(cycle) = self.dfs_cycle(successor, visited, stack) {
                    return Some(cycle);
                }
            }
        }

        stack.pop();
        None
    }

    fn successors_ref(&self, node: &CollectionAddress) -> Vec<&CollectionAddress> {
        let mut successors: Vec<&CollectionAddress> = self
            .nodes
            .get(node)
            .map(|n| n.successors.iter().collect())
            .unwrap_or_default();
        successors.sort_by_key(|s| self.order_of(s));
        successors
    }

    /// Rotates a cycle to start at its earliest inserted node and closes it.
    fn rotate(&self, mut cycle: Vec<CollectionAddress>) -> Vec<CollectionAddress> {
        if let Some(start) = (0..cycle.len()).min_by_key(|&i| self.order_of(&cycle[i])) {
            cycle.rotate_left(start);
        }
        if let Some(first) = cycle.first().cloned() {
            cycle.push(first);
        }
        cycle
    }
}
