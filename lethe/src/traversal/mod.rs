//! Traversal planning
//!
//! Turns a [`DatasetGraph`] and a request's identity seeds into an
//! [`ExecutionPlan`] for access or erasure.
//!
//! # Reachability
//!
//! Traversal starts at every collection with an identity field whose label
//! is one of the seeds. From there it walks edges breadth first: directed
//! edges only forward, bidirectional edges either way. Collections never
//! reached are left out of the plan.
//!
//! # Ordering
//!
//! Access order comes from edge direction (a bidirectional edge points from
//! the collection discovered first to the one discovered later) plus
//! collection and dataset `after` hints. Erasure order comes only from
//! `erase_after` hints. The two are independent: either can be cyclic while
//! the other is not, and each reports its own cycle.

mod error;
mod plan;

pub use error::TraversalError;
pub use plan::{ExecutionPlan, InputEdge, TaskDescriptor};

use crate::core::ActionType;
use crate::graph::{
    CollectionAddress, DatasetGraph, DependencyGraph, Edge, FieldAddress, GraphError,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

/// Reachability of a graph from a set of identity seeds.
#[derive(Debug)]
pub struct Traversal<'g> {
    graph: &'g DatasetGraph,
    seeds: Vec<String>,
    /// Reachable collections in discovery order
    discovered: Vec<CollectionAddress>,
    discovery_index: HashMap<CollectionAddress, usize>,
}

impl<'g> Traversal<'g> {
    /// Computes the collections reachable from `seeds`.
    pub fn new(
        graph: &'g DatasetGraph,
        seeds: &BTreeMap<String, Value>,
    ) -> Result<Self, TraversalError> {
        let seed_names: Vec<String> = seeds.keys().cloned().collect();

        let starts: Vec<CollectionAddress> = graph
            .nodes()
            .iter()
            .filter(|node| {
                node.collection()
                    .identities()
                    .iter()
                    .any(|(_, label)| seeds.contains_key(*label))
            })
            .map(|node| node.address().clone())
            .collect();

        if starts.is_empty() {
            return Err(TraversalError::NoStartingNodes { seeds: seed_names });
        }

        let mut discovered = Vec::new();
        let mut discovery_index = HashMap::new();
        let mut queue = VecDeque::new();

        for start in starts {
            discovery_index.insert(start.clone(), discovered.len());
            discovered.push(start.clone());
            queue.push_back(start);
        }

        while let Some(current) = queue.pop_front() {
            for edge in graph.edges() {
                let Some((_, remote)) = edge.outbound_from(&current) else {
                    continue;
                };
                let next = remote.collection_address();
                if !discovery_index.contains_key(next) {
                    discovery_index.insert(next.clone(), discovered.len());
                    discovered.push(next.clone());
                    queue.push_back(next.clone());
                }
            }
        }

        let unreachable: Vec<String> = graph
            .nodes()
            .iter()
            .filter(|node| !discovery_index.contains_key(node.address()))
            .map(|node| node.address().to_string())
            .collect();
        if !unreachable.is_empty() {
            debug!(?unreachable, "collections not reachable from identity seeds");
        }

        Ok(Self {
            graph,
            seeds: seed_names,
            discovered,
            discovery_index,
        })
    }

    /// Plans `action` for `graph` seeded by `seeds`.
    pub fn plan(
        graph: &'g DatasetGraph,
        seeds: &BTreeMap<String, Value>,
        action: ActionType,
    ) -> Result<ExecutionPlan, TraversalError> {
        let traversal = Self::new(graph, seeds)?;
        match action {
            ActionType::Access => traversal.access_plan(),
            ActionType::Erasure => traversal.erasure_plan(),
        }
    }

    pub fn plan_access(
        graph: &'g DatasetGraph,
        seeds: &BTreeMap<String, Value>,
    ) -> Result<ExecutionPlan, TraversalError> {
        Self::plan(graph, seeds, ActionType::Access)
    }

    pub fn plan_erasure(
        graph: &'g DatasetGraph,
        seeds: &BTreeMap<String, Value>,
    ) -> Result<ExecutionPlan, TraversalError> {
        Self::plan(graph, seeds, ActionType::Erasure)
    }

    /// Reachable collections in discovery order.
    pub fn reachable(&self) -> &[CollectionAddress] {
        &self.discovered
    }

    pub fn is_reachable(&self, address: &CollectionAddress) -> bool {
        self.discovery_index.contains_key(address)
    }

    /// Reachable collections in declaration order.
    fn reachable_in_declaration_order(&self) -> Vec<CollectionAddress> {
        self.graph
            .nodes()
            .iter()
            .map(|node| node.address())
            .filter(|address| self.is_reachable(address))
            .cloned()
            .collect()
    }

    fn empty_dependency_graph(&self) -> DependencyGraph {
        let mut dependencies = DependencyGraph::new();
        for address in self.reachable_in_declaration_order() {
            dependencies.add_node(address);
        }
        dependencies
    }

    /// Orients an edge between reachable collections: `(upstream field, downstream field)`.
    fn orient<'e>(&self, edge: &'e Edge) -> Option<(&'e FieldAddress, &'e FieldAddress)> {
        let (first, second) = edge.ends();
        let first_index = self.discovery_index.get(first.collection_address())?;
        let second_index = self.discovery_index.get(second.collection_address())?;

        match edge {
            Edge::Directed { .. } => Some((first, second)),
            Edge::Bidirectional { .. } if first_index <= second_index => Some((first, second)),
            Edge::Bidirectional { .. } => Some((second, first)),
        }
    }

    /// Builds the access plan.
    pub fn access_plan(&self) -> Result<ExecutionPlan, TraversalError> {
        let mut dependencies = self.empty_dependency_graph();
        let mut inbound: HashMap<CollectionAddress, Vec<InputEdge>> = HashMap::new();

        for edge in self.graph.edges() {
            let Some((source, target)) = self.orient(edge) else {
                continue;
            };
            dependencies.add_dependency(target.collection_address(), source.collection_address())?;
            inbound
                .entry(target.collection_address().clone())
                .or_default()
                .push(InputEdge {
                    source: source.clone(),
                    target: target.path().clone(),
                });
        }

        for address in self.reachable_in_declaration_order() {
            let Some(node) = self.graph.node(&address) else {
                continue;
            };

            for target in &node.collection().after {
                if self.is_reachable(target) {
                    dependencies.add_dependency(&address, target)?;
                }
            }

            for dataset in self.graph.dataset_after(node.dataset()) {
                if dataset == node.dataset() {
                    continue;
                }
                for other in &self.discovered {
                    if other.dataset() == dataset {
                        dependencies.add_dependency(&address, other)?;
                    }
                }
            }
        }

        let order = dependencies.topological_sort().map_err(|err| match err {
            GraphError::Cycle { path } => TraversalError::AccessCycle { path },
            other => TraversalError::Graph(other),
        })?;

        let tasks = order
            .into_iter()
            .map(|address| {
                let seed_fields = self
                    .graph
                    .node(&address)
                    .map(|node| {
                        node.collection()
                            .identities()
                            .into_iter()
                            .filter(|(_, label)| self.seeds.iter().any(|s| s.as_str() == *label))
                            .map(|(path, label)| (path, label.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();

                TaskDescriptor {
                    upstream: dependencies.predecessors(&address),
                    downstream: dependencies.successors(&address),
                    inbound_edges: inbound.remove(&address).unwrap_or_default(),
                    seed_fields,
                    address,
                }
            })
            .collect::<Vec<_>>();

        info!(
            collections = tasks.len(),
            seeds = ?self.seeds,
            "planned access traversal"
        );

        Ok(ExecutionPlan {
            action: ActionType::Access,
            tasks,
        })
    }

    /// Builds the erasure plan from `erase_after` hints alone.
    pub fn erasure_plan(&self) -> Result<ExecutionPlan, TraversalError> {
        let mut dependencies = self.empty_dependency_graph();

        for address in self.reachable_in_declaration_order() {
            let Some(node) = self.graph.node(&address) else {
                continue;
            };
            for target in &node.collection().erase_after {
                if self.is_reachable(target) {
                    dependencies.add_dependency(&address, target)?;
                }
            }
        }

        let order = dependencies.topological_sort().map_err(|err| match err {
            GraphError::Cycle { path } => TraversalError::ErasureCycle { path },
            other => TraversalError::Graph(other),
        })?;

        let tasks = order
            .into_iter()
            .map(|address| TaskDescriptor {
                upstream: dependencies.predecessors(&address),
                downstream: dependencies.successors(&address),
                inbound_edges: Vec::new(),
                seed_fields: Vec::new(),
                address,
            })
            .collect::<Vec<_>>();

        info!(collections = tasks.len(), "planned erasure traversal");

        Ok(ExecutionPlan {
            action: ActionType::Erasure,
            tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Collection, Field, GraphDataset, ReferenceDirection};
    use serde_json::json;

    fn addr(name: &str) -> CollectionAddress {
        CollectionAddress::new("ds", name)
    }

    fn field(s: &str) -> FieldAddress {
        FieldAddress::parse(s).unwrap()
    }

    fn email_seed() -> BTreeMap<String, Value> {
        BTreeMap::from([("email".to_string(), json!("jane@example.com"))])
    }

    /// orders -> refunds -> labels along access edges, erase_after reversed.
    fn shop() -> DatasetGraph {
        let dataset = GraphDataset::new("ds", "db")
            .with_collection(
                Collection::new("orders")
                    .with_field(Field::new("id"))
                    .with_field(Field::new("email").with_identity("email"))
                    .with_erase_after(addr("refunds")),
            )
            .with_collection(
                Collection::new("refunds")
                    .with_field(Field::new("id"))
                    .with_field(
                        Field::new("order_id")
                            .with_reference(field("ds.orders.id"), ReferenceDirection::From),
                    )
                    .with_erase_after(addr("labels")),
            )
            .with_collection(
                Collection::new("labels").with_field(
                    Field::new("refund_id")
                        .with_reference(field("ds.refunds.id"), ReferenceDirection::From),
                ),
            )
            .with_collection(
                Collection::new("audit").with_field(Field::new("id")),
            );
        DatasetGraph::build(&[dataset]).unwrap()
    }

    #[test]
    fn test_no_starting_nodes() {
        let graph = shop();
        let seeds = BTreeMap::from([("phone".to_string(), json!("555"))]);
        assert!(matches!(
            Traversal::new(&graph, &seeds),
            Err(TraversalError::NoStartingNodes { .. })
        ));
    }

    #[test]
    fn test_unreachable_collections_excluded() {
        let graph = shop();
        let traversal = Traversal::new(&graph, &email_seed()).unwrap();
        assert_eq!(
            traversal.reachable(),
            &[addr("orders"), addr("refunds"), addr("labels")]
        );
        assert!(!traversal.is_reachable(&addr("audit")));
    }

    #[test]
    fn test_access_and_erasure_orders_differ() {
        let graph = shop();
        let access = Traversal::plan_access(&graph, &email_seed()).unwrap();
        let erasure = Traversal::plan_erasure(&graph, &email_seed()).unwrap();

        assert_eq!(
            access.order(),
            vec![&addr("orders"), &addr("refunds"), &addr("labels")]
        );
        assert_eq!(
            erasure.order(),
            vec![&addr("labels"), &addr("refunds"), &addr("orders")]
        );

        let refunds = access.task(&addr("refunds")).unwrap();
        assert_eq!(refunds.upstream, vec![addr("orders")]);
        assert_eq!(refunds.downstream, vec![addr("labels")]);
        assert_eq!(refunds.inbound_edges.len(), 1);
        assert_eq!(refunds.inbound_edges[0].source, field("ds.orders.id"));

        let orders = access.task(&addr("orders")).unwrap();
        assert_eq!(orders.seed_fields.len(), 1);
        assert_eq!(orders.seed_fields[0].1, "email");
    }

    #[test]
    fn test_erase_after_cycle_lists_path() {
        let dataset = GraphDataset::new("ds", "db")
            .with_collection(
                Collection::new("labels")
                    .with_field(Field::new("email").with_identity("email"))
                    .with_erase_after(addr("orders")),
            )
            .with_collection(
                Collection::new("orders")
                    .with_field(Field::new("email").with_identity("email"))
                    .with_erase_after(addr("labels")),
            );
        let graph = DatasetGraph::build(&[dataset]).unwrap();

        // Access ordering is unaffected by erase_after.
        assert!(Traversal::plan_access(&graph, &email_seed()).is_ok());

        let err = Traversal::plan_erasure(&graph, &email_seed()).unwrap_err();
        assert!(matches!(err, TraversalError::ErasureCycle { .. }));
        assert!(err
            .to_string()
            .contains("[ds:labels, ds:orders, ds:labels]"));
    }

    #[test]
    fn test_directed_edges_not_followed_backwards() {
        // customer is only reachable by walking orders -> customer backwards.
        let dataset = GraphDataset::new("ds", "db")
            .with_collection(Collection::new("customer").with_field(Field::new("id")))
            .with_collection(
                Collection::new("orders")
                    .with_field(Field::new("email").with_identity("email"))
                    .with_field(
                        Field::new("customer_id")
                            .with_reference(field("ds.customer.id"), ReferenceDirection::From),
                    ),
            );
        let graph = DatasetGraph::build(&[dataset]).unwrap();
        let plan = Traversal::plan_access(&graph, &email_seed()).unwrap();
        assert_eq!(plan.order(), vec![&addr("orders")]);
    }

    #[test]
    fn test_bidirectional_edge_oriented_by_discovery() {
        let dataset = GraphDataset::new("ds", "db")
            .with_collection(
                Collection::new("profile").with_field(
                    Field::new("user_id")
                        .with_reference(field("ds.users.id"), ReferenceDirection::Unspecified),
                ),
            )
            .with_collection(
                Collection::new("users")
                    .with_field(Field::new("id"))
                    .with_field(Field::new("email").with_identity("email")),
            );
        let graph = DatasetGraph::build(&[dataset]).unwrap();
        let plan = Traversal::plan_access(&graph, &email_seed()).unwrap();

        assert_eq!(plan.order(), vec![&addr("users"), &addr("profile")]);
        let profile = plan.task(&addr("profile")).unwrap();
        assert_eq!(profile.inbound_edges[0].source, field("ds.users.id"));
        assert_eq!(profile.inbound_edges[0].target.to_string(), "user_id");
    }

    #[test]
    fn test_after_hints_and_dataset_after() {
        let billing = GraphDataset::new("billing", "billing_db").with_collection(
            Collection::new("invoices").with_field(Field::new("email").with_identity("email")),
        );
        let shop = GraphDataset::new("ds", "db")
            .with_after("billing")
            .with_collection(
                Collection::new("carts")
                    .with_field(Field::new("email").with_identity("email"))
                    .with_after(addr("wishlist")),
            )
            .with_collection(
                Collection::new("wishlist").with_field(Field::new("email").with_identity("email")),
            );
        let graph = DatasetGraph::build(&[shop, billing]).unwrap();
        let plan = Traversal::plan_access(&graph, &email_seed()).unwrap();

        assert_eq!(
            plan.order(),
            vec![
                &CollectionAddress::new("billing", "invoices"),
                &addr("wishlist"),
                &addr("carts")
            ]
        );
        assert_eq!(
            plan.task(&addr("carts")).unwrap().upstream,
            vec![addr("wishlist"), CollectionAddress::new("billing", "invoices")]
        );
    }

    #[test]
    fn test_directed_cycle_is_access_cycle() {
        let dataset = GraphDataset::new("ds", "db")
            .with_collection(
                Collection::new("a")
                    .with_field(Field::new("email").with_identity("email"))
                    .with_field(
                        Field::new("x").with_reference(field("ds.b.y"), ReferenceDirection::To),
                    ),
            )
            .with_collection(
                Collection::new("b")
                    .with_field(Field::new("y"))
                    .with_field(
                        Field::new("z").with_reference(field("ds.a.x"), ReferenceDirection::To),
                    ),
            );
        let graph = DatasetGraph::build(&[dataset]).unwrap();
        let err = Traversal::plan_access(&graph, &email_seed()).unwrap_err();
        assert!(matches!(err, TraversalError::AccessCycle { .. }));
        assert!(err.to_string().contains("[ds:a, ds:b, ds:a]"));
    }

    #[test]
    fn test_plan_dot_output() {
        let graph = shop();
        let plan = Traversal::plan_access(&graph, &email_seed()).unwrap();
        let dot = plan.to_dot();
        assert!(dot.contains("digraph"));
        assert!(dot.contains("ds:refunds (access)"));
        assert_eq!(
            plan.downstream_closure(&addr("orders")),
            vec![addr("refunds"), addr("labels")]
        );
    }
}
