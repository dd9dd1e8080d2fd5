//! Lethe: dependency-safe execution of privacy requests
//!
//! `lethe` (λήθη, Greek for "forgetting") plans and runs data subject
//! requests across many datasets. A request carries identity seeds such as an
//! email address; lethe walks the graph of collections reachable from those
//! seeds, retrieves every matching row (access), then masks the fields the
//! policy selects (erasure), in an order that respects foreign keys.
//!
//! # Features
//!
//! - **Dataset graph**: collections, fields and references built into a
//!   validated graph with cycle reporting
//! - **Traversal planning**: separate access and erasure orders, each a DAG
//! - **Durable task rows**: one row per (request, collection, action), so
//!   re-running a request never repeats finished work
//! - **Async connectors**: suspension, out-of-band completion and deadlines
//! - **Retries**: transient connector failures are retried with backoff
//!
//! # Quick Start
//!
//! ```no_run
//! use lethe::prelude::*;
//!
//! # async fn example(datasets: Vec<GraphDataset>, registry: ConnectorRegistry)
//! # -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Arc::new(DatasetGraph::build(&datasets)?);
//! let store = Arc::new(InMemoryTaskStore::new());
//! let ctx = ExecutorContext::new(store, registry, ExecutorConfig::default());
//! let executor = TaskExecutor::new(ctx, graph);
//!
//! let policy = Policy::new("default").with_rule(Rule::access("access", &["user"]));
//! let request = PrivacyRequest::new(policy).with_identity("email", "jane@example.com");
//! let summary = executor.submit(request).await?;
//! println!("{:?}", summary.outcome);
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: request tasks, their state machine, policies and retry
//! - [`graph`]: dataset model, graph builder and dependency ordering
//! - [`traversal`]: reachability and execution plans
//! - [`connector`]: the datastore interface and connection registry
//! - [`storage`]: persistence of requests, tasks and the request queue
//! - [`executor`]: dispatch, async coordination and the queue worker

pub mod connector;
pub mod core;
pub mod executor;
pub mod graph;
pub mod storage;
pub mod traversal;

pub use core::{
    ActionType, AsyncType, CoreError, ExecutorConfig, Policy, RequestTask, RetryPolicy, Retryable,
    Row, TaskStatus,
};

pub use connector::{Connector, ConnectorError, ConnectorRegistry};

pub use executor::{
    AsyncCoordinator, AsyncPayload, ExecutionError, ExecutionSummary, RequestOutcome,
    Result as ExecutionResult, TaskExecutor, Worker, WorkerHandle,
};

pub use graph::{DatasetGraph, GraphError, GraphResult};

pub use storage::{
    InMemoryTaskStore, PrivacyRequest, RequestStatus, Result as StorageResult, StorageError,
    TaskStore,
};

#[cfg(feature = "sqlite")]
pub use storage::SqliteTaskStore;

pub use traversal::{ExecutionPlan, Traversal, TraversalError};

// Re-export dependencies used in public API
pub use async_trait::async_trait;
pub use serde_json;
pub use tokio;
pub use uuid;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use lethe::prelude::*;
/// ```
pub mod prelude {
    pub use crate::connector::{
        ConnectionConfig, ConnectionStatus, Connector, ConnectorContext, ConnectorError,
        ConnectorInputs, ConnectorOutcome, ConnectorRegistry,
    };

    pub use crate::core::{
        ActionType, AsyncType, DownstreamFailurePolicy, ExecutorConfig, MaskingStrategy, Policy,
        RequestTask, RetryPolicy, Row, Rule, TaskStatus,
    };

    pub use crate::executor::{
        AsyncPayload, CompletionOutcome, ExecutionError, ExecutionSummary, ExecutorContext,
        MaskingPlan, RequestOutcome, TaskExecutor, Worker, WorkerHandle,
    };

    pub use crate::graph::{
        Collection, CollectionAddress, DatasetDefinition, DatasetGraph, Field, FieldAddress,
        FieldPath, GraphDataset, ReferenceDirection,
    };

    pub use crate::storage::{InMemoryTaskStore, PrivacyRequest, RequestStatus, TaskStore};

    #[cfg(feature = "sqlite")]
    pub use crate::storage::SqliteTaskStore;

    pub use crate::traversal::{ExecutionPlan, Traversal};

    // Re-export commonly used external types
    pub use async_trait::async_trait;
    pub use std::sync::Arc;
    pub use uuid::Uuid;
}
