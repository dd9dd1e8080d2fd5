//! Shared execution state.
//!
//! [`ExecutorContext`] owns everything a task execution needs from outside
//! the plan: the task store, the connector registry and the configuration.
//! It is cheap to clone and is handed to every spawned task.

use super::error::Result;
use crate::connector::ConnectorRegistry;
use crate::core::{DownstreamFailurePolicy, ExecutorConfig, RequestTask, TaskStatus, TaskUpdate};
use crate::graph::CollectionAddress;
use crate::storage::TaskStore;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ExecutorContext {
    store: Arc<dyn TaskStore>,
    registry: Arc<ConnectorRegistry>,
    config: Arc<ExecutorConfig>,
}

impl ExecutorContext {
    /// Creates a context. Connections without their own concurrency limit
    /// get `config.default_connector_concurrency`.
    pub fn new<S>(store: Arc<S>, registry: ConnectorRegistry, config: ExecutorConfig) -> Self
    where
        S: TaskStore + 'static,
    {
        let registry = registry.with_default_concurrency(config.default_connector_concurrency);
        Self {
            store,
            registry: Arc::new(registry),
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Marks the not yet executed downstream closure of `failed` according to
    /// [`ExecutorConfig::downstream_failure`].
    ///
    /// Only `pending` tasks are touched; tasks that already ran keep their
    /// result. Returns the tasks that changed.
    pub(crate) async fn propagate_failure(&self, failed: &RequestTask) -> Result<Vec<RequestTask>> {
        let siblings = self
            .store
            .tasks_for_request(failed.privacy_request_id(), Some(failed.action()))
            .await?;
        let by_address: HashMap<&CollectionAddress, &RequestTask> =
            siblings.iter().map(|task| (task.collection(), task)).collect();

        let mut closure: Vec<&RequestTask> = Vec::new();
        let mut frontier: VecDeque<&CollectionAddress> = failed.downstream().iter().collect();
        while let Some(address) = frontier.pop_front() {
            let Some(task) = by_address.get(address) else {
                continue;
            };
            if closure.iter().any(|seen| seen.id() == task.id()) {
                continue;
            }
            closure.push(task);
            frontier.extend(task.downstream());
        }

        let mut changed = Vec::new();
        for task in closure {
            if task.status() != TaskStatus::Pending {
                continue;
            }

            let update = match self.config.downstream_failure {
                DownstreamFailurePolicy::Error => {
                    TaskUpdate::failed(format!("upstream task {} failed", failed.collection()))
                }
                DownstreamFailurePolicy::Skip => TaskUpdate::status(TaskStatus::Skipped),
            };

            if let Some(updated) = self
                .store
                .update_task(task.id(), Some(TaskStatus::Pending), update)
                .await?
            {
                changed.push(updated);
            }
        }

        if !changed.is_empty() {
            warn!(
                privacy_request_id = %failed.privacy_request_id(),
                failed = %failed.collection(),
                affected = changed.len(),
                policy = ?self.config.downstream_failure,
                "propagated task failure downstream"
            );
        }
        Ok(changed)
    }
}
