//! Storage layer for request tasks and privacy requests.
//!
//! This module provides a trait-based interface for persisting execution
//! state with two backends:
//!
//! - [`InMemoryTaskStore`]: DashMap-based storage for tests and single-process use
//! - [`SqliteTaskStore`]: persistent SQLite storage with connection pooling
//!   (behind the `sqlite` feature)
//!
//! The store is the single source of truth for execution. Every status
//! change goes through [`TaskStore::update_task`], a per-row compare-and-swap,
//! so concurrent dispatchers never both own the same task.
//!
//! # Example
//!
//! ```no_run
//! use lethe::storage::{InMemoryTaskStore, TaskStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryTaskStore::new();
//! assert!(store.dequeue_request().await?.is_none());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

mod error;
mod queue;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod memory;

pub use error::{Result, StorageError};
pub use memory::InMemoryTaskStore;
pub use queue::{PrivacyRequest, RequestStatus};

#[cfg(feature = "sqlite")]
pub use sqlite::{PoolConfig, SqliteTaskStore};

use crate::core::{ActionType, RequestTask, TaskKey, TaskStatus, TaskUpdate};

/// Trait for task storage backends.
///
/// Implementations must be thread-safe and must apply each row update as a
/// single read-modify-write, with no lost updates under concurrent callers.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ===== Privacy requests =====

    /// Inserts or replaces a privacy request record.
    async fn save_request(&self, request: &PrivacyRequest) -> Result<()>;

    async fn get_request(&self, id: Uuid) -> Result<Option<PrivacyRequest>>;

    /// Sets the status of an existing request.
    async fn set_request_status(&self, id: Uuid, status: RequestStatus) -> Result<()>;

    // ===== Request tasks =====

    /// Inserts tasks whose triple has no row yet and leaves existing rows
    /// untouched. Returns the stored row for every input, in input order.
    async fn create_tasks(&self, tasks: Vec<RequestTask>) -> Result<Vec<RequestTask>>;

    async fn get_task(&self, id: Uuid) -> Result<Option<RequestTask>>;

    async fn get_task_by_key(&self, key: &TaskKey) -> Result<Option<RequestTask>>;

    /// Tasks of a request in creation order, optionally filtered by action.
    async fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>>;

    /// Applies `update` to a task atomically.
    ///
    /// When `expected` is set and the stored status differs, nothing changes
    /// and `Ok(None)` is returned. A transition the state machine rejects is
    /// an error. On success the updated row is returned.
    async fn update_task(
        &self,
        id: Uuid,
        expected: Option<TaskStatus>,
        update: TaskUpdate,
    ) -> Result<Option<RequestTask>>;

    /// Claims a pending task for execution (`pending -> in_processing`).
    ///
    /// Returns false if the task was not pending, meaning someone else owns it
    /// or it already finished.
    async fn claim_task(&self, id: Uuid) -> Result<bool> {
        let claimed = self
            .update_task(
                id,
                Some(TaskStatus::Pending),
                TaskUpdate::status(TaskStatus::InProcessing),
            )
            .await?;
        Ok(claimed.is_some())
    }

    /// Tasks of any request that are suspended on an external completion.
    async fn suspended_tasks(&self) -> Result<Vec<RequestTask>>;

    /// Tasks of any request that are claimed and running a connector call,
    /// which is `in_processing` without a suspension.
    async fn claimed_tasks(&self) -> Result<Vec<RequestTask>>;

    /// Claimed tasks whose claim was taken at or before `cutoff`.
    async fn stale_claims(&self, cutoff: DateTime<Utc>) -> Result<Vec<RequestTask>> {
        let tasks = self.claimed_tasks().await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.is_stale_claim(cutoff))
            .collect())
    }

    /// Suspended tasks whose deadline is at or before `now`.
    async fn overdue_tasks(&self, now: DateTime<Utc>) -> Result<Vec<RequestTask>> {
        let tasks = self.suspended_tasks().await?;
        Ok(tasks.into_iter().filter(|t| t.is_overdue(now)).collect())
    }

    // ===== Request queue =====

    /// Schedules a request for (continued) processing by a worker.
    async fn enqueue_request(&self, request_id: Uuid) -> Result<()>;

    /// Takes the next request id off the queue, or `None` if the queue is
    /// empty.
    async fn dequeue_request(&self) -> Result<Option<Uuid>>;

    /// Deletes everything.
    async fn reset(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Fired when a request is enqueued, for backends that can signal it.
    ///
    /// Workers wait on this instead of sleeping out the poll interval.
    fn work_notify(&self) -> Option<&Arc<Notify>> {
        None
    }
}
