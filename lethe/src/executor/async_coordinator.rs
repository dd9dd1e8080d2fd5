//! Suspension and out-of-band completion of connector calls.
//!
//! A connector that answers [`ConnectorOutcome::AwaitingAsync`] leaves its
//! task `in_processing` with an `async_type` and a deadline. Nothing polls
//! the task: it leaves that state only through [`AsyncCoordinator::complete`]
//! or [`AsyncCoordinator::expire_overdue`], both of which re-enqueue the
//! owning request so a worker resumes it.
//!
//! A third party may answer before the suspension is written, while the task
//! is still claimed by the call that started the job. The completion is
//! recorded anyway and the late suspension becomes a no-op.
//!
//! [`ConnectorOutcome::AwaitingAsync`]: crate::connector::ConnectorOutcome::AwaitingAsync

use super::context::ExecutorContext;
use super::error::{ExecutionError, Result};
use crate::core::{ActionType, AsyncType, RequestTask, Row, TaskStatus, TaskUpdate};
use crate::graph::CollectionAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result delivered by a third party for a suspended task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AsyncPayload {
    /// Rows for an access task.
    Rows(Vec<Row>),
    /// Masked row count for an erasure task.
    Masked(u64),
    Failed(String),
}

/// The signal returned when a task suspends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suspension {
    pub task_id: Uuid,
    pub async_type: AsyncType,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The task completed. `ready` lists the direct downstream collections
    /// whose upstream is now entirely satisfied.
    Completed { ready: Vec<CollectionAddress> },
    /// The payload reported a failure; the task is `error` now.
    Failed,
    /// The task had already finished; nothing changed.
    AlreadyFinished,
}

#[derive(Clone)]
pub struct AsyncCoordinator {
    ctx: ExecutorContext,
}

impl AsyncCoordinator {
    pub fn new(ctx: ExecutorContext) -> Self {
        Self { ctx }
    }

    /// Suspends a claimed task until its external completion arrives.
    ///
    /// Returns `None` when the completion already arrived and the task is
    /// terminal, so there is nothing left to wait for.
    pub async fn initiate(
        &self,
        task: &RequestTask,
        async_type: AsyncType,
    ) -> Result<Option<Suspension>> {
        let store = self.ctx.store();
        let deadline = deadline_after(Utc::now(), self.ctx.config().async_deadline);

        let suspended = store
            .update_task(
                task.id(),
                Some(TaskStatus::InProcessing),
                TaskUpdate::suspended(async_type, deadline),
            )
            .await?;

        if suspended.is_none() {
            let current = store
                .get_task(task.id())
                .await?
                .ok_or(ExecutionError::TaskNotFound(task.id()))?;
            if current.status().is_terminal() {
                debug!(
                    task_id = %task.id(),
                    status = %current.status(),
                    "completion arrived before suspension"
                );
                return Ok(None);
            }
            return Err(ExecutionError::Conflict(task.id()));
        }

        info!(
            task_id = %task.id(),
            collection = %task.collection(),
            action = %task.action(),
            async_type = async_type.as_str(),
            %deadline,
            "task suspended awaiting external completion"
        );

        Ok(Some(Suspension {
            task_id: task.id(),
            async_type,
            deadline,
        }))
    }

    /// Records the external result of a suspended task, or of a claimed one
    /// whose suspension has not been written yet.
    ///
    /// Safe to replay: once the task is terminal, further calls return
    /// [`CompletionOutcome::AlreadyFinished`] and change nothing.
    pub async fn complete(
        &self,
        task_id: Uuid,
        payload: AsyncPayload,
    ) -> Result<CompletionOutcome> {
        let store = self.ctx.store();
        let task = store
            .get_task(task_id)
            .await?
            .ok_or(ExecutionError::TaskNotFound(task_id))?;

        if task.status().is_terminal() {
            debug!(%task_id, status = %task.status(), "duplicate async completion ignored");
            return Ok(CompletionOutcome::AlreadyFinished);
        }

        let (update, target) = match (&payload, task.action()) {
            (AsyncPayload::Rows(rows), ActionType::Access) => {
                (TaskUpdate::retrieved(rows.clone()), TaskStatus::Complete)
            }
            (AsyncPayload::Masked(count), ActionType::Erasure) => {
                (TaskUpdate::masked(*count), TaskStatus::Complete)
            }
            (AsyncPayload::Failed(message), _) => {
                (TaskUpdate::failed(message.clone()), TaskStatus::Error)
            }
            (_, action) => return Err(ExecutionError::InvalidPayload { task_id, action }),
        };

        if task.status() != TaskStatus::InProcessing {
            return Err(ExecutionError::InvalidTransition {
                task_id,
                from: task.status(),
                to: target,
            });
        }
        if !task.is_suspended() {
            debug!(%task_id, "completion arrived ahead of its suspension");
        }

        let updated = match store
            .update_task(task_id, Some(TaskStatus::InProcessing), update)
            .await?
        {
            Some(updated) => updated,
            None => {
                // Lost to a concurrent completion or expiry
                debug!(%task_id, "async completion raced, task already finished");
                return Ok(CompletionOutcome::AlreadyFinished);
            }
        };

        let outcome = if target == TaskStatus::Error {
            let collection = updated.collection();
            warn!(%task_id, %collection, "async completion reported failure");
            self.ctx.propagate_failure(&updated).await?;
            CompletionOutcome::Failed
        } else {
            info!(%task_id, collection = %updated.collection(), "async completion recorded");
            CompletionOutcome::Completed {
                ready: self.ready_downstream(&updated).await?,
            }
        };

        store.enqueue_request(updated.privacy_request_id()).await?;
        Ok(outcome)
    }

    /// Forces every task suspended past its deadline to `error`.
    ///
    /// Returns the ids of the expired tasks.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let store = self.ctx.store();
        let mut expired = Vec::new();

        for task in store.overdue_tasks(now).await? {
            let message = match task.async_deadline() {
                Some(deadline) => format!("async completion not received by {}", deadline),
                None => "async completion not received".to_string(),
            };

            let Some(updated) = store
                .update_task(task.id(), Some(TaskStatus::InProcessing), TaskUpdate::failed(message))
                .await?
            else {
                continue;
            };

            warn!(
                task_id = %updated.id(),
                privacy_request_id = %updated.privacy_request_id(),
                collection = %updated.collection(),
                "suspended task passed its deadline"
            );
            self.ctx.propagate_failure(&updated).await?;
            store.enqueue_request(updated.privacy_request_id()).await?;
            expired.push(updated.id());
        }

        Ok(expired)
    }

    async fn ready_downstream(&self, task: &RequestTask) -> Result<Vec<CollectionAddress>> {
        if task.downstream().is_empty() {
            return Ok(Vec::new());
        }

        let siblings = self
            .ctx
            .store()
            .tasks_for_request(task.privacy_request_id(), Some(task.action()))
            .await?;
        let satisfied = |address: &CollectionAddress| {
            siblings
                .iter()
                .find(|t| t.collection() == address)
                .is_some_and(|t| t.status().satisfies_downstream())
        };

        Ok(siblings
            .iter()
            .filter(|t| task.downstream().contains(t.collection()))
            .filter(|t| t.status() == TaskStatus::Pending)
            .filter(|t| t.upstream().iter().all(satisfied))
            .map(|t| t.collection().clone())
            .collect())
    }
}

/// `now + duration`, saturating far in the future.
pub(crate) fn deadline_after(now: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| now.checked_add_signed(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deadline_after_adds_duration() {
        let now = Utc::now();
        let deadline = deadline_after(now, Duration::from_secs(90));
        assert_eq!(deadline - now, chrono::Duration::seconds(90));
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Utc::now();
        assert_eq!(deadline_after(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload: AsyncPayload =
            serde_json::from_str(r#"{ "type": "masked", "data": 4 }"#).unwrap();
        assert_eq!(payload, AsyncPayload::Masked(4));

        let failed = serde_json::to_value(AsyncPayload::Failed("timeout".into())).unwrap();
        assert_eq!(failed, serde_json::json!({ "type": "failed", "data": "timeout" }));
    }
}
