use super::{error::Result, error::StorageError, PrivacyRequest, RequestStatus, TaskStore};
use crate::core::{ActionType, RequestTask, TaskKey, TaskStatus, TaskUpdate};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

/// How long `dequeue_request` waits for work before reporting an empty queue.
const DEQUEUE_WAIT: Duration = Duration::from_millis(50);

/// In-memory task store using DashMap for concurrent access.
///
/// Row updates happen under the DashMap shard lock of the row, which makes
/// every [`TaskStore::update_task`] call an atomic read-modify-write. Task
/// creation is serialized per triple through the key index entry.
///
/// The request queue is an unbounded channel; a request id is queued at
/// most once until it is dequeued. Suitable for tests and single-process
/// deployments only, as nothing is shared across processes.
pub struct InMemoryTaskStore {
    requests: DashMap<Uuid, PrivacyRequest>,
    tasks: DashMap<Uuid, RequestTask>,
    /// Triple -> task id
    keys: DashMap<TaskKey, Uuid>,
    /// Request id -> task ids in creation order
    by_request: DashMap<Uuid, Vec<Uuid>>,
    /// Request ids currently in the channel
    queued: DashMap<Uuid, ()>,
    pending_tx: mpsc::UnboundedSender<Uuid>,
    pending_rx: Arc<Mutex<mpsc::UnboundedReceiver<Uuid>>>,
    /// Wakes a waiting worker when a request is enqueued
    work_notify: Arc<Notify>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        Self {
            requests: DashMap::new(),
            tasks: DashMap::new(),
            keys: DashMap::new(),
            by_request: DashMap::new(),
            queued: DashMap::new(),
            pending_tx,
            pending_rx: Arc::new(Mutex::new(pending_rx)),
            work_notify: Arc::new(Notify::new()),
        }
    }

    /// Writes a task row as-is, bypassing the state machine.
    ///
    /// Seeds state left behind by an earlier process, such as rows cached
    /// by a previous run or rows stranded mid-execution by a crash.
    pub fn insert_raw(&self, task: RequestTask) {
        let id = task.id();
        let request_id = task.privacy_request_id();
        if self.keys.insert(task.key().clone(), id).is_none() {
            self.by_request.entry(request_id).or_default().push(id);
        }
        self.tasks.insert(id, task);
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save_request(&self, request: &PrivacyRequest) -> Result<()> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> Result<Option<PrivacyRequest>> {
        Ok(self.requests.get(&id).map(|r| r.clone()))
    }

    async fn set_request_status(&self, id: Uuid, status: RequestStatus) -> Result<()> {
        let mut entry = self
            .requests
            .get_mut(&id)
            .ok_or(StorageError::RequestNotFound(id))?;
        entry.status = status;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn create_tasks(&self, tasks: Vec<RequestTask>) -> Result<Vec<RequestTask>> {
        let mut stored = Vec::with_capacity(tasks.len());

        for task in tasks {
            // The key entry lock serializes concurrent creators of the same triple.
            match self.keys.entry(task.key().clone()) {
                Entry::Occupied(existing) => {
                    let id = *existing.get();
                    let row = self
                        .tasks
                        .get(&id)
                        .map(|t| t.clone())
                        .ok_or(StorageError::TaskNotFound(id))?;
                    stored.push(row);
                }
                Entry::Vacant(slot) => {
                    let id = task.id();
                    self.tasks.insert(id, task.clone());
                    self.by_request
                        .entry(task.privacy_request_id())
                        .or_default()
                        .push(id);
                    slot.insert(id);
                    stored.push(task);
                }
            }
        }

        Ok(stored)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<RequestTask>> {
        Ok(self.tasks.get(&id).map(|t| t.clone()))
    }

    async fn get_task_by_key(&self, key: &TaskKey) -> Result<Option<RequestTask>> {
        let Some(id) = self.keys.get(key).map(|id| *id) else {
            return Ok(None);
        };
        self.get_task(id).await
    }

    async fn tasks_for_request(
        &self,
        request_id: Uuid,
        action: Option<ActionType>,
    ) -> Result<Vec<RequestTask>> {
        let ids = self
            .by_request
            .get(&request_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();

        Ok(ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.clone()))
            .filter(|task| action.is_none_or(|a| task.action() == a))
            .collect())
    }

    async fn update_task(
        &self,
        id: Uuid,
        expected: Option<TaskStatus>,
        update: TaskUpdate,
    ) -> Result<Option<RequestTask>> {
        let mut entry = self
            .tasks
            .get_mut(&id)
            .ok_or(StorageError::TaskNotFound(id))?;

        if let Some(expected) = expected {
            if entry.status() != expected {
                debug!(
                    task_id = %id,
                    %expected,
                    actual = %entry.status(),
                    "compare-and-swap lost"
                );
                return Ok(None);
            }
        }

        let mut next = entry.clone();
        next.apply(update)?;
        *entry = next.clone();
        Ok(Some(next))
    }

    async fn suspended_tasks(&self) -> Result<Vec<RequestTask>> {
        let mut suspended: Vec<RequestTask> = self
            .tasks
            .iter()
            .filter(|t| t.is_suspended())
            .map(|t| t.clone())
            .collect();
        suspended.sort_by_key(|t| t.updated_at());
        Ok(suspended)
    }

    async fn claimed_tasks(&self) -> Result<Vec<RequestTask>> {
        let mut claimed: Vec<RequestTask> = self
            .tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::InProcessing && !t.is_suspended())
            .map(|t| t.clone())
            .collect();
        claimed.sort_by_key(|t| t.updated_at());
        Ok(claimed)
    }

    async fn enqueue_request(&self, request_id: Uuid) -> Result<()> {
        if self.queued.insert(request_id, ()).is_some() {
            return Ok(());
        }

        // UnboundedSender::send never fails unless the receiver is dropped
        self.pending_tx
            .send(request_id)
            .map_err(|_| StorageError::QueueClosed)?;

        self.work_notify.notify_one();
        Ok(())
    }

    async fn dequeue_request(&self) -> Result<Option<Uuid>> {
        let mut rx = self.pending_rx.lock().await;

        let request_id = match tokio::time::timeout(DEQUEUE_WAIT, rx.recv()).await {
            Ok(Some(id)) => id,
            Ok(None) => return Err(StorageError::QueueClosed),
            Err(_) => return Ok(None),
        };
        drop(rx);

        self.queued.remove(&request_id);
        Ok(Some(request_id))
    }

    async fn reset(&self) -> Result<()> {
        self.requests.clear();
        self.tasks.clear();
        self.keys.clear();
        self.by_request.clear();
        self.queued.clear();

        let mut rx = self.pending_rx.lock().await;
        while rx.try_recv().is_ok() {}
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    fn work_notify(&self) -> Option<&Arc<Notify>> {
        Some(&self.work_notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AsyncType, CoreError, Policy};
    use crate::graph::CollectionAddress;

    fn task(request_id: Uuid, collection: &str) -> RequestTask {
        RequestTask::new(
            TaskKey::new(
                request_id,
                CollectionAddress::new("ds", collection),
                ActionType::Access,
            ),
            vec![],
            vec![],
        )
    }

    #[tokio::test]
    async fn test_create_tasks_is_insert_if_absent() {
        let store = InMemoryTaskStore::new();
        let request_id = Uuid::new_v4();

        let first = store.create_tasks(vec![task(request_id, "orders")]).await.unwrap();
        store.claim_task(first[0].id()).await.unwrap();

        let second = store
            .create_tasks(vec![task(request_id, "orders"), task(request_id, "refunds")])
            .await
            .unwrap();

        assert_eq!(second[0].id(), first[0].id());
        assert_eq!(second[0].status(), TaskStatus::InProcessing);
        assert_eq!(
            store.tasks_for_request(request_id, None).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = Arc::new(InMemoryTaskStore::new());
        let created = store
            .create_tasks(vec![task(Uuid::new_v4(), "orders")])
            .await
            .unwrap();
        let id = created[0].id();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_task(id).await.unwrap() }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_transition() {
        let store = InMemoryTaskStore::new();
        let created = store
            .create_tasks(vec![task(Uuid::new_v4(), "orders")])
            .await
            .unwrap();

        let err = store
            .update_task(created[0].id(), None, TaskUpdate::masked(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Core(CoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_suspended_and_overdue() {
        let store = InMemoryTaskStore::new();
        let created = store
            .create_tasks(vec![task(Uuid::new_v4(), "orders")])
            .await
            .unwrap();
        let id = created[0].id();
        store.claim_task(id).await.unwrap();

        let deadline = Utc::now() + chrono::Duration::minutes(5);
        store
            .update_task(
                id,
                Some(TaskStatus::InProcessing),
                TaskUpdate::suspended(AsyncType::Callback, deadline),
            )
            .await
            .unwrap();

        assert_eq!(store.suspended_tasks().await.unwrap().len(), 1);
        assert!(store.overdue_tasks(Utc::now()).await.unwrap().is_empty());
        assert_eq!(
            store
                .overdue_tasks(deadline + chrono::Duration::seconds(1))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_claims_by_claim_time() {
        let store = InMemoryTaskStore::new();
        let request_id = Uuid::new_v4();
        let created = store
            .create_tasks(vec![task(request_id, "orders"), task(request_id, "refunds")])
            .await
            .unwrap();
        store.claim_task(created[0].id()).await.unwrap();
        let claimed_at = Utc::now();
        store.claim_task(created[1].id()).await.unwrap();
        store
            .update_task(
                created[1].id(),
                None,
                TaskUpdate::suspended(AsyncType::Polling, claimed_at),
            )
            .await
            .unwrap();

        assert_eq!(store.claimed_tasks().await.unwrap().len(), 1);
        let before = claimed_at - chrono::Duration::seconds(5);
        assert!(store.stale_claims(before).await.unwrap().is_empty());
        let stale = store.stale_claims(claimed_at).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), created[0].id());
    }

    #[tokio::test]
    async fn test_request_status_roundtrip() {
        let store = InMemoryTaskStore::new();
        let request = PrivacyRequest::new(Policy::new("default"));
        store.save_request(&request).await.unwrap();

        store
            .set_request_status(request.id, RequestStatus::Paused)
            .await
            .unwrap();
        let loaded = store.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RequestStatus::Paused);

        let missing = store
            .set_request_status(Uuid::new_v4(), RequestStatus::Paused)
            .await;
        assert!(matches!(missing, Err(StorageError::RequestNotFound(_))));
    }

    #[tokio::test]
    async fn test_queue_fifo_and_dedup() {
        let store = InMemoryTaskStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.enqueue_request(a).await.unwrap();
        store.enqueue_request(b).await.unwrap();
        store.enqueue_request(a).await.unwrap();

        let mut seen = Vec::new();
        while let Some(id) = store.dequeue_request().await.unwrap() {
            seen.push(id);
        }
        assert_eq!(seen, vec![a, b]);

        // Once dequeued, the same id can be queued again.
        store.enqueue_request(a).await.unwrap();
        assert_eq!(store.dequeue_request().await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let store = InMemoryTaskStore::new();
        let request_id = Uuid::new_v4();
        store.create_tasks(vec![task(request_id, "orders")]).await.unwrap();
        store.enqueue_request(request_id).await.unwrap();

        store.reset().await.unwrap();

        assert!(store.tasks_for_request(request_id, None).await.unwrap().is_empty());
        assert!(store.dequeue_request().await.unwrap().is_none());
        assert!(store.get_request(request_id).await.unwrap().is_none());
    }
}
