//! The executor against the SQLite store.

#![cfg(feature = "sqlite")]

mod common;

use common::*;
use lethe::prelude::*;
use lethe::serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

async fn executor(store: Arc<SqliteTaskStore>, connector: Arc<ScriptedConnector>) -> TaskExecutor {
    let mut registry = ConnectorRegistry::new();
    registry.add_connector("shop_db", connector, None).unwrap();
    let ctx = ExecutorContext::new(store, registry, fast_config());
    TaskExecutor::new(ctx, shop_graph())
}

fn temp_db() -> PathBuf {
    std::env::temp_dir().join(format!("lethe-{}.db", Uuid::new_v4()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

#[tokio::test]
async fn test_request_survives_executor_restart() {
    let store = Arc::new(SqliteTaskStore::in_memory().await.unwrap());
    let connector = ScriptedConnector::shop();
    connector.script(ActionType::Access, "refunds", Step::Async(AsyncType::Callback));
    let connector = Arc::new(connector);

    let request = jane(erasure_policy());
    let id = request.id;
    let summary = executor(store.clone(), connector.clone())
        .await
        .submit(request)
        .await
        .unwrap();
    assert_eq!(summary.outcome, RequestOutcome::AwaitingCallback);

    // A fresh executor over the same store picks the request up
    let executor = executor(store.clone(), connector.clone()).await;
    let refunds = store
        .get_task_by_key(&lethe::core::TaskKey::new(id, addr("refunds"), ActionType::Access))
        .await
        .unwrap()
        .unwrap();
    executor
        .coordinator()
        .complete(
            refunds.id(),
            AsyncPayload::Rows(vec![row(json!({ "id": 10, "order_id": 1, "reason": "damaged" }))]),
        )
        .await
        .unwrap();

    assert_eq!(store.dequeue_request().await.unwrap(), Some(id));
    let summary = executor.resume(id).await.unwrap();

    assert_eq!(summary.outcome, RequestOutcome::Complete { rows_found: 3 });
    assert_eq!(
        connector.calls_for(ActionType::Access),
        vec!["orders", "refunds", "labels"]
    );
    assert_eq!(connector.calls_for(ActionType::Erasure).len(), 3);

    let stored = store.get_request(id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Complete);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fan_out_runs_concurrently_on_file_database() {
    const WIDTH: usize = 12;

    let path = temp_db();
    let store = Arc::new(SqliteTaskStore::new(&path).await.unwrap());
    let connector = Arc::new(fan_out_connector(WIDTH).with_latency(Duration::from_millis(5)));
    let mut registry = ConnectorRegistry::new();
    registry
        .add_connector("shop_db", connector.clone(), Some(WIDTH))
        .unwrap();
    let ctx = ExecutorContext::new(store.clone(), registry, fast_config());
    let executor = TaskExecutor::new(ctx, fan_out_graph(WIDTH));

    let policy = access_policy().with_rule(Rule::erasure(
        "erase_user",
        &["user"],
        Some(MaskingStrategy::NullRewrite),
    ));
    // Two requests at once double the writers on the same file
    let (a, b) = (jane(policy.clone()), jane(policy));
    let ids = [a.id, b.id];
    let (first, second) = tokio::join!(executor.submit(a), executor.submit(b));

    for summary in [first.unwrap(), second.unwrap()] {
        assert_eq!(
            summary.outcome,
            RequestOutcome::Complete {
                rows_found: WIDTH as u64 + 1
            }
        );
        assert_eq!(summary.erasure.complete, WIDTH + 1);
    }
    for id in ids {
        let tasks = store.tasks_for_request(id, None).await.unwrap();
        assert_eq!(tasks.len(), 2 * (WIDTH + 1));
        assert!(tasks.iter().all(|t| t.status() == TaskStatus::Complete));
    }
    assert!(connector.peak_concurrency() > 1);

    store.close().await.unwrap();
    remove_db(&path);
}
