//! Shared fixtures: a small shop graph and a scripted in-memory connector.

#![allow(dead_code)]

use lethe::prelude::*;
use lethe::serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

pub fn addr(collection: &str) -> CollectionAddress {
    CollectionAddress::new("shop", collection)
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().expect("row fixture must be an object")
}

/// orders -> refunds -> labels for access; erasure runs labels, refunds, orders.
pub fn shop_dataset() -> GraphDataset {
    GraphDataset::new("shop", "shop_db")
        .with_collection(
            Collection::new("orders")
                .with_field(Field::new("id").with_primary_key())
                .with_field(
                    Field::new("email")
                        .with_identity("email")
                        .with_category("user.contact.email"),
                )
                .with_erase_after(addr("refunds")),
        )
        .with_collection(
            Collection::new("refunds")
                .with_field(Field::new("id").with_primary_key())
                .with_field(Field::new("order_id").with_reference(
                    FieldAddress::new("shop", "orders", FieldPath::single("id")),
                    ReferenceDirection::From,
                ))
                .with_field(Field::new("reason").with_category("user.financial"))
                .with_erase_after(addr("labels")),
        )
        .with_collection(
            Collection::new("labels")
                .with_field(Field::new("id").with_primary_key())
                .with_field(Field::new("refund_id").with_reference(
                    FieldAddress::new("shop", "refunds", FieldPath::single("id")),
                    ReferenceDirection::From,
                ))
                .with_field(Field::new("address").with_category("user.contact.address")),
        )
}

pub fn shop_graph() -> Arc<DatasetGraph> {
    Arc::new(DatasetGraph::build(&[shop_dataset()]).expect("shop graph is valid"))
}

/// `customers` keyed by email, with `width` sibling collections that all
/// reference `customers.id` and can run side by side.
pub fn fan_out_graph(width: usize) -> Arc<DatasetGraph> {
    let mut dataset = GraphDataset::new("shop", "shop_db").with_collection(
        Collection::new("customers")
            .with_field(Field::new("id").with_primary_key())
            .with_field(
                Field::new("email")
                    .with_identity("email")
                    .with_category("user.contact.email"),
            ),
    );
    for i in 0..width {
        dataset = dataset.with_collection(
            Collection::new(format!("branch_{i}"))
                .with_field(Field::new("id").with_primary_key())
                .with_field(Field::new("customer_id").with_reference(
                    FieldAddress::new("shop", "customers", FieldPath::single("id")),
                    ReferenceDirection::From,
                ))
                .with_field(Field::new("note").with_category("user.content")),
        );
    }
    Arc::new(DatasetGraph::build(&[dataset]).expect("fan-out graph is valid"))
}

/// Fixture rows for [`fan_out_graph`]: Jane and one row per branch.
pub fn fan_out_connector(width: usize) -> ScriptedConnector {
    let connector = ScriptedConnector::new();
    connector.insert(
        "customers",
        vec![row(json!({ "id": 1, "email": "jane@example.com" }))],
    );
    for i in 0..width {
        connector.insert(
            &format!("branch_{i}"),
            vec![row(json!({ "id": i, "customer_id": 1, "note": "private" }))],
        );
    }
    connector
}

pub fn access_policy() -> Policy {
    Policy::new("access").with_rule(Rule::access("read_user", &["user"]))
}

pub fn erasure_policy() -> Policy {
    access_policy().with_rule(Rule::erasure(
        "erase_user",
        &["user"],
        Some(MaskingStrategy::NullRewrite),
    ))
}

pub fn jane(policy: Policy) -> PrivacyRequest {
    PrivacyRequest::new(policy).with_identity("email", "jane@example.com")
}

/// Retry quickly so exhausted retries do not slow the suite down.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        })
        .with_connector_timeout(Duration::from_secs(5))
        .with_queue_poll_interval(Duration::from_millis(10))
}

/// What the next call for a collection does instead of the default lookup.
pub enum Step {
    Fail(ConnectorError),
    Async(AsyncType),
    /// Wait for the notify, then answer normally.
    Wait(Arc<Notify>),
    /// Wait for the notify, then ask for an async completion.
    WaitThenAsync(Arc<Notify>, AsyncType),
}

/// A connector backed by fixture rows, with per-collection scripted steps.
#[derive(Default)]
pub struct ScriptedConnector {
    rows: Mutex<HashMap<String, Vec<Row>>>,
    steps: Mutex<HashMap<(ActionType, String), VecDeque<Step>>>,
    calls: Mutex<Vec<(ActionType, String)>>,
    masked: Mutex<Vec<(String, Row)>>,
    latency: Mutex<Option<Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Counts a call as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jane has one order with one refund and one shipping label.
    pub fn shop() -> Self {
        let connector = Self::new();
        connector.insert(
            "orders",
            vec![
                row(json!({ "id": 1, "email": "jane@example.com" })),
                row(json!({ "id": 2, "email": "john@example.com" })),
            ],
        );
        connector.insert(
            "refunds",
            vec![
                row(json!({ "id": 10, "order_id": 1, "reason": "damaged" })),
                row(json!({ "id": 11, "order_id": 2, "reason": "late" })),
            ],
        );
        connector.insert(
            "labels",
            vec![row(json!({ "id": 100, "refund_id": 10, "address": "1 Main St" }))],
        );
        connector
    }

    pub fn insert(&self, collection: &str, rows: Vec<Row>) {
        self.rows.lock().unwrap().insert(collection.to_string(), rows);
    }

    pub fn script(&self, action: ActionType, collection: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .entry((action, collection.to_string()))
            .or_default()
            .push_back(step);
    }

    pub fn calls(&self) -> Vec<(ActionType, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, action: ActionType) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(a, _)| *a == action)
            .map(|(_, collection)| collection)
            .collect()
    }

    pub fn masked(&self) -> Vec<(String, Row)> {
        self.masked.lock().unwrap().clone()
    }

    /// Makes every call take at least `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// The most calls that were ever in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlight<'_> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        InFlight(&self.active)
    }

    /// Runs the scripted step, if any. `Some` short-circuits the call.
    async fn play<T: Send>(
        &self,
        ctx: &ConnectorContext,
    ) -> Option<Result<ConnectorOutcome<T>, ConnectorError>> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.record(ctx)? {
            Step::Fail(e) => Some(Err(e)),
            Step::Async(async_type) => Some(Ok(ConnectorOutcome::AwaitingAsync(async_type))),
            Step::Wait(gate) => {
                gate.notified().await;
                None
            }
            Step::WaitThenAsync(gate, async_type) => {
                gate.notified().await;
                Some(Ok(ConnectorOutcome::AwaitingAsync(async_type)))
            }
        }
    }

    fn record(&self, ctx: &ConnectorContext) -> Option<Step> {
        let collection = ctx.address.collection().to_string();
        self.calls.lock().unwrap().push((ctx.action, collection.clone()));
        self.steps
            .lock()
            .unwrap()
            .get_mut(&(ctx.action, collection))
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus::Succeeded
    }

    async fn retrieve_data(
        &self,
        ctx: &ConnectorContext,
        inputs: &ConnectorInputs,
    ) -> Result<ConnectorOutcome<Vec<Row>>, ConnectorError> {
        let _in_flight = self.enter();
        if let Some(scripted) = self.play(ctx).await {
            return scripted;
        }

        let rows = self.rows.lock().unwrap();
        let matching = rows
            .get(ctx.address.collection())
            .map(|rows| {
                rows.iter()
                    .filter(|row| {
                        inputs.iter().any(|(path, values)| {
                            path.lookup(row).is_some_and(|value| values.contains(value))
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(ConnectorOutcome::Ready(matching))
    }

    async fn mask_data(
        &self,
        ctx: &ConnectorContext,
        masking: &MaskingPlan,
        rows: &[Row],
    ) -> Result<ConnectorOutcome<u64>, ConnectorError> {
        let _in_flight = self.enter();
        if let Some(scripted) = self.play(ctx).await {
            return scripted;
        }

        let mut masked = self.masked.lock().unwrap();
        let mut count = 0;
        for row in rows {
            if let Some(rewritten) = masking.apply(row) {
                masked.push((ctx.address.collection().to_string(), rewritten));
                count += 1;
            }
        }
        Ok(ConnectorOutcome::Ready(count))
    }
}

pub struct Harness {
    pub store: Arc<InMemoryTaskStore>,
    pub connector: Arc<ScriptedConnector>,
    pub executor: Arc<TaskExecutor>,
}

impl Harness {
    pub fn new(connector: ScriptedConnector, config: ExecutorConfig) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        Self::with_store(store, connector, config)
    }

    pub fn with_store(
        store: Arc<InMemoryTaskStore>,
        connector: ScriptedConnector,
        config: ExecutorConfig,
    ) -> Self {
        Self::build(store, shop_graph(), connector, config, None)
    }

    pub fn with_graph(
        graph: Arc<DatasetGraph>,
        connector: ScriptedConnector,
        config: ExecutorConfig,
    ) -> Self {
        Self::build(Arc::new(InMemoryTaskStore::new()), graph, connector, config, None)
    }

    /// Like [`Harness::with_graph`], with at most `limit` concurrent calls
    /// to `shop_db`.
    pub fn with_connection_limit(
        graph: Arc<DatasetGraph>,
        connector: ScriptedConnector,
        config: ExecutorConfig,
        limit: usize,
    ) -> Self {
        let store = Arc::new(InMemoryTaskStore::new());
        Self::build(store, graph, connector, config, Some(limit))
    }

    fn build(
        store: Arc<InMemoryTaskStore>,
        graph: Arc<DatasetGraph>,
        connector: ScriptedConnector,
        config: ExecutorConfig,
        limit: Option<usize>,
    ) -> Self {
        let connector = Arc::new(connector);
        let mut registry = ConnectorRegistry::new();
        registry
            .add_connector("shop_db", connector.clone(), limit)
            .expect("connection key is unique");

        let ctx = ExecutorContext::new(store.clone(), registry, config);
        let executor = Arc::new(TaskExecutor::new(ctx, graph));
        Self {
            store,
            connector,
            executor,
        }
    }

    pub async fn task(
        &self,
        request_id: Uuid,
        collection: &str,
        action: ActionType,
    ) -> RequestTask {
        let key = lethe::core::TaskKey::new(request_id, addr(collection), action);
        self.store
            .get_task_by_key(&key)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no {action} task for {collection}"))
    }

    /// Polls until the task reaches `status`. Panics after a second.
    pub async fn wait_for_task(
        &self,
        request_id: Uuid,
        collection: &str,
        action: ActionType,
        status: TaskStatus,
    ) -> RequestTask {
        for _ in 0..200 {
            let key = lethe::core::TaskKey::new(request_id, addr(collection), action);
            if let Some(task) = self.store.get_task_by_key(&key).await.unwrap() {
                if task.status() == status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{action} task for {collection} never reached {status}");
    }
}
