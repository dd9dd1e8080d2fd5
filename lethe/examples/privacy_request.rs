//! Privacy Request Walkthrough
//!
//! This example demonstrates:
//! - Loading dataset definitions from JSON and building the dataset graph
//! - Registering connection types and connections
//! - Planning access and erasure for an email address
//! - A connector that answers asynchronously, completed out of band
//! - A worker resuming the request once the callback arrives
//!
//! ## Scenario
//! Jane asks to have her data erased. Her customer record and orders live in
//! the shop database; a support ticket lives in a SaaS helpdesk that exports
//! data through a callback.
//!
//! ## Run with
//! ```bash
//! RUST_LOG=lethe=debug cargo run --example privacy_request
//! ```

use lethe::prelude::*;
use lethe::serde_json::{self, json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DATASETS: &str = r#"[
  {
    "name": "shop",
    "connection_key": "shop_db",
    "collections": [
      { "name": "customers", "erase_after": ["shop.orders"], "fields": [
        { "name": "id", "primary_key": true },
        { "name": "email", "identity": "email", "data_categories": ["user.contact.email"] },
        { "name": "name", "data_categories": ["user.name"] }
      ]},
      { "name": "orders", "fields": [
        { "name": "id", "primary_key": true },
        { "name": "customer_id",
          "references": [{ "field": "shop.customers.id", "direction": "from" }] },
        { "name": "shipping", "fields": [
          { "name": "street", "data_categories": ["user.contact.address"] },
          { "name": "city", "data_categories": ["user.contact.address"] }
        ]}
      ]}
    ]
  },
  {
    "name": "helpdesk",
    "connection_key": "helpdesk_api",
    "after": ["shop"],
    "collections": [
      { "name": "tickets", "fields": [
        { "name": "id", "primary_key": true },
        { "name": "requester", "data_categories": ["user.contact.email"],
          "references": [{ "field": "shop.customers.email", "direction": "from" }] },
        { "name": "body", "data_categories": ["user.content"] }
      ]}
    ]
  }
]"#;

/// Serves rows from a fixture table keyed by collection name.
struct FixtureConnector {
    tables: HashMap<String, Vec<Row>>,
}

#[async_trait]
impl Connector for FixtureConnector {
    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus::Succeeded
    }

    async fn retrieve_data(
        &self,
        ctx: &ConnectorContext,
        inputs: &ConnectorInputs,
    ) -> Result<ConnectorOutcome<Vec<Row>>, ConnectorError> {
        let rows = self
            .tables
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
        Ok(ConnectorOutcome::Ready(rows))
    }

    async fn mask_data(
        &self,
        ctx: &ConnectorContext,
        masking: &MaskingPlan,
        rows: &[Row],
    ) -> Result<ConnectorOutcome<u64>, ConnectorError> {
        let mut masked = 0;
        for row in rows {
            if let Some(rewritten) = masking.apply(row) {
                println!(
                    "  masked {} {:?}: {}",
                    ctx.address,
                    ctx.primary_key_of(row),
                    Value::Object(rewritten)
                );
                masked += 1;
            }
        }
        Ok(ConnectorOutcome::Ready(masked))
    }
}

/// A helpdesk that exports data by calling back later.
struct CallbackConnector;

#[async_trait]
impl Connector for CallbackConnector {
    async fn retrieve_data(
        &self,
        ctx: &ConnectorContext,
        _inputs: &ConnectorInputs,
    ) -> Result<ConnectorOutcome<Vec<Row>>, ConnectorError> {
        println!("  helpdesk export started for task {}", ctx.task_id);
        Ok(ConnectorOutcome::AwaitingAsync(AsyncType::Callback))
    }

    async fn mask_data(
        &self,
        _ctx: &ConnectorContext,
        _masking: &MaskingPlan,
        rows: &[Row],
    ) -> Result<ConnectorOutcome<u64>, ConnectorError> {
        Ok(ConnectorOutcome::Ready(rows.len() as u64))
    }
}

fn shop_tables() -> HashMap<String, Vec<Row>> {
    let table = |rows: Value| -> Vec<Row> {
        rows.as_array()
            .into_iter()
            .flatten()
            .filter_map(|row| row.as_object().cloned())
            .collect()
    };
    HashMap::from([
        (
            "customers".to_string(),
            table(json!([
                { "id": 1, "email": "jane@example.com", "name": "Jane" },
                { "id": 2, "email": "john@example.com", "name": "John" }
            ])),
        ),
        (
            "orders".to_string(),
            table(json!([
                {
                    "id": 10,
                    "customer_id": 1,
                    "shipping": { "street": "1 Main St", "city": "Springfield" }
                },
                {
                    "id": 11,
                    "customer_id": 2,
                    "shipping": { "street": "2 Elm St", "city": "Shelbyville" }
                }
            ])),
        ),
    ])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lethe=info")),
        )
        .init();

    let definitions: Vec<DatasetDefinition> = serde_json::from_str(DATASETS)?;
    let datasets = definitions
        .iter()
        .map(GraphDataset::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    let graph = Arc::new(DatasetGraph::build(&datasets)?);

    let mut registry = ConnectorRegistry::new();
    registry.register_type("fixture", |_config: &ConnectionConfig| {
        Ok(Arc::new(FixtureConnector {
            tables: shop_tables(),
        }) as Arc<dyn Connector>)
    });
    registry.register_type("helpdesk", |_config: &ConnectionConfig| {
        Ok(Arc::new(CallbackConnector) as Arc<dyn Connector>)
    });
    registry.add_connection(&ConnectionConfig::new("shop_db", "fixture").with_max_concurrency(2))?;
    registry.add_connection(
        &ConnectionConfig::new("helpdesk_api", "helpdesk").with_secret("api_token", "s3cr3t"),
    )?;
    println!("shop_db: {:?}", registry.test_connection("shop_db").await);

    let store = Arc::new(InMemoryTaskStore::new());
    let config = ExecutorConfig::default().with_async_deadline(Duration::from_secs(60));
    let ctx = ExecutorContext::new(store.clone(), registry, config);
    let executor = Arc::new(TaskExecutor::new(ctx, graph));

    let policy = Policy::new("erase_everything")
        .with_rule(Rule::access("export", &["user"]))
        .with_rule(Rule::erasure(
            "pseudonymize",
            &["user.contact.email"],
            Some(MaskingStrategy::Hash {
                salt: "pepper".into(),
            }),
        ))
        .with_rule(Rule::erasure("forget", &["user"], Some(MaskingStrategy::NullRewrite)));
    let request = PrivacyRequest::new(policy).with_identity("email", "jane@example.com");
    let request_id = request.id;

    let (access, erasure) = executor.plan(&request)?;
    println!("\naccess plan:\n{}", access.to_dot());
    if let Some(erasure) = &erasure {
        println!("erasure plan:\n{}", erasure.to_dot());
    }

    println!("submitting request {request_id}");
    let summary = executor.submit(request).await?;
    println!("after first pass: {:?}\n", summary.outcome);

    let worker = Worker::new(executor.clone(), "worker-1").start();

    // The helpdesk calls back with the exported ticket
    let ticket = store
        .tasks_for_request(request_id, Some(ActionType::Access))
        .await?
        .into_iter()
        .find(|task| task.is_suspended())
        .ok_or("no suspended helpdesk task")?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let rows = vec![json!({
        "id": 7,
        "requester": "jane@example.com",
        "body": "Where is my parcel?"
    })]
        .into_iter()
        .filter_map(|row| row.as_object().cloned())
        .collect();
    let outcome = executor
        .coordinator()
        .complete(ticket.id(), AsyncPayload::Rows(rows))
        .await?;
    println!("callback recorded: {outcome:?}");

    let mut summary = executor.summary(request_id).await?;
    for _ in 0..50 {
        if store
            .get_request(request_id)
            .await?
            .is_some_and(|request| request.is_finished())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        summary = executor.summary(request_id).await?;
    }
    worker.shutdown().await;

    println!("\nfinal summary:\n{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
