//! Connector capability boundary.
//!
//! A [`Connector`] reads from and masks data in one external system. The
//! executor never talks to a third party directly: it resolves a dataset's
//! connection key through the [`ConnectorRegistry`] and calls the connector
//! under a timeout, a retry policy and the connection's concurrency limit.
//!
//! A connector that cannot answer synchronously returns
//! [`ConnectorOutcome::AwaitingAsync`]. The task is then suspended until the
//! result is delivered through the async coordinator.

use crate::core::{ActionType, AsyncType, Row};
use crate::executor::MaskingPlan;
use crate::graph::{Collection, CollectionAddress, FieldPath};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

mod error;
pub mod registry;

pub use error::ConnectorError;
pub use registry::{
    ConnectionConfig, ConnectionHandle, ConnectorFactory, ConnectorRegistry, RegistryError,
};

/// Identity values for an access call, keyed by the field of the collection
/// they are matched against.
pub type ConnectorInputs = BTreeMap<FieldPath, Vec<Value>>;

/// Result of a connector call that may complete later.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectorOutcome<T> {
    Ready(T),
    /// The third party will deliver the result out of band.
    AwaitingAsync(AsyncType),
}

/// Result of probing a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Succeeded,
    Failed(String),
    /// The connector has no way to probe its backend.
    Skipped,
}

/// What a connector is asked to work on.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub privacy_request_id: Uuid,
    pub task_id: Uuid,
    pub action: ActionType,
    pub address: CollectionAddress,
    /// Schema of the collection, for building queries and locating keys.
    pub collection: Collection,
    /// 1-indexed attempt number of this call.
    pub attempt: u32,
}

impl ConnectorContext {
    /// Primary key values of `row`, in schema order. Fields absent from the
    /// row are skipped.
    pub fn primary_key_of<'a>(&self, row: &'a Row) -> Vec<(FieldPath, &'a Value)> {
        self.collection
            .primary_keys()
            .into_iter()
            .filter_map(|path| path.lookup(row).map(|value| (path, value)))
            .collect()
    }
}

/// An external system holding personal data.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Checks that the backend is reachable with the configured secrets.
    async fn test_connection(&self) -> ConnectionStatus {
        ConnectionStatus::Skipped
    }

    /// Fetches the rows of `ctx.collection` matching any of `inputs`.
    async fn retrieve_data(
        &self,
        ctx: &ConnectorContext,
        inputs: &ConnectorInputs,
    ) -> Result<ConnectorOutcome<Vec<Row>>, ConnectorError>;

    /// Rewrites the targeted fields of `rows` and returns how many rows changed.
    ///
    /// `rows` are the access rows of the same collection. Replacement values
    /// come from [`MaskingPlan::apply`].
    async fn mask_data(
        &self,
        ctx: &ConnectorContext,
        masking: &MaskingPlan,
        rows: &[Row],
    ) -> Result<ConnectorOutcome<u64>, ConnectorError>;
}
