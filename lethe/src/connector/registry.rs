//! Connection-type registry.
//!
//! Connector implementations register a factory under a connection type
//! (`"postgres"`, `"salesforce"`, ...). Each configured connection names its
//! type and is instantiated once through that factory. Datasets refer to
//! connections by key.

use super::{ConnectionStatus, Connector, ConnectorError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

/// Builds a connector from its connection configuration.
pub type ConnectorFactory =
    Arc<dyn Fn(&ConnectionConfig) -> Result<Arc<dyn Connector>, ConnectorError> + Send + Sync>;

/// Concurrency limit used when neither the connection nor the registry sets one.
const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("connection '{key}' uses unregistered connection type '{connection_type}'")]
    UnknownConnectionType { key: String, connection_type: String },

    #[error("connection '{0}' is already configured")]
    DuplicateConnection(String),

    #[error("failed to instantiate connection '{key}'")]
    Factory {
        key: String,
        #[source]
        source: ConnectorError,
    },
}

/// Configuration of one external connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub key: String,
    pub connection_type: String,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    /// Maximum in-flight calls against this connection.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl ConnectionConfig {
    pub fn new(key: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            connection_type: connection_type.into(),
            secrets: BTreeMap::new(),
            max_concurrency: None,
        }
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }
}

// Secret values never reach logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("key", &self.key)
            .field("connection_type", &self.connection_type)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

/// A live connection: the connector plus its concurrency limiter.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub connector: Arc<dyn Connector>,
    pub limiter: Arc<Semaphore>,
}

struct Connection {
    connector: Arc<dyn Connector>,
    max_concurrency: Option<usize>,
    limiter: Arc<Semaphore>,
}

/// Maps connection types to factories and connection keys to live connectors.
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
    connections: HashMap<String, Connection>,
    default_concurrency: usize,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            connections: HashMap::new(),
            default_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Sets the concurrency limit for connections without their own.
    ///
    /// Limiters of connections already added are rebuilt, so call this before
    /// any connection is in use.
    pub fn with_default_concurrency(mut self, limit: usize) -> Self {
        self.default_concurrency = limit.max(1);
        for connection in self.connections.values_mut() {
            let limit = connection.max_concurrency.unwrap_or(self.default_concurrency);
            connection.limiter = Arc::new(Semaphore::new(limit));
        }
        self
    }

    /// Registers a factory for a connection type, replacing any previous one.
    pub fn register_type<F>(&mut self, connection_type: impl Into<String>, factory: F)
    where
        F: Fn(&ConnectionConfig) -> Result<Arc<dyn Connector>, ConnectorError>
            + Send
            + Sync
            + 'static,
    {
        let connection_type = connection_type.into();
        debug!(%connection_type, "registered connection type");
        self.factories.insert(connection_type, Arc::new(factory));
    }

    /// Instantiates a configured connection through its type's factory.
    pub fn add_connection(&mut self, config: &ConnectionConfig) -> Result<(), RegistryError> {
        if self.connections.contains_key(&config.key) {
            return Err(RegistryError::DuplicateConnection(config.key.clone()));
        }

        let factory = self.factories.get(&config.connection_type).ok_or_else(|| {
            RegistryError::UnknownConnectionType {
                key: config.key.clone(),
                connection_type: config.connection_type.clone(),
            }
        })?;

        let connector = factory(config).map_err(|source| RegistryError::Factory {
            key: config.key.clone(),
            source,
        })?;

        debug!(key = %config.key, connection_type = %config.connection_type, "added connection");
        self.insert(config.key.clone(), connector, config.max_concurrency);
        Ok(())
    }

    /// Registers an already built connector under `key`.
    pub fn add_connector(
        &mut self,
        key: impl Into<String>,
        connector: Arc<dyn Connector>,
        max_concurrency: Option<usize>,
    ) -> Result<(), RegistryError> {
        let key = key.into();
        if self.connections.contains_key(&key) {
            return Err(RegistryError::DuplicateConnection(key));
        }
        self.insert(key, connector, max_concurrency);
        Ok(())
    }

    fn insert(
        &mut self,
        key: String,
        connector: Arc<dyn Connector>,
        max_concurrency: Option<usize>,
    ) {
        let limit = max_concurrency.unwrap_or(self.default_concurrency).max(1);
        self.connections.insert(
            key,
            Connection {
                connector,
                max_concurrency,
                limiter: Arc::new(Semaphore::new(limit)),
            },
        );
    }

    /// Looks up the connection serving `key`.
    pub fn get(&self, key: &str) -> Option<ConnectionHandle> {
        let connection = self.connections.get(key)?;
        Some(ConnectionHandle {
            connector: connection.connector.clone(),
            limiter: connection.limiter.clone(),
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.connections.contains_key(key)
    }

    /// Probes the connection serving `key`, or `None` if no such connection exists.
    pub async fn test_connection(&self, key: &str) -> Option<ConnectionStatus> {
        let handle = self.get(key)?;
        Some(handle.connector.test_connection().await)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
