//! Serde schema for dataset definitions and its conversion into the model.
//!
//! ```
//! use lethe::graph::{DatasetDefinition, GraphDataset};
//!
//! let definition: DatasetDefinition = serde_json::from_str(r#"{
//!     "name": "shop",
//!     "connection_key": "shop_db",
//!     "collections": [
//!         { "name": "customer", "fields": [
//!             { "name": "id", "primary_key": true },
//!             { "name": "email", "identity": "email", "data_categories": ["user.contact.email"] }
//!         ]},
//!         { "name": "orders", "fields": [
//!             { "name": "customer_id",
//!               "references": [{ "field": "shop.customer.id", "direction": "from" }] }
//!         ]}
//!     ]
//! }"#).unwrap();
//!
//! let dataset = GraphDataset::try_from(&definition).unwrap();
//! assert_eq!(dataset.collections.len(), 2);
//! ```

use super::address::{CollectionAddress, FieldAddress};
use super::error::{GraphError, GraphResult};
use super::model::{Collection, Field, FieldReference, GraphDataset, ReferenceDirection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDefinition {
    pub name: String,
    pub connection_key: String,
    /// Names of datasets this one runs after.
    #[serde(default)]
    pub after: Vec<String>,
    pub collections: Vec<CollectionDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
    /// `dataset.collection` strings.
    #[serde(default)]
    pub after: Vec<String>,
    /// `dataset.collection` strings.
    #[serde(default)]
    pub erase_after: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub data_categories: Vec<String>,
    #[serde(default)]
    pub references: Vec<ReferenceDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceDefinition {
    /// `dataset.collection.field[.subfield...]`
    pub field: String,
    #[serde(default)]
    pub direction: Option<ReferenceDirection>,
}

impl TryFrom<&DatasetDefinition> for GraphDataset {
    type Error = GraphError;

    fn try_from(definition: &DatasetDefinition) -> GraphResult<Self> {
        let collections = definition
            .collections
            .iter()
            .map(Collection::try_from)
            .collect::<GraphResult<Vec<_>>>()?;

        Ok(GraphDataset {
            name: definition.name.clone(),
            connection_key: definition.connection_key.clone(),
            collections,
            after: definition.after.iter().cloned().collect(),
        })
    }
}

impl TryFrom<DatasetDefinition> for GraphDataset {
    type Error = GraphError;

    fn try_from(definition: DatasetDefinition) -> GraphResult<Self> {
        GraphDataset::try_from(&definition)
    }
}

impl TryFrom<&CollectionDefinition> for Collection {
    type Error = GraphError;

    fn try_from(definition: &CollectionDefinition) -> GraphResult<Self> {
        Ok(Collection {
            name: definition.name.clone(),
            fields: definition
                .fields
                .iter()
                .map(Field::try_from)
                .collect::<GraphResult<Vec<_>>>()?,
            after: parse_addresses(&definition.after)?,
            erase_after: parse_addresses(&definition.erase_after)?,
        })
    }
}

impl TryFrom<&FieldDefinition> for Field {
    type Error = GraphError;

    fn try_from(definition: &FieldDefinition) -> GraphResult<Self> {
        let references = definition
            .references
            .iter()
            .map(|reference| {
                Ok(FieldReference {
                    target: FieldAddress::parse(&reference.field)?,
                    direction: reference.direction.unwrap_or_default(),
                })
            })
            .collect::<GraphResult<Vec<_>>>()?;

        Ok(Field {
            name: definition.name.clone(),
            fields: definition
                .fields
                .iter()
                .map(Field::try_from)
                .collect::<GraphResult<Vec<_>>>()?,
            identity: definition.identity.clone(),
            primary_key: definition.primary_key,
            data_categories: definition.data_categories.clone(),
            references,
        })
    }
}

fn parse_addresses<B: FromIterator<CollectionAddress>>(values: &[String]) -> GraphResult<B> {
    values.iter().map(|v| CollectionAddress::parse(v)).collect()
}
