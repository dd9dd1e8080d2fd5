//! Addresses of collections and fields.
//!
//! Dataset definitions spell addresses with dots (`dataset.collection.field`);
//! they display with colons (`dataset:collection:field`) so the collection
//! boundary stays visible when the field path itself is dotted.

use super::error::{GraphError, GraphResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one collection within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionAddress {
    dataset: String,
    collection: String,
}

impl CollectionAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            collection: collection.into(),
        }
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Addresses the field at `path` in this collection.
    pub fn field(&self, path: FieldPath) -> FieldAddress {
        FieldAddress {
            collection: self.clone(),
            path,
        }
    }

    /// Parses `dataset.collection`.
    pub fn parse(value: &str) -> GraphResult<Self> {
        let mut parts = value.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(dataset), Some(collection), None)
                if !dataset.is_empty() && !collection.is_empty() =>
            {
                Ok(Self::new(dataset, collection))
            }
            _ => Err(GraphError::invalid_address(
                value,
                "expected 'dataset.collection'",
            )),
        }
    }
}

impl fmt::Display for CollectionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.collection)
    }
}

impl FromStr for CollectionAddress {
    type Err = GraphError;

    fn from_str(s: &str) -> GraphResult<Self> {
        Self::parse(s)
    }
}

/// A non-empty, ordered list of field names, e.g. `address.city`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> GraphResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() || segments.iter().any(String::is_empty) {
            return Err(GraphError::invalid_address(
                segments.join("."),
                "field path segments must be non-empty",
            ));
        }
        Ok(Self(segments))
    }

    /// A single-segment path.
    pub fn single(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn parse(value: &str) -> GraphResult<Self> {
        Self::new(value.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// The path extended by one more segment.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// Reads the value at this path from a row, descending into objects.
    pub fn lookup<'a>(&self, row: &'a crate::core::Row) -> Option<&'a serde_json::Value> {
        let (first, rest) = self.0.split_first()?;
        let mut current = row.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Identifies a possibly nested field of a collection.
///
/// Ordered by dataset, then collection, then path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldAddress {
    collection: CollectionAddress,
    path: FieldPath,
}

impl FieldAddress {
    pub fn new(dataset: impl Into<String>, collection: impl Into<String>, path: FieldPath) -> Self {
        Self {
            collection: CollectionAddress::new(dataset, collection),
            path,
        }
    }

    pub fn collection_address(&self) -> &CollectionAddress {
        &self.collection
    }

    pub fn path(&self) -> &FieldPath {
        &self.path
    }

    /// Parses `dataset.collection.field[.subfield...]`.
    pub fn parse(value: &str) -> GraphResult<Self> {
        let parts: Vec<&str> = value.split('.').collect();
        if parts.len() < 3 || parts[..2].iter().any(|p| p.is_empty()) {
            return Err(GraphError::invalid_address(
                value,
                "expected 'dataset.collection.field'",
            ));
        }
        let path = FieldPath::new(parts[2..].iter().copied())
            .map_err(|_| GraphError::invalid_address(value, "empty field segment"))?;
        Ok(Self::new(parts[0], parts[1], path))
    }
}

impl fmt::Display for FieldAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.collection, self.path)
    }
}

impl FromStr for FieldAddress {
    type Err = GraphError;

    fn from_str(s: &str) -> GraphResult<Self> {
        Self::parse(s)
    }
}
