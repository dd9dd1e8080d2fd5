//! Edges between fields of different collections.

use super::address::{CollectionAddress, FieldAddress};
use super::error::{GraphError, GraphResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A connection between two fields of different collections.
///
/// A directed edge carries values from `from` to `to`. A bidirectional edge
/// carries them either way; it is stored with the smaller address first, so
/// `(a, b)` and `(b, a)` produce the same value and the derived `Eq`, `Hash`
/// and `Ord` are symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Edge {
    Directed { from: FieldAddress, to: FieldAddress },
    Bidirectional { a: FieldAddress, b: FieldAddress },
}

impl Edge {
    /// Creates a directed edge. Fails if both ends share a collection.
    pub fn directed(from: FieldAddress, to: FieldAddress) -> GraphResult<Self> {
        check_distinct(&from, &to)?;
        Ok(Edge::Directed { from, to })
    }

    /// Creates a bidirectional edge in canonical form. Fails if both ends
    /// share a collection.
    pub fn bidirectional(first: FieldAddress, second: FieldAddress) -> GraphResult<Self> {
        check_distinct(&first, &second)?;
        let (a, b) = if first <= second {
            (first, second)
        } else {
            (second, first)
        };
        Ok(Edge::Bidirectional { a, b })
    }

    /// Both ends, in stored order.
    pub fn ends(&self) -> (&FieldAddress, &FieldAddress) {
        match self {
            Edge::Directed { from, to } => (from, to),
            Edge::Bidirectional { a, b } => (a, b),
        }
    }

    /// If values can flow out of `collection` along this edge, returns
    /// `(local field, remote field)`.
    pub fn outbound_from(
        &self,
        collection: &CollectionAddress,
    ) -> Option<(&FieldAddress, &FieldAddress)> {
        match self {
            Edge::Directed { from, to } if from.collection_address() == collection => {
                Some((from, to))
            }
            Edge::Directed { .. } => None,
            Edge::Bidirectional { a, b } if a.collection_address() == collection => Some((a, b)),
            Edge::Bidirectional { a, b } if b.collection_address() == collection => Some((b, a)),
            Edge::Bidirectional { .. } => None,
        }
    }
}

fn check_distinct(first: &FieldAddress, second: &FieldAddress) -> GraphResult<()> {
    if first.collection_address() == second.collection_address() {
        return Err(GraphError::self_reference(first.clone(), second.clone()));
    }
    Ok(())
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Directed { from, to } => write!(f, "{from} -> {to}"),
            Edge::Bidirectional { a, b } => write!(f, "{a} <-> {b}"),
        }
    }
}
