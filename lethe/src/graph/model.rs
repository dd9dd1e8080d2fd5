//! In-memory model of datasets, collections and fields.

use super::address::{CollectionAddress, FieldAddress, FieldPath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

/// Which way data flows along a reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceDirection {
    /// The referenced field feeds this one.
    From,
    /// This field feeds the referenced one.
    To,
    /// Either side can feed the other.
    #[default]
    Unspecified,
}

/// An outgoing reference from a field to a field of another collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldReference {
    pub target: FieldAddress,
    pub direction: ReferenceDirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    /// Sub-fields of an object or array field.
    pub fields: Vec<Field>,
    /// Identity label matched against request seeds, e.g. `"email"`.
    pub identity: Option<String>,
    pub primary_key: bool,
    pub data_categories: Vec<String>,
    pub references: Vec<FieldReference>,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_identity(mut self, label: impl Into<String>) -> Self {
        self.identity = Some(label.into());
        self
    }

    pub fn with_primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.data_categories.push(category.into());
        self
    }

    pub fn with_reference(mut self, target: FieldAddress, direction: ReferenceDirection) -> Self {
        self.references.push(FieldReference { target, direction });
        self
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }
}

/// A table or endpoint-equivalent grouping of fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub fields: Vec<Field>,
    /// Collections whose access tasks must finish before this one starts.
    pub after: BTreeSet<CollectionAddress>,
    /// Collections whose erasure tasks must finish before this one starts.
    pub erase_after: BTreeSet<CollectionAddress>,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_after(mut self, address: CollectionAddress) -> Self {
        self.after.insert(address);
        self
    }

    pub fn with_erase_after(mut self, address: CollectionAddress) -> Self {
        self.erase_after.insert(address);
        self
    }

    /// Every field, nested ones included, paired with its path. Depth-first
    /// in declaration order.
    pub fn all_fields(&self) -> Vec<(FieldPath, &Field)> {
        fn walk<'a>(
            prefix: Option<&FieldPath>,
            fields: &'a [Field],
            out: &mut Vec<(FieldPath, &'a Field)>,
        ) {
            for field in fields {
                let path = match prefix {
                    Some(prefix) => prefix.child(&field.name),
                    None => FieldPath::single(&field.name),
                };
                out.push((path.clone(), field));
                walk(Some(&path), &field.fields, out);
            }
        }

        let mut out = Vec::new();
        walk(None, &self.fields, &mut out);
        out
    }

    /// Looks up a nested field by path.
    pub fn field(&self, path: &FieldPath) -> Option<&Field> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.iter().find(|f| &f.name == first)?;
        for segment in rest {
            current = current.fields.iter().find(|f| &f.name == segment)?;
        }
        Some(current)
    }

    /// Paths of fields carrying an identity label, with that label.
    pub fn identities(&self) -> Vec<(FieldPath, &str)> {
        self.all_fields()
            .into_iter()
            .filter_map(|(path, field)| field.identity.as_deref().map(|label| (path, label)))
            .collect()
    }

    pub fn primary_keys(&self) -> Vec<FieldPath> {
        self.all_fields()
            .into_iter()
            .filter(|(_, field)| field.primary_key)
            .map(|(path, _)| path)
            .collect()
    }

    /// Data category -> paths of the fields labelled with it.
    pub fn field_paths_by_category(&self) -> BTreeMap<String, Vec<FieldPath>> {
        let mut by_category: BTreeMap<String, Vec<FieldPath>> = BTreeMap::new();
        for (path, field) in self.all_fields() {
            for category in &field.data_categories {
                by_category
                    .entry(category.clone())
                    .or_default()
                    .push(path.clone());
            }
        }
        by_category
    }
}

/// A named set of collections served by one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphDataset {
    pub name: String,
    /// Key of the connection configuration that serves this dataset.
    pub connection_key: String,
    pub collections: Vec<Collection>,
    /// Datasets whose reachable collections all run before any collection here.
    pub after: BTreeSet<String>,
}

impl GraphDataset {
    pub fn new(name: impl Into<String>, connection_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_key: connection_key.into(),
            collections: Vec::new(),
            after: BTreeSet::new(),
        }
    }

    pub fn with_collection(mut self, collection: Collection) -> Self {
        self.collections.push(collection);
        self
    }

    pub fn with_after(mut self, dataset: impl Into<String>) -> Self {
        self.after.insert(dataset.into());
        self
    }

    pub fn address(&self, collection: &str) -> CollectionAddress {
        CollectionAddress::new(&self.name, collection)
    }
}

/// A collection placed in a graph. Compared and hashed by address only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    address: CollectionAddress,
    collection: Collection,
}

impl Node {
    pub fn new(address: CollectionAddress, collection: Collection) -> Self {
        Self {
            address,
            collection,
        }
    }

    pub fn address(&self) -> &CollectionAddress {
        &self.address
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn dataset(&self) -> &str {
        self.address.dataset()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}
