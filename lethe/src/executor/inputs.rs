//! Identity inputs for access tasks.
//!
//! A root collection is queried with the request's seed values. Every other
//! collection is queried with values read from its upstream collections'
//! rows along the inbound edges of the plan.

use crate::connector::ConnectorInputs;
use crate::core::Row;
use crate::graph::CollectionAddress;
use crate::traversal::TaskDescriptor;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Builds the inputs for one access task.
///
/// Nulls are dropped, arrays contribute their elements, and each field's
/// values are deduplicated in first-seen order.
pub fn identity_inputs(
    descriptor: &TaskDescriptor,
    seeds: &BTreeMap<String, Value>,
    upstream_rows: &HashMap<CollectionAddress, &[Row]>,
) -> ConnectorInputs {
    let mut inputs = ConnectorInputs::new();

    for (path, label) in &descriptor.seed_fields {
        if let Some(value) = seeds.get(label) {
            push_values(inputs.entry(path.clone()).or_default(), value);
        }
    }

    for edge in &descriptor.inbound_edges {
        let Some(rows) = upstream_rows.get(edge.source.collection_address()) else {
            continue;
        };
        let values = inputs.entry(edge.target.clone()).or_default();
        for row in rows.iter() {
            if let Some(value) = edge.source.path().lookup(row) {
                push_values(values, value);
            }
        }
    }

    inputs.retain(|_, values| !values.is_empty());
    inputs
}

fn push_values(values: &mut Vec<Value>, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => items.iter().for_each(|item| push_values(values, item)),
        other => {
            if !values.contains(other) {
                values.push(other.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{FieldAddress, FieldPath};
    use crate::traversal::InputEdge;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_seed_and_upstream_values() {
        let customers = CollectionAddress::new("shop", "customers");
        let descriptor = TaskDescriptor {
            address: CollectionAddress::new("shop", "orders"),
            upstream: vec![customers.clone()],
            downstream: vec![],
            inbound_edges: vec![InputEdge {
                source: FieldAddress::new("shop", "customers", FieldPath::single("id")),
                target: FieldPath::single("customer_id"),
            }],
            seed_fields: vec![(FieldPath::single("email"), "email".to_string())],
        };

        let seeds = BTreeMap::from([("email".to_string(), json!("a@example.com"))]);
        let customer_rows = rows(vec![
            json!({ "id": 1 }),
            json!({ "id": 2 }),
            json!({ "id": 1 }),
            json!({ "id": null }),
            json!({ "name": "no id" }),
        ]);
        let upstream = HashMap::from([(customers, customer_rows.as_slice())]);

        let inputs = identity_inputs(&descriptor, &seeds, &upstream);
        assert_eq!(inputs[&FieldPath::single("email")], vec![json!("a@example.com")]);
        assert_eq!(inputs[&FieldPath::single("customer_id")], vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_empty_upstream_yields_no_inputs() {
        let customers = CollectionAddress::new("shop", "customers");
        let descriptor = TaskDescriptor {
            address: CollectionAddress::new("shop", "orders"),
            upstream: vec![customers.clone()],
            downstream: vec![],
            inbound_edges: vec![InputEdge {
                source: FieldAddress::new(
                    "shop",
                    "customers",
                    FieldPath::parse("profile.ids").unwrap(),
                ),
                target: FieldPath::single("customer_id"),
            }],
            seed_fields: vec![],
        };

        let empty: Vec<Row> = Vec::new();
        let upstream = HashMap::from([(customers.clone(), empty.as_slice())]);
        assert!(identity_inputs(&descriptor, &BTreeMap::new(), &upstream).is_empty());

        let nested = rows(vec![json!({ "profile": { "ids": [7, 8, 7] } })]);
        let upstream = HashMap::from([(customers, nested.as_slice())]);
        let inputs = identity_inputs(&descriptor, &BTreeMap::new(), &upstream);
        assert_eq!(inputs[&FieldPath::single("customer_id")], vec![json!(7), json!(8)]);
    }
}
