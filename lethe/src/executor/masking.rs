//! Derives which fields an erasure rewrites, and with what.

use crate::core::{MaskingStrategy, Policy, Row};
use crate::graph::{Collection, CollectionAddress, FieldPath};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MaskingError {
    /// An erasure rule targets the field but says nothing about how to rewrite it.
    #[error(
        "field {field} of {collection} (category '{category}') is targeted by erasure rule \
         '{rule}' which has no masking strategy"
    )]
    MissingStrategy {
        collection: CollectionAddress,
        field: FieldPath,
        category: String,
        rule: String,
    },

    #[error("erasure rule '{rule}' has an unusable masking strategy: {reason}")]
    InvalidStrategy { rule: String, reason: &'static str },
}

/// A field to rewrite and the rule that asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskTarget {
    pub path: FieldPath,
    pub category: String,
    pub rule: String,
    pub strategy: MaskingStrategy,
}

/// The rewrites an erasure applies to one collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaskingPlan {
    pub targets: Vec<MaskTarget>,
}

impl MaskingPlan {
    /// Matches every categorised field of `collection` against the policy's
    /// erasure rules.
    ///
    /// A field is targeted by the first of its categories that an erasure rule
    /// covers. If that rule has no masking strategy, `strict` turns this into
    /// an error; otherwise the field is left alone. A strategy that fails
    /// [`MaskingStrategy::check`] is always an error.
    pub fn for_collection(
        policy: &Policy,
        address: &CollectionAddress,
        collection: &Collection,
        strict: bool,
    ) -> Result<Self, MaskingError> {
        let mut targets = Vec::new();

        for (path, field) in collection.all_fields() {
            let matched = field.data_categories.iter().find_map(|category| {
                policy
                    .erasure_rule_for(category)
                    .map(|rule| (category, rule))
            });
            let Some((category, rule)) = matched else {
                continue;
            };

            match &rule.masking_strategy {
                Some(strategy) => {
                    strategy
                        .check()
                        .map_err(|reason| MaskingError::InvalidStrategy {
                            rule: rule.name.clone(),
                            reason,
                        })?;
                    targets.push(MaskTarget {
                        path,
                        category: category.clone(),
                        rule: rule.name.clone(),
                        strategy: strategy.clone(),
                    });
                }
                None if strict => {
                    return Err(MaskingError::MissingStrategy {
                        collection: address.clone(),
                        field: path,
                        category: category.clone(),
                        rule: rule.name.clone(),
                    })
                }
                None => {
                    warn!(
                        collection = %address,
                        field = %path,
                        rule = %rule.name,
                        "erasure rule has no masking strategy, field left unmasked"
                    );
                }
            }
        }

        Ok(Self { targets })
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The masked copy of `row`, or `None` if no targeted field is present.
    ///
    /// Nested paths descend through objects; an array on the way has every
    /// element masked.
    pub fn apply(&self, row: &Row) -> Option<Row> {
        let mut masked = row.clone();
        let mut changed = false;
        for target in &self.targets {
            let (first, rest) = match target.path.segments().split_first() {
                Some(split) => split,
                None => continue,
            };
            if let Some(value) = masked.get_mut(first) {
                changed |= mask_at(value, rest, &target.strategy);
            }
        }
        changed.then_some(masked)
    }
}

fn mask_at(value: &mut Value, rest: &[String], strategy: &MaskingStrategy) -> bool {
    match (rest.split_first(), value) {
        (_, Value::Array(items)) => items
            .iter_mut()
            .fold(false, |changed, item| mask_at(item, rest, strategy) | changed),
        (None, value) => {
            *value = strategy.mask(&*value);
            true
        }
        (Some((segment, rest)), Value::Object(map)) => match map.get_mut(segment) {
            Some(child) => mask_at(child, rest, strategy),
            None => false,
        },
        (Some(_), _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Rule;
    use crate::graph::Field;
    use serde_json::json;

    fn customer() -> Collection {
        Collection::new("customer")
            .with_field(Field::new("id").with_primary_key())
            .with_field(Field::new("email").with_category("user.contact.email"))
            .with_field(
                Field::new("address")
                    .with_field(Field::new("city").with_category("user.contact.address")),
            )
            .with_field(Field::new("notes").with_category("system.operations"))
    }

    fn address() -> CollectionAddress {
        CollectionAddress::new("shop", "customer")
    }

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_plan_targets_matching_fields() {
        let policy = Policy::new("erase").with_rule(Rule::erasure(
            "contact",
            &["user.contact"],
            Some(MaskingStrategy::NullRewrite),
        ));

        let plan = MaskingPlan::for_collection(&policy, &address(), &customer(), true).unwrap();
        let paths: Vec<String> = plan.targets.iter().map(|t| t.path.to_string()).collect();
        assert_eq!(paths, vec!["email", "address.city"]);
        assert!(plan.targets.iter().all(|t| t.rule == "contact"));
    }

    #[test]
    fn test_strict_rejects_missing_strategy() {
        let policy =
            Policy::new("erase").with_rule(Rule::erasure("contact", &["user.contact"], None));

        let err = MaskingPlan::for_collection(&policy, &address(), &customer(), true).unwrap_err();
        assert!(matches!(
            err,
            MaskingError::MissingStrategy { ref field, .. } if field.to_string() == "email"
        ));
        assert!(err.to_string().contains("shop:customer"));
    }

    #[test]
    fn test_lenient_skips_missing_strategy() {
        let policy = Policy::new("erase")
            .with_rule(Rule::erasure("email", &["user.contact.email"], None))
            .with_rule(Rule::erasure(
                "address",
                &["user.contact.address"],
                Some(MaskingStrategy::StringRewrite {
                    value: "MASKED".into(),
                }),
            ));

        let plan = MaskingPlan::for_collection(&policy, &address(), &customer(), false).unwrap();
        assert_eq!(plan.targets.len(), 1);
        assert_eq!(plan.targets[0].path.to_string(), "address.city");
    }

    #[test]
    fn test_unsalted_hash_is_rejected_even_when_lenient() {
        let policy = Policy::new("erase").with_rule(Rule::erasure(
            "pseudonymize",
            &["user.contact.email"],
            Some(MaskingStrategy::Hash {
                salt: String::new(),
            }),
        ));

        let err = MaskingPlan::for_collection(&policy, &address(), &customer(), false).unwrap_err();
        assert_eq!(
            err,
            MaskingError::InvalidStrategy {
                rule: "pseudonymize".into(),
                reason: "hash salt is empty",
            }
        );
    }

    #[test]
    fn test_apply_rewrites_nested_values() {
        let policy = Policy::new("erase").with_rule(Rule::erasure(
            "contact",
            &["user.contact"],
            Some(MaskingStrategy::NullRewrite),
        ));
        let plan = MaskingPlan::for_collection(&policy, &address(), &customer(), true).unwrap();

        let masked = plan
            .apply(&row(json!({
                "id": 1,
                "email": "a@example.com",
                "address": [{ "city": "Oslo" }, { "city": "Bergen" }],
                "notes": "vip"
            })))
            .unwrap();

        assert_eq!(
            Value::Object(masked),
            json!({
                "id": 1,
                "email": null,
                "address": [{ "city": null }, { "city": null }],
                "notes": "vip"
            })
        );

        assert!(plan.apply(&row(json!({ "id": 2, "notes": "x" }))).is_none());
    }
}
