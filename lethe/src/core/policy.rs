//! Privacy policies: which data categories a request touches and how
//! erasure rewrites them.
//!
//! Category matching is hierarchical. A rule targeting `user.contact` covers
//! a field labelled `user.contact.email`, but not one labelled `user.contactless`.

use super::task::ActionType;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha512};

/// How an erasure rewrites a targeted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MaskingStrategy {
    /// Replace with null.
    NullRewrite,
    /// Replace with a fixed string.
    StringRewrite { value: String },
    /// Replace with the hex SHA-512 of the salt followed by the original value.
    /// The salt must not be empty.
    Hash { salt: String },
    /// Replace with a random alphanumeric string of the given length.
    RandomString { length: usize },
}

impl MaskingStrategy {
    /// Why this strategy cannot be used, if it cannot.
    pub fn check(&self) -> Result<(), &'static str> {
        match self {
            MaskingStrategy::Hash { salt } if salt.is_empty() => Err("hash salt is empty"),
            _ => Ok(()),
        }
    }

    /// Produces the replacement for `value`.
    pub fn mask(&self, value: &Value) -> Value {
        match self {
            MaskingStrategy::NullRewrite => Value::Null,
            MaskingStrategy::StringRewrite { value } => Value::String(value.clone()),
            MaskingStrategy::Hash { salt } => {
                let mut hasher = Sha512::new();
                hasher.update(salt.as_bytes());
                match value {
                    Value::String(s) => hasher.update(s.as_bytes()),
                    other => hasher.update(other.to_string().as_bytes()),
                }
                Value::String(hex::encode(hasher.finalize()))
            }
            MaskingStrategy::RandomString { length } => {
                let out: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(*length)
                    .map(char::from)
                    .collect();
                Value::String(out)
            }
        }
    }
}

/// One rule of a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub action: ActionType,
    /// Dotted data categories this rule targets.
    pub data_categories: Vec<String>,
    /// Required for erasure rules to actually rewrite anything.
    #[serde(default)]
    pub masking_strategy: Option<MaskingStrategy>,
}

impl Rule {
    pub fn access(name: impl Into<String>, categories: &[&str]) -> Self {
        Self {
            name: name.into(),
            action: ActionType::Access,
            data_categories: categories.iter().map(|c| c.to_string()).collect(),
            masking_strategy: None,
        }
    }

    pub fn erasure(
        name: impl Into<String>,
        categories: &[&str],
        masking_strategy: Option<MaskingStrategy>,
    ) -> Self {
        Self {
            name: name.into(),
            action: ActionType::Erasure,
            data_categories: categories.iter().map(|c| c.to_string()).collect(),
            masking_strategy,
        }
    }

    /// Returns true if any of this rule's categories covers `field_category`.
    pub fn targets(&self, field_category: &str) -> bool {
        self.data_categories
            .iter()
            .any(|rule_category| category_matches(rule_category, field_category))
    }
}

/// A named set of rules applied to a privacy request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Policy {
    pub key: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules_for(&self, action: ActionType) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(move |rule| rule.action == action)
    }

    pub fn has_erasure_rules(&self) -> bool {
        self.rules_for(ActionType::Erasure).next().is_some()
    }

    /// The first erasure rule, in declaration order, that targets `field_category`.
    pub fn erasure_rule_for(&self, field_category: &str) -> Option<&Rule> {
        self.rules_for(ActionType::Erasure)
            .find(|rule| rule.targets(field_category))
    }
}

/// Hierarchical category match on dot boundaries.
pub fn category_matches(rule_category: &str, field_category: &str) -> bool {
    field_category == rule_category
        || field_category
            .strip_prefix(rule_category)
            .is_some_and(|rest| rest.starts_with('.'))
}
