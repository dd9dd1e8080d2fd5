//! Privacy request records and their lifecycle status.
//!
//! The store keeps one record per privacy request next to its tasks. The
//! executor reads the status before every dispatch, which is how pause and
//! cancel take effect without interrupting in-flight connector calls.

use crate::core::{CoreError, Policy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lifecycle status of a privacy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Accepted, not yet picked up.
    Pending,
    /// An executor is driving its tasks.
    InProcessing,
    /// Dispatch halted by an operator; resumable.
    Paused,
    /// Dispatch halted for good.
    Canceled,
    /// At least one task is suspended on an external completion.
    AwaitingCallback,
    Complete,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProcessing => "in_processing",
            RequestStatus::Paused => "paused",
            RequestStatus::Canceled => "canceled",
            RequestStatus::AwaitingCallback => "awaiting_callback",
            RequestStatus::Complete => "complete",
            RequestStatus::Error => "error",
        }
    }

    /// Returns true if no new task may be dispatched for the request.
    pub fn halts_dispatch(&self) -> bool {
        matches!(self, RequestStatus::Paused | RequestStatus::Canceled)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "in_processing" => Ok(RequestStatus::InProcessing),
            "paused" => Ok(RequestStatus::Paused),
            "canceled" => Ok(RequestStatus::Canceled),
            "awaiting_callback" => Ok(RequestStatus::AwaitingCallback),
            "complete" => Ok(RequestStatus::Complete),
            "error" => Ok(RequestStatus::Error),
            _ => Err(CoreError::InvalidRequestStatus(s.to_string())),
        }
    }
}

/// A data subject access or erasure request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyRequest {
    pub id: Uuid,
    /// Identity seeds keyed by identity label, e.g. `"email"`.
    pub identities: BTreeMap<String, Value>,
    pub policy: Policy,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrivacyRequest {
    /// Creates a pending request with a fresh id.
    pub fn new(policy: Policy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identities: BTreeMap::new(),
            policy,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_identity(mut self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        self.identities.insert(label.into(), value.into());
        self
    }

    /// Returns true if the request has reached a final outcome.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            RequestStatus::Complete | RequestStatus::Error | RequestStatus::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_request_status_strings() {
        assert_eq!(
            RequestStatus::from_str("awaiting_callback").unwrap(),
            RequestStatus::AwaitingCallback
        );
        assert_eq!(RequestStatus::Canceled.to_string(), "canceled");
        assert!(RequestStatus::from_str("stopped").is_err());
    }

    #[test]
    fn test_halts_dispatch() {
        assert!(RequestStatus::Paused.halts_dispatch());
        assert!(RequestStatus::Canceled.halts_dispatch());
        assert!(!RequestStatus::AwaitingCallback.halts_dispatch());
    }

    #[test]
    fn test_identity_builder() {
        let request = PrivacyRequest::new(Policy::new("default"))
            .with_identity("email", "jane@example.com");
        assert_eq!(request.status, RequestStatus::Pending);
        assert_eq!(
            request.identities.get("email"),
            Some(&Value::from("jane@example.com"))
        );
    }
}
