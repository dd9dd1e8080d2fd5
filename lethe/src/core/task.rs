use super::error::{CoreError, Result};
use crate::graph::CollectionAddress;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A single record returned by a connector.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// The kind of work a request task performs against its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Access,
    Erasure,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Access => "access",
            ActionType::Erasure => "erasure",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "access" => Ok(ActionType::Access),
            "erasure" => Ok(ActionType::Erasure),
            _ => Err(CoreError::InvalidAction(s.to_string())),
        }
    }
}

/// How a suspended task expects to learn about its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncType {
    /// The third party calls back with the result.
    Callback,
    /// Something outside the executor polls the third party and reports back.
    Polling,
}

impl AsyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncType::Callback => "callback",
            AsyncType::Polling => "polling",
        }
    }
}

/// Status of a request task.
///
/// ```text
/// pending ──> in_processing ──> complete | error | skipped
///    │             │
///    └──> paused / requires_input ──> pending
/// ```
///
/// A task that is `InProcessing` with a non-null `async_type` is suspended
/// awaiting an external completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProcessing,
    Complete,
    Error,
    Skipped,
    Paused,
    RequiresInput,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProcessing => "in_processing",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Paused => "paused",
            TaskStatus::RequiresInput => "requires_input",
        }
    }

    /// Terminal for the current execution attempt of the request.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Skipped
        )
    }

    /// Whether a downstream task may start once its upstream is in this status.
    pub fn satisfies_downstream(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Skipped)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    ///
    /// Setting the same status again is always allowed; it is how suspended
    /// tasks record their `async_type` without changing status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        if *self == next {
            return true;
        }

        match self {
            Pending => matches!(next, InProcessing | Skipped | Error | Paused | RequiresInput),
            InProcessing => matches!(
                next,
                Complete | Error | Skipped | Paused | RequiresInput | Pending
            ),
            Paused | RequiresInput => matches!(next, Pending | InProcessing),
            Error => next == Pending,
            Complete | Skipped => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_processing" => Ok(TaskStatus::InProcessing),
            "complete" => Ok(TaskStatus::Complete),
            "error" => Ok(TaskStatus::Error),
            "skipped" => Ok(TaskStatus::Skipped),
            "paused" => Ok(TaskStatus::Paused),
            "requires_input" => Ok(TaskStatus::RequiresInput),
            _ => Err(CoreError::InvalidStatus(s.to_string())),
        }
    }
}

/// The triple that identifies a request task: one row per key, ever.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub privacy_request_id: Uuid,
    pub collection: CollectionAddress,
    pub action: ActionType,
}

impl TaskKey {
    pub fn new(
        privacy_request_id: Uuid,
        collection: CollectionAddress,
        action: ActionType,
    ) -> Self {
        Self {
            privacy_request_id,
            collection,
            action,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.privacy_request_id, self.collection, self.action
        )
    }
}

/// Persisted execution state for one collection of one privacy request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestTask {
    id: Uuid,
    key: TaskKey,
    status: TaskStatus,
    upstream: Vec<CollectionAddress>,
    downstream: Vec<CollectionAddress>,
    /// Rows collected by an access task
    #[serde(default)]
    access_data: Option<Vec<Row>>,
    /// Rows affected by an erasure task
    #[serde(default)]
    rows_masked: Option<u64>,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    async_type: Option<AsyncType>,
    /// When a suspended task gives up waiting for its external completion
    #[serde(default)]
    async_deadline: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RequestTask {
    /// Creates a pending task for the given triple.
    pub fn new(
        key: TaskKey,
        upstream: Vec<CollectionAddress>,
        downstream: Vec<CollectionAddress>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            key,
            status: TaskStatus::Pending,
            upstream,
            downstream,
            access_data: None,
            rows_masked: None,
            attempts: 0,
            error_message: None,
            async_type: None,
            async_deadline: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn privacy_request_id(&self) -> Uuid {
        self.key.privacy_request_id
    }

    pub fn collection(&self) -> &CollectionAddress {
        &self.key.collection
    }

    pub fn action(&self) -> ActionType {
        self.key.action
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn upstream(&self) -> &[CollectionAddress] {
        &self.upstream
    }

    pub fn downstream(&self) -> &[CollectionAddress] {
        &self.downstream
    }

    pub fn access_data(&self) -> Option<&[Row]> {
        self.access_data.as_deref()
    }

    pub fn rows_masked(&self) -> Option<u64> {
        self.rows_masked
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn async_type(&self) -> Option<AsyncType> {
        self.async_type
    }

    pub fn async_deadline(&self) -> Option<DateTime<Utc>> {
        self.async_deadline
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// In processing and waiting on an external completion.
    pub fn is_suspended(&self) -> bool {
        self.status == TaskStatus::InProcessing && self.async_type.is_some()
    }

    /// Returns true if the suspension deadline has passed at `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_suspended() && self.async_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Claimed for a connector call, and last written at or before `cutoff`.
    ///
    /// Every write stamps `updated_at`, so for a claimed task it is the time
    /// of the claim.
    pub fn is_stale_claim(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == TaskStatus::InProcessing
            && self.async_type.is_none()
            && self.updated_at <= cutoff
    }

    /// Applies an update, enforcing the status state machine.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<()> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(CoreError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
        }

        if let Some(rows) = update.access_data {
            self.access_data = Some(rows);
        }
        if let Some(count) = update.rows_masked {
            self.rows_masked = Some(count);
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(message) = update.error_message {
            self.error_message = message;
        }
        if let Some(async_type) = update.async_type {
            self.async_type = async_type;
        }
        if let Some(deadline) = update.async_deadline {
            self.async_deadline = deadline;
        }

        self.updated_at = Utc::now();
        Ok(())
    }
}

/// A partial change to a [`RequestTask`], applied atomically by the store.
///
/// Fields left as `None` are not touched. The nested options distinguish
/// "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub access_data: Option<Vec<Row>>,
    pub rows_masked: Option<u64>,
    pub attempts: Option<u32>,
    pub error_message: Option<Option<String>>,
    pub async_type: Option<Option<AsyncType>>,
    pub async_deadline: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Successful access result.
    pub fn retrieved(rows: Vec<Row>) -> Self {
        Self {
            status: Some(TaskStatus::Complete),
            access_data: Some(rows),
            error_message: Some(None),
            async_type: Some(None),
            async_deadline: Some(None),
            ..Self::default()
        }
    }

    /// Successful erasure result.
    pub fn masked(count: u64) -> Self {
        Self {
            status: Some(TaskStatus::Complete),
            rows_masked: Some(count),
            error_message: Some(None),
            async_type: Some(None),
            async_deadline: Some(None),
            ..Self::default()
        }
    }

    /// Terminal failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Error),
            error_message: Some(Some(message.into())),
            async_type: Some(None),
            async_deadline: Some(None),
            ..Self::default()
        }
    }

    /// Suspension awaiting an external completion.
    pub fn suspended(async_type: AsyncType, deadline: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::InProcessing),
            async_type: Some(Some(async_type)),
            async_deadline: Some(Some(deadline)),
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }
}
