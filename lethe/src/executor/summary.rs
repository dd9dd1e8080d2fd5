use crate::core::{ActionType, RequestTask, TaskStatus};
use crate::storage::RequestStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a privacy request stands, derived from its task rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RequestOutcome {
    /// At least one task ended in `error`.
    Error,
    /// At least one task is suspended on an external completion.
    AwaitingCallback,
    Paused,
    Canceled,
    /// Work remains that no halt or suspension explains, such as tasks owned
    /// by another dispatcher.
    InProgress,
    /// Every task finished. `rows_found == 0` means the subject has no data.
    Complete { rows_found: u64 },
}

impl RequestOutcome {
    /// The persisted request status for this outcome.
    pub fn request_status(&self) -> RequestStatus {
        match self {
            RequestOutcome::Error => RequestStatus::Error,
            RequestOutcome::AwaitingCallback => RequestStatus::AwaitingCallback,
            RequestOutcome::Paused => RequestStatus::Paused,
            RequestOutcome::Canceled => RequestStatus::Canceled,
            RequestOutcome::InProgress => RequestStatus::InProcessing,
            RequestOutcome::Complete { .. } => RequestStatus::Complete,
        }
    }
}

/// Task counts for one action of a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub total: usize,
    pub complete: usize,
    pub skipped: usize,
    pub error: usize,
    pub suspended: usize,
    /// Pending, paused, awaiting input, or running without suspension.
    pub remaining: usize,
    /// Rows retrieved (access) or rows masked (erasure).
    pub rows: u64,
}

impl PhaseSummary {
    fn record(&mut self, task: &RequestTask) {
        self.total += 1;
        match task.status() {
            TaskStatus::Complete => self.complete += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Error => self.error += 1,
            _ if task.is_suspended() => self.suspended += 1,
            _ => self.remaining += 1,
        }

        self.rows += match task.action() {
            ActionType::Access => task.access_data().map_or(0, |rows| rows.len() as u64),
            ActionType::Erasure => task.rows_masked().unwrap_or(0),
        };
    }

    /// Every task is `complete` or `skipped`.
    pub fn is_satisfied(&self) -> bool {
        self.complete + self.skipped == self.total
    }
}

/// Result of driving a request as far as it can currently go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub privacy_request_id: Uuid,
    pub outcome: RequestOutcome,
    pub access: PhaseSummary,
    pub erasure: PhaseSummary,
}

impl ExecutionSummary {
    /// Summarizes the task rows of a request whose persisted status is `status`.
    pub fn from_tasks(
        privacy_request_id: Uuid,
        status: RequestStatus,
        tasks: &[RequestTask],
    ) -> Self {
        let mut access = PhaseSummary::default();
        let mut erasure = PhaseSummary::default();
        for task in tasks {
            match task.action() {
                ActionType::Access => access.record(task),
                ActionType::Erasure => erasure.record(task),
            }
        }

        let outcome = if access.error + erasure.error > 0 {
            RequestOutcome::Error
        } else if access.suspended + erasure.suspended > 0 {
            RequestOutcome::AwaitingCallback
        } else if access.remaining + erasure.remaining > 0 {
            match status {
                RequestStatus::Paused => RequestOutcome::Paused,
                RequestStatus::Canceled => RequestOutcome::Canceled,
                _ => RequestOutcome::InProgress,
            }
        } else {
            RequestOutcome::Complete {
                rows_found: access.rows,
            }
        };

        Self {
            privacy_request_id,
            outcome,
            access,
            erasure,
        }
    }

    /// Number of tasks across both actions.
    pub fn total_tasks(&self) -> usize {
        self.access.total + self.erasure.total
    }
}
