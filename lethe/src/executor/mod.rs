//! Execution of planned privacy requests.
//!
//! - [`TaskExecutor`]: materializes task rows from a plan and drives them
//!   through their connectors, access phase first, then erasure
//! - [`AsyncCoordinator`]: suspension of tasks whose connector answers
//!   asynchronously, their out-of-band completion and deadline expiry
//! - [`Worker`]: dequeues requests that became runnable again and resumes them
//! - [`MaskingPlan`]: which fields of a collection an erasure overwrites, and how
//! - [`ExecutionSummary`]: the outcome of a request derived from its task rows
//!
//! Every decision the executor makes is read back from the
//! [`TaskStore`](crate::storage::TaskStore), so any executor sharing the
//! store can pick up a request where another one stopped.

mod async_coordinator;
mod context;
mod error;
mod inputs;
mod masking;
mod summary;
mod task_executor;
mod worker;

pub use async_coordinator::{AsyncCoordinator, AsyncPayload, CompletionOutcome, Suspension};
pub use context::ExecutorContext;
pub use error::{ExecutionError, Result};
pub use inputs::identity_inputs;
pub use masking::{MaskTarget, MaskingError, MaskingPlan};
pub use summary::{ExecutionSummary, PhaseSummary, RequestOutcome};
pub use task_executor::TaskExecutor;
pub use worker::{Worker, WorkerHandle};
