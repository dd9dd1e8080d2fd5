//! Core types shared by every layer of lethe.
//!
//! # Domain Model
//! - [`RequestTask`]: persisted state of one (request, collection, action) triple
//! - [`TaskStatus`]: the task state machine
//! - [`ActionType`]: access or erasure
//! - [`Policy`]: rules, data categories and masking strategies
//!
//! # Configuration
//! - [`ExecutorConfig`]: timeouts, retry policy, concurrency limits, failure policy
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: how many attempts and how long to back off
//! - [`Retryable`]: which errors are transient
//! - See the [`retry`] module for details

pub mod config;
mod error;
pub mod policy;
pub mod retry;
mod task;

pub use config::{DownstreamFailurePolicy, ExecutorConfig};
pub use error::{CoreError, Result};
pub use policy::{category_matches, MaskingStrategy, Policy, Rule};
pub use retry::{retry_with_policy, RetryPolicy, Retryable};
pub use task::{ActionType, AsyncType, RequestTask, Row, TaskKey, TaskStatus, TaskUpdate};
