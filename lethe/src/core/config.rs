use super::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for a single connector call.
const DEFAULT_CONNECTOR_TIMEOUT_SECS: u64 = 30;

/// Default time a suspended task may wait for its external completion.
const DEFAULT_ASYNC_DEADLINE_SECS: u64 = 7 * 24 * 60 * 60;

/// Default number of in-flight calls per connection.
const DEFAULT_CONNECTOR_CONCURRENCY: usize = 4;

/// Default time a claimed task may run before it counts as abandoned.
const DEFAULT_CLAIM_LEASE_SECS: u64 = 15 * 60;

/// Default number of privacy requests a worker drives at once.
const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 8;

/// What happens to the downstream closure of a task that ends in `error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownstreamFailurePolicy {
    /// Downstream tasks are marked `error` with a message naming the failed upstream.
    #[default]
    Error,
    /// Downstream tasks are marked `skipped`.
    Skip,
}

/// Configuration for the task executor and its worker.
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use lethe::core::ExecutorConfig;
///
/// let config: ExecutorConfig =
///     serde_json::from_str(r#"{ "masking_strict": false }"#).unwrap();
/// assert!(!config.masking_strict);
/// assert_eq!(config.default_connector_concurrency, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Retry policy applied to every connector call.
    pub retry_policy: RetryPolicy,
    /// Upper bound on a single connector call.
    pub connector_timeout: Duration,
    /// How long a suspended task waits before it is forced to `error`.
    pub async_deadline: Duration,
    /// Fail erasure tasks that target a field without a masking strategy.
    pub masking_strict: bool,
    /// Concurrency limit for connections that do not set their own.
    pub default_connector_concurrency: usize,
    /// Number of privacy requests the worker resumes concurrently.
    pub max_concurrent_requests: usize,
    pub downstream_failure: DownstreamFailurePolicy,
    /// Sleep between empty queue polls in the worker.
    pub queue_poll_interval: Duration,
    /// How long a task may stay claimed before it is assumed to belong to a
    /// crashed run and is released back to `pending`.
    ///
    /// Must exceed the longest connector call including all retries, or a
    /// live call can be released and run a second time.
    pub claim_lease: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            connector_timeout: Duration::from_secs(DEFAULT_CONNECTOR_TIMEOUT_SECS),
            async_deadline: Duration::from_secs(DEFAULT_ASYNC_DEADLINE_SECS),
            masking_strict: true,
            default_connector_concurrency: DEFAULT_CONNECTOR_CONCURRENCY,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            downstream_failure: DownstreamFailurePolicy::Error,
            queue_poll_interval: Duration::from_millis(100),
            claim_lease: Duration::from_secs(DEFAULT_CLAIM_LEASE_SECS),
        }
    }
}

impl ExecutorConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_connector_timeout(mut self, timeout: Duration) -> Self {
        self.connector_timeout = timeout;
        self
    }

    pub fn with_async_deadline(mut self, deadline: Duration) -> Self {
        self.async_deadline = deadline;
        self
    }

    pub fn with_masking_strict(mut self, strict: bool) -> Self {
        self.masking_strict = strict;
        self
    }

    pub fn with_default_connector_concurrency(mut self, limit: usize) -> Self {
        self.default_connector_concurrency = limit.max(1);
        self
    }

    pub fn with_max_concurrent_requests(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }

    pub fn with_downstream_failure(mut self, policy: DownstreamFailurePolicy) -> Self {
        self.downstream_failure = policy;
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }
}
