//! Queue-driven request worker.
//!
//! Requests land on the store's queue when an async completion arrives, a
//! suspended task expires, or a claim outlives its lease. The worker dequeues
//! them and calls [`TaskExecutor::resume`], bounded by
//! `max_concurrent_requests`. A periodic sweep expires overdue suspensions
//! and releases claims left behind by a crashed run.
//!
//! # Example
//!
//! ```no_run
//! use lethe::executor::{TaskExecutor, Worker};
//! use std::sync::Arc;
//!
//! # async fn example(executor: Arc<TaskExecutor>) {
//! let handle = Worker::new(executor, "worker-1").start();
//! // ...
//! handle.shutdown().await;
//! # }
//! ```

use super::task_executor::TaskExecutor;
use crate::storage::StorageError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Default interval between sweeps for overdue suspensions and stale claims.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct Worker {
    executor: Arc<TaskExecutor>,
    worker_id: String,
    poll_interval: Duration,
    sweep_interval: Duration,
    max_concurrent_requests: Arc<Semaphore>,
}

impl Worker {
    /// Creates a worker using the executor's configured poll interval and
    /// request concurrency.
    pub fn new(executor: Arc<TaskExecutor>, worker_id: impl Into<String>) -> Self {
        let config = executor.context().config();
        let poll_interval = config.queue_poll_interval;
        let max_concurrent_requests =
            Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));

        Self {
            executor,
            worker_id: worker_id.into(),
            poll_interval,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_concurrent_requests,
        }
    }

    /// Sets the sleep between empty queue polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how often suspension deadlines and claim leases are checked.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Limits how many requests are resumed at the same time.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Starts the worker in the background.
    pub fn start(self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let worker_token = cancellation_token.clone();
        let worker_id = self.worker_id.clone();

        info!(worker_id = %self.worker_id, "starting worker");
        let handle = tokio::spawn(self.run(worker_token));

        WorkerHandle {
            worker_id,
            handle,
            cancellation_token,
        }
    }

    async fn sweep(&self) {
        let now = Utc::now();
        let worker_id = &self.worker_id;

        match self.executor.coordinator().expire_overdue(now).await {
            Ok(expired) if !expired.is_empty() => {
                info!(%worker_id, count = expired.len(), "expired overdue suspensions");
            }
            Ok(_) => {}
            Err(e) => warn!(%worker_id, error = %e, "deadline sweep failed"),
        }

        match self.executor.requeue_stale_claims(now).await {
            Ok(requests) if !requests.is_empty() => {
                info!(%worker_id, count = requests.len(), "requeued requests with stale claims");
            }
            Ok(_) => {}
            Err(e) => warn!(%worker_id, error = %e, "claim sweep failed"),
        }
    }

    async fn run(self, token: CancellationToken) {
        let store = self.executor.context().store().clone();
        let mut active: JoinSet<()> = JoinSet::new();
        let mut next_sweep = Instant::now();

        loop {
            if token.is_cancelled() {
                info!(worker_id = %self.worker_id, "worker received shutdown signal");
                break;
            }

            while let Some(result) = active.try_join_next() {
                if let Err(e) = result {
                    error!(worker_id = %self.worker_id, error = %e, "request task panicked");
                }
            }

            if Instant::now() >= next_sweep {
                self.sweep().await;
                next_sweep = Instant::now() + self.sweep_interval;
            }

            let request_id = match store.dequeue_request().await {
                Ok(Some(request_id)) => request_id,
                Ok(None) => {
                    match store.work_notify() {
                        Some(notify) => tokio::select! {
                            _ = token.cancelled() => {}
                            _ = notify.notified() => {}
                            _ = tokio::time::sleep(self.poll_interval) => {}
                        },
                        None => tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(self.poll_interval) => {}
                        },
                    }
                    continue;
                }
                Err(StorageError::QueueClosed) => {
                    info!(worker_id = %self.worker_id, "request queue closed");
                    break;
                }
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "failed to dequeue request");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            let permit = tokio::select! {
                permit = self.max_concurrent_requests.clone().acquire_owned() => permit,
                _ = token.cancelled() => {
                    // Hand the request back for whoever runs next
                    if let Err(e) = store.enqueue_request(request_id).await {
                        warn!(%request_id, error = %e, "failed to re-enqueue request on shutdown");
                    }
                    break;
                }
            };
            let Ok(permit) = permit else {
                error!(worker_id = %self.worker_id, "request semaphore closed unexpectedly");
                break;
            };

            let executor = self.executor.clone();
            let span = info_span!("resume_request", worker_id = %self.worker_id, %request_id);
            debug!(%request_id, "resuming request");
            active.spawn(
                async move {
                    let _permit = permit;
                    match executor.resume(request_id).await {
                        Ok(summary) => info!(outcome = ?summary.outcome, "request resumed"),
                        Err(e) => error!(error = %e, "failed to resume request"),
                    }
                }
                .instrument(span),
            );
        }

        let in_flight = active.len();
        if in_flight > 0 {
            info!(worker_id = %self.worker_id, in_flight, "waiting for in-flight requests");
            while active.join_next().await.is_some() {}
        }
        info!(worker_id = %self.worker_id, "worker stopped");
    }
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    worker_id: String,
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl WorkerHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Token that cancels the worker; child tokens can be derived from it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Stops polling and waits for in-flight requests to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            error!(worker_id = %self.worker_id, error = %e, "worker task failed");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}
