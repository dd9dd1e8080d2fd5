//! Drives the tasks of a privacy request through their connectors.
//!
//! Execution is a loop over the plan: every `pending` task whose upstream
//! tasks are all `complete` or `skipped` is claimed with a compare-and-swap
//! and spawned into a [`JoinSet`]. As results come back, newly satisfied
//! tasks become ready. The loop ends when nothing is running and nothing is
//! ready, which happens when every task finished, or when the remaining
//! tasks wait on a failure, a suspension, or a pause.
//!
//! All state lives in the task store. Re-running a request skips every task
//! that already has a terminal row, which is what makes [`TaskExecutor::resume`]
//! safe after a crash. A task whose claim is older than the configured lease
//! is assumed to belong to a run that died and is released back to `pending`
//! before the request is resumed.

use super::async_coordinator::{AsyncCoordinator, Suspension};
use super::context::ExecutorContext;
use super::error::{ExecutionError, Result};
use super::inputs::identity_inputs;
use super::masking::MaskingPlan;
use super::summary::ExecutionSummary;
use crate::connector::{
    ConnectionHandle, ConnectorContext, ConnectorError, ConnectorInputs, ConnectorOutcome,
};
use crate::core::{
    retry_with_policy, ActionType, AsyncType, RequestTask, Row, TaskKey, TaskStatus, TaskUpdate,
};
use crate::graph::{CollectionAddress, DatasetGraph};
use crate::storage::{PrivacyRequest, RequestStatus, TaskStore};
use crate::traversal::{ExecutionPlan, TaskDescriptor, Traversal};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

type TaskMap = HashMap<CollectionAddress, RequestTask>;

/// What a claimed task does once spawned.
enum Work {
    Retrieve {
        connection: ConnectionHandle,
        inputs: ConnectorInputs,
    },
    Mask {
        connection: ConnectionHandle,
        masking: MaskingPlan,
        rows: Vec<Row>,
    },
    /// The result is known without calling the connector.
    Finish(TaskUpdate),
}

struct Job {
    task: RequestTask,
    connector_ctx: ConnectorContext,
    work: Work,
}

pub struct TaskExecutor {
    ctx: ExecutorContext,
    graph: Arc<DatasetGraph>,
    coordinator: AsyncCoordinator,
}

impl TaskExecutor {
    pub fn new(ctx: ExecutorContext, graph: Arc<DatasetGraph>) -> Self {
        let coordinator = AsyncCoordinator::new(ctx.clone());
        Self {
            ctx,
            graph,
            coordinator,
        }
    }

    pub fn context(&self) -> &ExecutorContext {
        &self.ctx
    }

    pub fn graph(&self) -> &DatasetGraph {
        &self.graph
    }

    pub fn coordinator(&self) -> &AsyncCoordinator {
        &self.coordinator
    }

    /// Plans a request against the graph: always an access plan, plus an
    /// erasure plan when the policy has erasure rules.
    pub fn plan(&self, request: &PrivacyRequest) -> Result<(ExecutionPlan, Option<ExecutionPlan>)> {
        let traversal = Traversal::new(&self.graph, &request.identities)?;
        let access = traversal.access_plan()?;
        let erasure = if request.policy.has_erasure_rules() {
            Some(traversal.erasure_plan()?)
        } else {
            None
        };
        Ok((access, erasure))
    }

    /// Plans, persists and executes a new request.
    pub async fn submit(&self, request: PrivacyRequest) -> Result<ExecutionSummary> {
        let (access, erasure) = self.plan(&request)?;
        self.ctx.store().save_request(&request).await?;
        self.execute(&request, &access, erasure.as_ref()).await
    }

    /// Re-plans a stored request and executes whatever is left of it.
    ///
    /// Claims older than the configured lease are released first, so a task
    /// stranded by a crashed run is dispatched again.
    pub async fn resume(&self, request_id: Uuid) -> Result<ExecutionSummary> {
        let store = self.ctx.store();
        let request = store
            .get_request(request_id)
            .await?
            .ok_or(ExecutionError::RequestNotFound(request_id))?;

        let cutoff = self.claim_cutoff(Utc::now());
        let stale = store
            .tasks_for_request(request_id, None)
            .await?
            .into_iter()
            .filter(|task| task.is_stale_claim(cutoff));
        self.release_claims(stale).await?;

        let (access, erasure) = self.plan(&request)?;
        self.execute(&request, &access, erasure.as_ref()).await
    }

    /// Executes the plans of a request as far as they can currently go.
    pub async fn execute(
        &self,
        request: &PrivacyRequest,
        access_plan: &ExecutionPlan,
        erasure_plan: Option<&ExecutionPlan>,
    ) -> Result<ExecutionSummary> {
        let store = self.ctx.store();
        let request_id = request.id;

        let erasure_tasks = erasure_plan.iter().flat_map(|plan| &plan.tasks);
        for descriptor in access_plan.tasks.iter().chain(erasure_tasks) {
            self.connection_for(&descriptor.address)?;
        }

        let status = match store.get_request(request_id).await? {
            Some(stored) => stored.status,
            None => {
                store.save_request(request).await?;
                request.status
            }
        };
        if status.halts_dispatch() {
            info!(%request_id, %status, "request halted, nothing dispatched");
            return self.summary(request_id).await;
        }
        store
            .set_request_status(request_id, RequestStatus::InProcessing)
            .await?;

        self.materialize(request_id, access_plan).await?;
        if let Some(plan) = erasure_plan {
            self.materialize(request_id, plan).await?;
        }

        let access_tasks = self.run_phase(request, access_plan, None).await?;

        if let Some(plan) = erasure_plan {
            if access_tasks.values().all(|task| task.status().satisfies_downstream()) {
                self.run_phase(request, plan, Some(&access_tasks)).await?;
            } else {
                debug!(%request_id, "access phase unfinished, erasure deferred");
            }
        }

        self.finish(request_id).await
    }

    /// Resets every task of a request interrupted mid-call (`in_processing`
    /// without a suspension) back to `pending`, regardless of its lease.
    /// Returns how many were reset.
    ///
    /// Only call this when no executor is running the request.
    pub async fn recover(&self, request_id: Uuid) -> Result<usize> {
        let claimed = self
            .ctx
            .store()
            .tasks_for_request(request_id, None)
            .await?
            .into_iter()
            .filter(|task| task.status() == TaskStatus::InProcessing && !task.is_suspended());

        let released = self.release_claims(claimed).await?;
        if !released.is_empty() {
            info!(%request_id, reset = released.len(), "recovered interrupted tasks");
        }
        Ok(released.len())
    }

    /// Releases claims of any request that outlived the claim lease at `now`
    /// and queues their requests for a worker. Returns the queued request ids.
    pub async fn requeue_stale_claims(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let store = self.ctx.store();
        let stale = store.stale_claims(self.claim_cutoff(now)).await?;

        let mut requests = Vec::new();
        for task in self.release_claims(stale).await? {
            if !requests.contains(&task.privacy_request_id()) {
                requests.push(task.privacy_request_id());
            }
        }
        for request_id in &requests {
            store.enqueue_request(*request_id).await?;
        }
        Ok(requests)
    }

    fn claim_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ctx.config().claim_lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Moves claimed tasks back to `pending`. Tasks that changed in the
    /// meantime are left alone.
    async fn release_claims(
        &self,
        tasks: impl IntoIterator<Item = RequestTask>,
    ) -> Result<Vec<RequestTask>> {
        let store = self.ctx.store();
        let mut released = Vec::new();

        for task in tasks {
            let update = TaskUpdate::status(TaskStatus::Pending);
            let Some(updated) = store
                .update_task(task.id(), Some(TaskStatus::InProcessing), update)
                .await?
            else {
                continue;
            };
            warn!(
                privacy_request_id = %updated.privacy_request_id(),
                collection = %updated.collection(),
                action = %updated.action(),
                claimed_at = %task.updated_at(),
                "released abandoned claim"
            );
            released.push(updated);
        }
        Ok(released)
    }

    /// Moves every `error` task of a request back to `pending` and resumes it.
    pub async fn retry_failed(&self, request_id: Uuid) -> Result<ExecutionSummary> {
        let store = self.ctx.store();
        let mut retried = 0;

        for task in store.tasks_for_request(request_id, None).await? {
            if task.status() != TaskStatus::Error {
                continue;
            }
            let update = TaskUpdate {
                status: Some(TaskStatus::Pending),
                error_message: Some(None),
                ..TaskUpdate::default()
            };
            if store
                .update_task(task.id(), Some(TaskStatus::Error), update)
                .await?
                .is_some()
            {
                retried += 1;
            }
        }

        info!(%request_id, retried, "retrying failed tasks");
        self.resume(request_id).await
    }

    /// Summarizes a request from its stored rows without changing anything.
    pub async fn summary(&self, request_id: Uuid) -> Result<ExecutionSummary> {
        let store = self.ctx.store();
        let request = store
            .get_request(request_id)
            .await?
            .ok_or(ExecutionError::RequestNotFound(request_id))?;
        let tasks = store.tasks_for_request(request_id, None).await?;
        Ok(ExecutionSummary::from_tasks(request_id, request.status, &tasks))
    }

    async fn finish(&self, request_id: Uuid) -> Result<ExecutionSummary> {
        let summary = self.summary(request_id).await?;
        let store = self.ctx.store();

        let current = store
            .get_request(request_id)
            .await?
            .ok_or(ExecutionError::RequestNotFound(request_id))?
            .status;
        if !current.halts_dispatch() {
            store
                .set_request_status(request_id, summary.outcome.request_status())
                .await?;
        }

        info!(
            %request_id,
            outcome = ?summary.outcome,
            access_complete = summary.access.complete,
            erasure_complete = summary.erasure.complete,
            "execution pass finished"
        );
        Ok(summary)
    }

    async fn materialize(&self, request_id: Uuid, plan: &ExecutionPlan) -> Result<()> {
        let tasks = plan
            .tasks
            .iter()
            .map(|descriptor| {
                RequestTask::new(
                    TaskKey::new(request_id, descriptor.address.clone(), plan.action),
                    descriptor.upstream.clone(),
                    descriptor.downstream.clone(),
                )
            })
            .collect();

        let stored = self.ctx.store().create_tasks(tasks).await?;
        for task in stored.iter().filter(|task| task.status().satisfies_downstream()) {
            debug!(
                %request_id,
                collection = %task.collection(),
                action = %plan.action,
                status = %task.status(),
                "cached result, task will not be re-invoked"
            );
        }
        Ok(())
    }

    async fn dispatch_halted(&self, request_id: Uuid) -> Result<bool> {
        let status = self
            .ctx
            .store()
            .get_request(request_id)
            .await?
            .ok_or(ExecutionError::RequestNotFound(request_id))?
            .status;

        if status.halts_dispatch() {
            info!(%request_id, %status, "dispatch stopped");
            return Ok(true);
        }
        Ok(false)
    }

    async fn run_phase(
        &self,
        request: &PrivacyRequest,
        plan: &ExecutionPlan,
        access_tasks: Option<&TaskMap>,
    ) -> Result<TaskMap> {
        let store = self.ctx.store();
        let action = plan.action;

        let mut tasks: TaskMap = store
            .tasks_for_request(request.id, Some(action))
            .await?
            .into_iter()
            .map(|task| (task.collection().clone(), task))
            .collect();

        info!(privacy_request_id = %request.id, %action, tasks = plan.len(), "starting phase");

        let mut running: JoinSet<Result<RequestTask>> = JoinSet::new();
        let mut in_flight: HashSet<CollectionAddress> = HashSet::new();
        let mut halted = false;
        let mut failure: Option<ExecutionError> = None;

        // A store error stops dispatch but never drops `running`: every job
        // already spawned writes its own result before the phase returns.
        loop {
            if !halted && failure.is_none() {
                let dispatched = self
                    .dispatch_ready(
                        request,
                        plan,
                        &mut tasks,
                        &mut in_flight,
                        &mut running,
                        access_tasks,
                    )
                    .await;
                match dispatched {
                    Ok(stopped) => halted = stopped,
                    Err(e) => {
                        error!(
                            privacy_request_id = %request.id,
                            %action,
                            running = running.len(),
                            error = %e,
                            "dispatch failed, waiting for running tasks"
                        );
                        failure = Some(e);
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };

            match joined {
                Ok(Ok(task)) => {
                    in_flight.remove(task.collection());
                    if task.status() == TaskStatus::Error {
                        match self.ctx.propagate_failure(&task).await {
                            Ok(changed) => {
                                for changed in changed {
                                    tasks.insert(changed.collection().clone(), changed);
                                }
                            }
                            Err(e) => {
                                error!(
                                    privacy_request_id = %request.id,
                                    %action,
                                    error = %e,
                                    "failure propagation aborted"
                                );
                                failure.get_or_insert(e);
                            }
                        }
                    }
                    tasks.insert(task.collection().clone(), task);
                }
                Ok(Err(e)) => {
                    error!(privacy_request_id = %request.id, %action, error = %e, "task aborted");
                    failure.get_or_insert(e);
                }
                Err(join_error) => {
                    let message = join_error.to_string();
                    error!(
                        privacy_request_id = %request.id,
                        %action,
                        error = %message,
                        "task panicked"
                    );
                    failure.get_or_insert(ExecutionError::TaskPanic(message));
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        info!(privacy_request_id = %request.id, %action, "phase settled");
        Ok(tasks)
    }

    /// Claims and spawns every ready task. Returns true when the request
    /// status stopped dispatch.
    async fn dispatch_ready(
        &self,
        request: &PrivacyRequest,
        plan: &ExecutionPlan,
        tasks: &mut TaskMap,
        in_flight: &mut HashSet<CollectionAddress>,
        running: &mut JoinSet<Result<RequestTask>>,
        access_tasks: Option<&TaskMap>,
    ) -> Result<bool> {
        let store = self.ctx.store();
        let action = plan.action;

        for descriptor in ready(plan, tasks, in_flight) {
            if self.dispatch_halted(request.id).await? {
                return Ok(true);
            }

            let Some(task) = tasks.get(&descriptor.address).cloned() else {
                continue;
            };
            if !store.claim_task(task.id()).await? {
                debug!(
                    collection = %descriptor.address,
                    %action,
                    "claim lost, task owned elsewhere"
                );
                if let Some(current) = store.get_task(task.id()).await? {
                    tasks.insert(descriptor.address.clone(), current);
                }
                continue;
            }

            let job = match self.prepare(request, descriptor, task.clone(), tasks, access_tasks) {
                Ok(job) => job,
                Err(e) => {
                    // Nothing runs the claimed task; leave it failed, not claimed
                    let failed = TaskUpdate::failed(e.to_string());
                    store
                        .update_task(task.id(), Some(TaskStatus::InProcessing), failed)
                        .await?;
                    return Err(e);
                }
            };

            let span = info_span!(
                "request_task",
                privacy_request_id = %request.id,
                collection = %descriptor.address,
                action = %action,
            );
            debug!(collection = %descriptor.address, %action, "dispatching task");
            in_flight.insert(descriptor.address.clone());
            running.spawn(
                job.run(self.ctx.clone(), self.coordinator.clone())
                    .instrument(span),
            );
        }
        Ok(false)
    }

    fn prepare(
        &self,
        request: &PrivacyRequest,
        descriptor: &TaskDescriptor,
        task: RequestTask,
        tasks: &TaskMap,
        access_tasks: Option<&TaskMap>,
    ) -> Result<Job> {
        let address = &descriptor.address;
        let node = self
            .graph
            .node(address)
            .ok_or_else(|| ExecutionError::UnknownCollection(address.clone()))?;

        let work = match task.action() {
            ActionType::Access => {
                let upstream_rows: HashMap<CollectionAddress, &[Row]> = descriptor
                    .upstream
                    .iter()
                    .filter_map(|upstream| {
                        let rows = tasks.get(upstream)?.access_data()?;
                        Some((upstream.clone(), rows))
                    })
                    .collect();

                let inputs = identity_inputs(descriptor, &request.identities, &upstream_rows);
                if inputs.is_empty() {
                    debug!(collection = %address, "no identity inputs, nothing to retrieve");
                    Work::Finish(TaskUpdate::retrieved(Vec::new()))
                } else {
                    Work::Retrieve {
                        connection: self.connection_for(address)?,
                        inputs,
                    }
                }
            }
            ActionType::Erasure => {
                let rows = access_tasks
                    .and_then(|access| access.get(address))
                    .and_then(|task| task.access_data())
                    .unwrap_or_default();

                if rows.is_empty() {
                    debug!(collection = %address, "no access rows, nothing to mask");
                    Work::Finish(TaskUpdate::masked(0))
                } else {
                    match MaskingPlan::for_collection(
                        &request.policy,
                        address,
                        node.collection(),
                        self.ctx.config().masking_strict,
                    ) {
                        Err(e) => Work::Finish(TaskUpdate::failed(e.to_string())),
                        Ok(masking) if masking.is_empty() => Work::Finish(TaskUpdate::masked(0)),
                        Ok(masking) => Work::Mask {
                            connection: self.connection_for(address)?,
                            masking,
                            rows: rows.to_vec(),
                        },
                    }
                }
            }
        };

        let connector_ctx = ConnectorContext {
            privacy_request_id: request.id,
            task_id: task.id(),
            action: task.action(),
            address: address.clone(),
            collection: node.collection().clone(),
            attempt: 1,
        };

        Ok(Job {
            task,
            connector_ctx,
            work,
        })
    }

    fn connection_for(&self, address: &CollectionAddress) -> Result<ConnectionHandle> {
        let no_connector = |connection_key: &str| ExecutionError::NoConnector {
            dataset: address.dataset().to_string(),
            connection_key: connection_key.to_string(),
        };

        let key = self
            .graph
            .connection_key(address.dataset())
            .ok_or_else(|| no_connector(""))?;
        self.ctx.registry().get(key).ok_or_else(|| no_connector(key))
    }
}

/// Pending, not running, and every upstream task satisfied. In plan order.
fn ready<'p>(
    plan: &'p ExecutionPlan,
    tasks: &TaskMap,
    in_flight: &HashSet<CollectionAddress>,
) -> Vec<&'p TaskDescriptor> {
    plan.tasks
        .iter()
        .filter(|descriptor| !in_flight.contains(&descriptor.address))
        .filter(|descriptor| {
            tasks
                .get(&descriptor.address)
                .is_some_and(|task| task.status() == TaskStatus::Pending)
        })
        .filter(|descriptor| {
            descriptor.upstream.iter().all(|upstream| {
                tasks
                    .get(upstream)
                    .is_some_and(|task| task.status().satisfies_downstream())
            })
        })
        .collect()
}

impl Job {
    async fn run(self, ctx: ExecutorContext, coordinator: AsyncCoordinator) -> Result<RequestTask> {
        let Job {
            task,
            connector_ctx,
            work,
        } = self;
        let store = ctx.store();
        let policy = ctx.config().retry_policy;
        let timeout = ctx.config().connector_timeout;
        let attempts = AtomicU32::new(0);

        let update = match work {
            Work::Finish(update) => update,
            Work::Retrieve { connection, inputs } => {
                let _permit = acquire(&connection).await?;
                let connector = &connection.connector;
                let (base, inputs, attempts) = (&connector_ctx, &inputs, &attempts);

                let result = retry_with_policy(policy, |attempt| async move {
                    attempts.store(attempt, Ordering::Relaxed);
                    let call_ctx = ConnectorContext {
                        attempt,
                        ..base.clone()
                    };
                    let call = connector.retrieve_data(&call_ctx, inputs);
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectorError::Timeout(timeout)),
                    }
                })
                .await;

                let update = match result {
                    Ok(ConnectorOutcome::Ready(rows)) => {
                        debug!(rows = rows.len(), "retrieved rows");
                        TaskUpdate::retrieved(rows)
                    }
                    Ok(ConnectorOutcome::AwaitingAsync(async_type)) => {
                        return suspend(store, &coordinator, &task, async_type).await;
                    }
                    Err(e) => {
                        let attempts = attempts.load(Ordering::Relaxed);
                        error!(attempts, error = %e, "access task failed");
                        TaskUpdate::failed(e.to_string())
                    }
                };
                update.with_attempts(attempts.load(Ordering::Relaxed))
            }
            Work::Mask {
                connection,
                masking,
                rows,
            } => {
                let _permit = acquire(&connection).await?;
                let connector = &connection.connector;
                let (base, masking, rows, attempts) = (&connector_ctx, &masking, &rows, &attempts);

                let result = retry_with_policy(policy, |attempt| async move {
                    attempts.store(attempt, Ordering::Relaxed);
                    let call_ctx = ConnectorContext {
                        attempt,
                        ..base.clone()
                    };
                    let call = connector.mask_data(&call_ctx, masking, rows);
                    match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => Err(ConnectorError::Timeout(timeout)),
                    }
                })
                .await;

                let update = match result {
                    Ok(ConnectorOutcome::Ready(count)) => {
                        debug!(rows_masked = count, "masked rows");
                        TaskUpdate::masked(count)
                    }
                    Ok(ConnectorOutcome::AwaitingAsync(async_type)) => {
                        return suspend(store, &coordinator, &task, async_type).await;
                    }
                    Err(e) => {
                        let attempts = attempts.load(Ordering::Relaxed);
                        error!(attempts, error = %e, "erasure task failed");
                        TaskUpdate::failed(e.to_string())
                    }
                };
                update.with_attempts(attempts.load(Ordering::Relaxed))
            }
        };

        let updated = store
            .update_task(task.id(), Some(TaskStatus::InProcessing), update)
            .await?
            .ok_or(ExecutionError::Conflict(task.id()))?;

        match updated.status() {
            TaskStatus::Error => error!(
                error = updated.error_message().unwrap_or_default(),
                "task ended in error"
            ),
            status => debug!(%status, "task finished"),
        }
        Ok(updated)
    }
}

async fn acquire(connection: &ConnectionHandle) -> Result<tokio::sync::SemaphorePermit<'_>> {
    connection
        .limiter
        .acquire()
        .await
        .map_err(|_| ExecutionError::Connector(ConnectorError::fatal("connection limiter closed")))
}

async fn suspend(
    store: &Arc<dyn TaskStore>,
    coordinator: &AsyncCoordinator,
    task: &RequestTask,
    async_type: AsyncType,
) -> Result<RequestTask> {
    match coordinator.initiate(task, async_type).await? {
        Some(Suspension { deadline, .. }) => {
            debug!(%deadline, "branch parked until completion arrives");
        }
        None => debug!("completion arrived before suspension, continuing"),
    }

    store
        .get_task(task.id())
        .await?
        .ok_or(ExecutionError::TaskNotFound(task.id()))
}
