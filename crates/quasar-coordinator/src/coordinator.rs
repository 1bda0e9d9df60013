use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use quasar_common::{
    now_ms, Caller, CoordinatorPhase, DeployModelRequest, DeploymentTask, FunctionType,
    ModelProfile, ModelRecord, ModelState, NodeResult, QuasarError, RegisterModelRequest,
    TaskKind, UndeployModelRequest, WorkerApi,
};
use quasar_meta::{DocumentStore, Index};

use crate::metrics::SharedMetrics;
use crate::node_selector::NodeSelector;
use crate::settings::CoordinatorSettings;
use crate::task_manager::TaskManager;
use crate::topology::ClusterTopology;
use crate::transport::NodeTransport;

/// Places models on worker nodes and tracks every deploy and undeploy as a
/// [`DeploymentTask`].
///
/// Each task fans out one call per target node, gathers results in arrival
/// order and aggregates once every target answered, the dispatch timeout
/// elapsed or the task was cancelled. The coordinator is the only writer of
/// model records; writes for one model are serialized by a per-model lock.
#[derive(Clone)]
pub struct DeploymentCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: CoordinatorSettings,
    docs: DocumentStore,
    selector: NodeSelector,
    transport: Arc<dyn NodeTransport>,
    tasks: TaskManager,
    metrics: Arc<SharedMetrics>,
    model_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

/// Write lock on one model. The lock entry is dropped from the table once no
/// other caller holds or waits on it.
pub(crate) struct ModelGuard {
    guard: Option<OwnedMutexGuard<()>>,
    inner: Arc<Inner>,
    model_id: String,
}

impl Drop for ModelGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.inner
            .model_locks
            .remove_if(&self.model_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// The call made to every target of a task.
#[derive(Clone)]
enum Dispatch {
    Deploy(DeployModelRequest),
    Undeploy(UndeployModelRequest),
}

impl Dispatch {
    async fn send(self, worker: Arc<dyn WorkerApi>) -> NodeResult {
        match self {
            Dispatch::Deploy(request) => worker.deploy(request).await,
            Dispatch::Undeploy(request) => worker.undeploy(request).await,
        }
    }
}

impl DeploymentCoordinator {
    pub fn new(
        settings: CoordinatorSettings,
        docs: DocumentStore,
        topology: Arc<dyn ClusterTopology>,
        transport: Arc<dyn NodeTransport>,
        metrics: Arc<SharedMetrics>,
    ) -> Self {
        let selector = NodeSelector::new(topology, settings.selector.clone());
        let tasks = TaskManager::new(docs.clone(), settings.max_running_tasks);
        Self {
            inner: Arc::new(Inner {
                settings,
                docs,
                selector,
                transport,
                tasks,
                metrics,
                model_locks: DashMap::new(),
            }),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    pub fn docs(&self) -> &DocumentStore {
        &self.inner.docs
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.inner.tasks
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.inner.metrics
    }

    pub fn topology(&self) -> &Arc<dyn ClusterTopology> {
        self.inner.selector.topology()
    }

    pub(crate) fn transport(&self) -> &Arc<dyn NodeTransport> {
        &self.inner.transport
    }

    // ── models ──────────────────────────────────────────────────────

    /// Store a new model in the REGISTERED state.
    pub async fn register_model(
        &self,
        caller: &Caller,
        request: RegisterModelRequest,
    ) -> Result<ModelRecord, QuasarError> {
        if request.name.trim().is_empty() {
            return Err(QuasarError::Validation("model name must not be empty".into()));
        }
        self.ensure_function_type_enabled(request.function_type)?;
        let rate_limiter = request.rate_limiter.unwrap_or_default();
        rate_limiter.require_valid_or_empty("model rate limiter")?;

        let model_id = request
            .model_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut record = ModelRecord::new(model_id, request.name, request.function_type, now_ms());
        record.is_hidden = request.is_hidden;
        record.model_group_id = request.model_group_id;
        record.content_hash = request.content_hash;
        record.format = request.format;
        record.deploy_to_all_nodes = request.deploy_to_all_nodes;
        record.rate_limiter = rate_limiter;
        if let Some(size) = request.content_size_bytes {
            record = record.with_content_size(size);
        }
        caller.check_model_access(&record)?;

        let created = self
            .inner
            .docs
            .create(Index::Models, &record.model_id, &record)
            .await
            .map_err(QuasarError::store)?;
        if !created {
            return Err(QuasarError::Conflict(format!(
                "model {} already exists",
                record.model_id
            )));
        }
        tracing::info!(model_id=%record.model_id, function_type=%record.function_type, "model registered");
        Ok(record)
    }

    /// Load a model the caller may operate on.
    pub async fn get_model(&self, caller: &Caller, model_id: &str) -> Result<ModelRecord, QuasarError> {
        let record = self.require_model(model_id).await?;
        caller.check_model_access(&record)?;
        Ok(record)
    }

    pub(crate) async fn require_model(&self, model_id: &str) -> Result<ModelRecord, QuasarError> {
        self.inner
            .docs
            .get::<ModelRecord>(Index::Models, model_id)
            .await
            .map_err(QuasarError::store)?
            .ok_or_else(|| QuasarError::NotFound(format!("model {model_id}")))
    }

    fn ensure_function_type_enabled(&self, function_type: FunctionType) -> Result<(), QuasarError> {
        if self.inner.settings.enabled_function_types.contains(&function_type) {
            Ok(())
        } else {
            Err(QuasarError::Validation(format!(
                "function type {function_type} is not enabled"
            )))
        }
    }

    pub(crate) async fn lock_model(&self, model_id: &str) -> ModelGuard {
        let lock = self
            .inner
            .model_locks
            .entry(model_id.to_string())
            .or_default()
            .clone();
        ModelGuard {
            guard: Some(lock.lock_owned().await),
            inner: self.inner.clone(),
            model_id: model_id.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn model_lock_count(&self) -> usize {
        self.inner.model_locks.len()
    }

    // ── deploy ──────────────────────────────────────────────────────

    /// Validate, pick targets and start a deploy task. Returns the task id
    /// as soon as the task is persisted; the fan-out runs in the background.
    pub async fn submit_deploy(
        &self,
        caller: &Caller,
        model_id: &str,
        explicit_nodes: Option<Vec<String>>,
    ) -> Result<String, QuasarError> {
        let record = self.get_model(caller, model_id).await?;
        self.ensure_function_type_enabled(record.function_type)?;
        self.inner.tasks.check_can_start(model_id)?;

        let targets = self.resolve_targets(&record, explicit_nodes).await?;
        self.start_deploy_task(model_id, targets).await
    }

    async fn resolve_targets(
        &self,
        record: &ModelRecord,
        explicit_nodes: Option<Vec<String>>,
    ) -> Result<BTreeSet<String>, QuasarError> {
        let eligible = self
            .inner
            .selector
            .eligible_nodes(record.function_type)
            .await?;
        let Some(explicit_nodes) = explicit_nodes else {
            return Ok(eligible);
        };
        if !self.inner.settings.allow_custom_deployment_plan {
            return Err(QuasarError::Validation(
                "custom deployment plan is not allowed".into(),
            ));
        }

        let nodes = self.topology().list_nodes().await?;
        let requested: BTreeSet<String> = explicit_nodes
            .iter()
            .map(|wanted| {
                nodes
                    .iter()
                    .find(|n| &n.node_id == wanted || &n.name == wanted)
                    .map(|n| n.node_id.clone())
                    .unwrap_or_else(|| wanted.clone())
            })
            .collect();

        let outside = record.nodes_outside(&requested);
        if !outside.is_empty() {
            return Err(QuasarError::Validation(format!(
                "model {} is already deployed on {outside:?}, which the requested plan leaves out",
                record.model_id
            )));
        }

        let targets: BTreeSet<String> = requested.intersection(&eligible).cloned().collect();
        for skipped in requested.difference(&eligible) {
            tracing::warn!(model_id=%record.model_id, node_id=%skipped, "requested node is not eligible, skipping");
        }
        if targets.is_empty() {
            return Err(QuasarError::NoEligibleNodes(format!(
                "none of the requested nodes can run {} model {}",
                record.function_type, record.model_id
            )));
        }
        Ok(targets)
    }

    /// Start a deploy of `model_id` to `targets`, bypassing caller checks.
    /// Nodes already serving the model stay in the plan as long as they are
    /// still part of the cluster, so the plan always covers what is loaded.
    pub(crate) async fn start_deploy_task(
        &self,
        model_id: &str,
        mut targets: BTreeSet<String>,
    ) -> Result<String, QuasarError> {
        let _guard = self.lock_model(model_id).await;
        let record = self.require_model(model_id).await?;
        if !record.current_worker_nodes.is_subset(&targets) {
            let members: BTreeSet<String> = self
                .topology()
                .list_nodes()
                .await?
                .into_iter()
                .map(|n| n.node_id)
                .collect();
            let kept: Vec<String> = record
                .current_worker_nodes
                .difference(&targets)
                .filter(|node_id| members.contains(*node_id))
                .cloned()
                .collect();
            for node_id in kept {
                tracing::info!(%model_id, %node_id, "keeping serving node in deploy plan");
                targets.insert(node_id);
            }
        }
        let now = now_ms();
        let mut task = DeploymentTask::new(model_id, TaskKind::Deploy, targets.clone(), now);
        let cancel = self.inner.tasks.register(&task)?;
        let task_id = task.task_id.clone();

        let mut before = None;
        let deploying = self
            .inner
            .docs
            .update(Index::Models, model_id, |r: &mut ModelRecord| {
                before = Some(r.clone());
                r.state = ModelState::Deploying;
                r.planned_worker_nodes = targets.clone();
                r.touch(now);
                true
            })
            .await;
        let (deploying, before) = match (deploying, before) {
            (Ok(Some(record)), Some(before)) => (record, before),
            (Ok(_), _) => {
                self.inner.tasks.finish(&task_id);
                return Err(QuasarError::NotFound(format!("model {model_id}")));
            }
            (Err(e), _) => {
                self.inner.tasks.finish(&task_id);
                return Err(QuasarError::store(e));
            }
        };

        task.advance(CoordinatorPhase::Dispatching, now);
        if let Err(e) = self.inner.tasks.persist(&task).await {
            self.inner.tasks.finish(&task_id);
            self.restore(before, &e.to_string()).await;
            return Err(e);
        }
        self.inner.tasks.update_snapshot(&task);
        SharedMetrics::inc(&self.inner.metrics.tasks_submitted_total);
        tracing::info!(%model_id, %task_id, targets=?task.target_nodes, "deploy task started");

        let dispatch = Dispatch::Deploy(DeployModelRequest {
            task_id: task_id.clone(),
            model: deploying,
        });
        tokio::spawn(self.clone().run_task(task, cancel, before, dispatch));
        Ok(task_id)
    }

    // ── undeploy ────────────────────────────────────────────────────

    /// Start one undeploy task per model. Every model is validated before
    /// any task starts.
    pub async fn submit_undeploy(
        &self,
        caller: &Caller,
        model_ids: &[String],
        node_ids: Option<Vec<String>>,
    ) -> Result<Vec<String>, QuasarError> {
        if model_ids.is_empty() {
            return Err(QuasarError::Validation("model_ids must not be empty".into()));
        }
        for model_id in model_ids {
            self.get_model(caller, model_id).await?;
            self.inner.tasks.check_can_start(model_id)?;
        }

        let node_filter: Option<BTreeSet<String>> = node_ids.map(|ids| ids.into_iter().collect());
        let mut task_ids = Vec::with_capacity(model_ids.len());
        for model_id in model_ids {
            task_ids.push(self.start_undeploy_task(model_id, node_filter.as_ref()).await?);
        }
        Ok(task_ids)
    }

    async fn start_undeploy_task(
        &self,
        model_id: &str,
        node_filter: Option<&BTreeSet<String>>,
    ) -> Result<String, QuasarError> {
        let _guard = self.lock_model(model_id).await;
        let record = self.require_model(model_id).await?;
        // planned nodes may have loaded the model after their result was
        // discarded, so they are unloaded too
        let loaded: BTreeSet<String> = record
            .planned_worker_nodes
            .union(&record.current_worker_nodes)
            .cloned()
            .collect();
        let targets: BTreeSet<String> = match node_filter {
            Some(filter) => loaded.intersection(filter).cloned().collect(),
            None => loaded,
        };

        let now = now_ms();
        let mut task = DeploymentTask::new(model_id, TaskKind::Undeploy, targets.clone(), now);
        let cancel = self.inner.tasks.register(&task)?;
        let task_id = task.task_id.clone();
        SharedMetrics::inc(&self.inner.metrics.tasks_submitted_total);

        if targets.is_empty() {
            self.inner.tasks.finish(&task_id);
            let outcome = if record.current_worker_nodes.is_empty() {
                self.inner
                    .docs
                    .update(Index::Models, model_id, |r: &mut ModelRecord| {
                        r.planned_worker_nodes.clear();
                        r.state = ModelState::Undeployed;
                        r.touch(now);
                        true
                    })
                    .await
                    .map_err(QuasarError::store)?;
                ModelState::Undeployed
            } else {
                record.state
            };
            task.complete(Some(outcome), now);
            self.inner.tasks.persist(&task).await?;
            SharedMetrics::inc(&self.inner.metrics.tasks_completed_total);
            tracing::info!(%model_id, %task_id, %outcome, "nothing to undeploy");
            return Ok(task_id);
        }

        task.advance(CoordinatorPhase::Dispatching, now);
        if let Err(e) = self.inner.tasks.persist(&task).await {
            self.inner.tasks.finish(&task_id);
            return Err(e);
        }
        self.inner.tasks.update_snapshot(&task);
        tracing::info!(%model_id, %task_id, targets=?task.target_nodes, "undeploy task started");

        let dispatch = Dispatch::Undeploy(UndeployModelRequest {
            task_id: Some(task_id.clone()),
            model_id: model_id.to_string(),
        });
        tokio::spawn(self.clone().run_task(task, cancel, record, dispatch));
        Ok(task_id)
    }

    // ── task execution ──────────────────────────────────────────────

    async fn connect_all(
        &self,
        targets: &BTreeSet<String>,
    ) -> Result<Vec<(String, Arc<dyn WorkerApi>)>, QuasarError> {
        let mut workers = Vec::with_capacity(targets.len());
        for node_id in targets {
            let worker = self.inner.transport.connect(node_id).await?;
            workers.push((node_id.clone(), worker));
        }
        Ok(workers)
    }

    async fn run_task(
        self,
        mut task: DeploymentTask,
        cancel: CancellationToken,
        before: ModelRecord,
        dispatch: Dispatch,
    ) {
        let task_id = task.task_id.clone();
        let model_id = task.model_id.clone();

        let workers = match self.connect_all(&task.target_nodes).await {
            Ok(workers) => workers,
            Err(e) => {
                self.abort_plan(task, before, e).await;
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel(workers.len().max(1));
        for (node_id, worker) in workers {
            let tx = tx.clone();
            let dispatch = dispatch.clone();
            tokio::spawn(async move {
                let result = dispatch.send(worker).await;
                let _ = tx.send((node_id, result)).await;
            });
        }
        drop(tx);

        task.advance(CoordinatorPhase::AwaitingResults, now_ms());
        self.inner.tasks.update_snapshot(&task);

        let deadline = Instant::now() + self.inner.settings.dispatch_timeout;
        while !task.all_responded() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(%model_id, %task_id, "task cancelled, discarding node results");
                    return;
                }
                received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                    Ok(Some((node_id, result))) => {
                        self.inner.metrics.observe_result(&result);
                        if !result.is_success() {
                            tracing::warn!(
                                %model_id, %task_id, %node_id,
                                failure=?result.failure,
                                message=result.message.as_deref().unwrap_or(""),
                                "node reported failure"
                            );
                        }
                        task.record(&node_id, result, now_ms());
                        self.inner.tasks.update_snapshot(&task);
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(%model_id, %task_id, "dispatch timeout elapsed");
                        break;
                    }
                },
            }
        }

        for node_id in task.mark_unresponsive_as_timed_out(now_ms()) {
            tracing::warn!(%model_id, %task_id, %node_id, "node timed out");
            SharedMetrics::inc(&self.inner.metrics.node_results_failure_total);
            SharedMetrics::inc(&self.inner.metrics.node_results_timeout_total);
        }

        let _guard = self.lock_model(&model_id).await;
        if cancel.is_cancelled() || self.inner.tasks.finish(&task_id).is_none() {
            tracing::info!(%model_id, %task_id, "task cancelled, discarding node results");
            return;
        }

        let outcome = match self.apply_outcome(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(%model_id, %task_id, error=%e, "failed to store task outcome");
                task.error_summary = Some(e.to_string());
                None
            }
        };
        task.complete(outcome, now_ms());
        if let Err(e) = self.inner.tasks.persist(&task).await {
            tracing::error!(%model_id, %task_id, error=%e, "failed to persist completed task");
        }
        SharedMetrics::inc(&self.inner.metrics.tasks_completed_total);
        tracing::info!(
            %model_id, %task_id,
            kind=?task.kind,
            outcome=?task.outcome,
            succeeded=?task.succeeded_nodes(),
            failed=?task.failed_nodes(),
            "task completed"
        );
    }

    /// Write the aggregated result into the model record.
    async fn apply_outcome(&self, task: &DeploymentTask) -> Result<Option<ModelState>, QuasarError> {
        let now = now_ms();
        let succeeded = task.succeeded_nodes();
        let summary = task.failure_summary();

        let outcome = match task.kind {
            TaskKind::Deploy => {
                let outcome = task.deploy_outcome();
                self.inner
                    .docs
                    .update(Index::Models, &task.model_id, |r: &mut ModelRecord| {
                        r.state = outcome;
                        r.current_worker_nodes = succeeded.clone();
                        r.last_error = summary.clone();
                        r.touch(now);
                        true
                    })
                    .await
                    .map_err(QuasarError::store)?;
                outcome
            }
            TaskKind::Undeploy => {
                let mut outcome = ModelState::Undeployed;
                self.inner
                    .docs
                    .update(Index::Models, &task.model_id, |r: &mut ModelRecord| {
                        for node_id in &succeeded {
                            r.drop_node(node_id, now);
                        }
                        r.state = if r.current_worker_nodes.is_empty() {
                            r.planned_worker_nodes.clear();
                            ModelState::Undeployed
                        } else {
                            r.settled_state()
                        };
                        outcome = r.state;
                        r.last_error = summary.clone();
                        r.touch(now);
                        true
                    })
                    .await
                    .map_err(QuasarError::store)?;
                outcome
            }
        };
        Ok(Some(outcome))
    }

    /// The dispatch plan could not be built; no node was contacted.
    async fn abort_plan(&self, mut task: DeploymentTask, before: ModelRecord, error: QuasarError) {
        let task_id = task.task_id.clone();
        let _guard = self.lock_model(&task.model_id).await;
        if self.inner.tasks.finish(&task_id).is_none() {
            return;
        }
        let message = error.to_string();
        tracing::warn!(model_id=%task.model_id, %task_id, error=%message, "failed to build dispatch plan");
        self.restore(before, &message).await;

        task.error_summary = Some(message);
        task.complete(None, now_ms());
        if let Err(e) = self.inner.tasks.persist(&task).await {
            tracing::error!(%task_id, error=%e, "failed to persist aborted task");
        }
        SharedMetrics::inc(&self.inner.metrics.tasks_plan_failed_total);
    }

    async fn restore(&self, mut before: ModelRecord, error: &str) {
        before.last_error = Some(error.to_string());
        before.touch(now_ms());
        if let Err(e) = self
            .inner
            .docs
            .put(Index::Models, &before.model_id, &before)
            .await
        {
            tracing::error!(model_id=%before.model_id, error=%e, "failed to restore model record");
        }
    }

    // ── tasks ───────────────────────────────────────────────────────

    pub async fn get_task_status(&self, task_id: &str) -> Result<DeploymentTask, QuasarError> {
        self.inner
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| QuasarError::NotFound(format!("task {task_id}")))
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<bool, QuasarError> {
        let cancelled = self.inner.tasks.cancel(task_id).await?;
        if cancelled {
            SharedMetrics::inc(&self.inner.metrics.tasks_cancelled_total);
        }
        Ok(cancelled)
    }

    /// Poll until the task completes or `timeout` elapses, returning the
    /// latest snapshot either way.
    pub async fn wait_for_task(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<DeploymentTask, QuasarError> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.get_task_status(task_id).await?;
            if task.is_completed() || Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // ── profiles ────────────────────────────────────────────────────

    /// Model state plus whatever each serving node reports about it. Nodes
    /// that cannot be reached are left out.
    pub async fn get_model_profile(
        &self,
        caller: &Caller,
        model_id: &str,
    ) -> Result<ModelProfile, QuasarError> {
        let record = self.get_model(caller, model_id).await?;
        let lookups = record.current_worker_nodes.iter().map(|node_id| async move {
            let worker = match self.inner.transport.connect(node_id).await {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::debug!(%model_id, %node_id, error=%e, "skipping node in profile");
                    return None;
                }
            };
            let profile = worker.model_profile(model_id).await?;
            Some((node_id.clone(), profile))
        });
        let nodes: BTreeMap<_, _> = join_all(lookups).await.into_iter().flatten().collect();

        Ok(ModelProfile {
            model_id: record.model_id,
            state: record.state,
            planned_worker_nodes: record.planned_worker_nodes,
            current_worker_nodes: record.current_worker_nodes,
            nodes,
            generated_at: chrono::Utc::now(),
        })
    }

    // ── membership ──────────────────────────────────────────────────

    /// Drop a departed node from every model it served. Models with a
    /// running task are left to that task's aggregation. Returns the ids of
    /// the models that were updated.
    pub async fn on_node_left(&self, node_id: &str) -> Result<Vec<String>, QuasarError> {
        tracing::info!(%node_id, "node left the cluster");
        if self.inner.settings.cancel_tasks_on_node_left {
            for task_id in self.inner.tasks.tasks_targeting(node_id) {
                self.cancel_task(&task_id).await?;
            }
        }

        let affected: Vec<ModelRecord> = self
            .inner
            .docs
            .search(Index::Models, |r: &ModelRecord| {
                r.current_worker_nodes.contains(node_id)
            })
            .await
            .map_err(QuasarError::store)?;

        let mut updated = Vec::new();
        for record in affected {
            let model_id = record.model_id;
            let _guard = self.lock_model(&model_id).await;
            if self.inner.tasks.active_for_model(&model_id).is_some() {
                tracing::debug!(%model_id, %node_id, "task running, leaving record to it");
                continue;
            }
            let now = now_ms();
            let changed = self
                .inner
                .docs
                .update(Index::Models, &model_id, |r: &mut ModelRecord| {
                    if !r.current_worker_nodes.remove(node_id) {
                        return false;
                    }
                    r.state = r.settled_state();
                    r.touch(now);
                    true
                })
                .await
                .map_err(QuasarError::store)?;
            if let Some(record) = changed {
                tracing::info!(%model_id, %node_id, state=%record.state, "removed departed node from model");
                updated.push(model_id);
            }
        }
        Ok(updated)
    }

    /// Extend models flagged `deploy_to_all_nodes` onto a node that joined.
    /// Returns the started task ids.
    pub async fn on_node_joined(&self, node_id: &str) -> Result<Vec<String>, QuasarError> {
        let candidates: Vec<ModelRecord> = self
            .inner
            .docs
            .search(Index::Models, |r: &ModelRecord| {
                r.deploy_to_all_nodes
                    && r.state.is_serving()
                    && !r.current_worker_nodes.contains(node_id)
            })
            .await
            .map_err(QuasarError::store)?;

        let mut task_ids = Vec::new();
        for record in candidates {
            let eligible = match self.inner.selector.eligible_nodes(record.function_type).await {
                Ok(eligible) => eligible,
                Err(QuasarError::NoEligibleNodes(_)) => continue,
                Err(e) => return Err(e),
            };
            if !eligible.contains(node_id) {
                continue;
            }
            let mut targets = record.current_worker_nodes.clone();
            targets.insert(node_id.to_string());
            match self.start_deploy_task(&record.model_id, targets).await {
                Ok(task_id) => task_ids.push(task_id),
                Err(e) => {
                    tracing::warn!(model_id=%record.model_id, %node_id, error=%e, "could not extend model to new node")
                }
            }
        }
        Ok(task_ids)
    }

    /// Follow node registrations until `shutdown` fires. Heartbeats re-put
    /// node documents, so a join is a put for an id not seen before.
    pub async fn watch_nodes(self, shutdown: CancellationToken) {
        loop {
            let mut stream = match self.inner.docs.watch(Index::Nodes).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!(error=%e, "failed to watch nodes, retrying in 5s");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                    }
                }
            };
            let mut known: BTreeSet<String> = match self.topology().list_nodes().await {
                Ok(nodes) => nodes.into_iter().map(|n| n.node_id).collect(),
                Err(e) => {
                    tracing::warn!(error=%e, "failed to list nodes, treating every node as new");
                    BTreeSet::new()
                }
            };

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = stream.next() => event,
                };
                let Some(event) = event else { break };
                let Some(node_id) = self
                    .inner
                    .docs
                    .id_of(Index::Nodes, &event.key)
                    .map(str::to_string)
                else {
                    continue;
                };

                let handled = if event.is_delete() {
                    known.remove(&node_id);
                    self.on_node_left(&node_id).await.map(|_| ())
                } else if known.insert(node_id.clone()) {
                    tracing::info!(%node_id, "node joined the cluster");
                    self.on_node_joined(&node_id).await.map(|_| ())
                } else {
                    Ok(())
                };
                if let Err(e) = handled {
                    tracing::warn!(%node_id, error=%e, "failed to handle node membership change");
                }
            }

            tracing::warn!("node watch stream ended, reconnecting");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
