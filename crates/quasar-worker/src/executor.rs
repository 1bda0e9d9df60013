use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use quasar_common::{
    now_ms, DeployModelRequest, FailureKind, NodeModelProfile, NodeResult, QuasarError,
    RefreshLimitersRequest, UndeployModelRequest, WorkerApi,
};

use crate::circuit_breaker::CircuitBreaker;
use crate::loader::ModelLoader;
use crate::metrics::SharedMetrics;
use crate::model_cache::{CachedModel, ModelCache};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub node_id: String,
    pub max_concurrent_loads: usize,
    pub max_models_per_node: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            node_id: "worker-0".into(),
            max_concurrent_loads: 4,
            max_models_per_node: 16,
        }
    }
}

/// Runs deploy and undeploy requests on this node.
///
/// Each request runs on its own spawned task so a slow load never holds up
/// the caller's runtime thread.
#[derive(Clone)]
pub struct WorkerExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ExecutorSettings,
    cache: Arc<ModelCache>,
    breaker: Arc<CircuitBreaker>,
    loader: Arc<dyn ModelLoader>,
    loads: Semaphore,
    metrics: Arc<SharedMetrics>,
}

impl WorkerExecutor {
    pub fn new(
        settings: ExecutorSettings,
        cache: Arc<ModelCache>,
        breaker: Arc<CircuitBreaker>,
        loader: Arc<dyn ModelLoader>,
        metrics: Arc<SharedMetrics>,
    ) -> Self {
        let loads = Semaphore::new(settings.max_concurrent_loads.max(1));
        Self {
            inner: Arc::new(Inner {
                settings,
                cache,
                breaker,
                loader,
                loads,
                metrics,
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.settings.node_id
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.inner.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.inner.metrics
    }
}

impl Inner {
    async fn deploy(&self, request: DeployModelRequest) -> NodeResult {
        let model = request.model;
        let model_id = model.model_id.clone();
        let node_id = &self.settings.node_id;

        // a node already serving this exact artifact only needs new limiters,
        // whatever its current load
        if self.cache.get_content_hash(&model_id) == Some(model.content_hash.clone()) {
            self.cache
                .refresh_limiters(&RefreshLimitersRequest::from_record(&model));
            tracing::info!(%model_id, %node_id, "model already loaded, limiters refreshed");
            return NodeResult::success();
        }

        if let Some(reason) = self.breaker.open_reason() {
            SharedMetrics::inc(&self.metrics.circuit_breaker_rejections_total);
            tracing::warn!(%model_id, %node_id, %reason, "deploy rejected");
            return NodeResult::failure(FailureKind::ResourceExhausted, reason);
        }

        let Ok(_permit) = self.loads.try_acquire() else {
            return NodeResult::failure(
                FailureKind::ResourceExhausted,
                format!(
                    "node {node_id} is already loading {} models",
                    self.settings.max_concurrent_loads
                ),
            );
        };

        if !self.cache.is_model_deployed(&model_id)
            && self.cache.len() >= self.settings.max_models_per_node
        {
            return NodeResult::failure(
                FailureKind::ResourceExhausted,
                format!(
                    "node {node_id} already serves the maximum of {} models",
                    self.settings.max_models_per_node
                ),
            );
        }

        match self.loader.load(&model).await {
            Ok(()) => {
                self.cache.insert(CachedModel::new(model, now_ms()));
                tracing::info!(%model_id, %node_id, task_id=%request.task_id, "model deployed");
                NodeResult::success()
            }
            Err(e) => {
                tracing::warn!(%model_id, %node_id, error=%e, "model load failed");
                NodeResult::failure(FailureKind::Load, e.to_string())
            }
        }
    }

    async fn undeploy(&self, request: UndeployModelRequest) -> NodeResult {
        let model_id = request.model_id;
        if self.cache.remove(&model_id).is_none() {
            tracing::debug!(%model_id, "undeploy of model not loaded here");
            return NodeResult::success();
        }
        match self.loader.unload(&model_id).await {
            Ok(()) => {
                tracing::info!(%model_id, node_id=%self.settings.node_id, "model undeployed");
                NodeResult::success()
            }
            Err(e) => {
                tracing::warn!(%model_id, error=%e, "model unload failed");
                NodeResult::failure(FailureKind::Load, e.to_string())
            }
        }
    }
}

#[async_trait]
impl WorkerApi for WorkerExecutor {
    async fn deploy(&self, request: DeployModelRequest) -> NodeResult {
        SharedMetrics::inc(&self.inner.metrics.deploy_total);
        let inner = self.inner.clone();
        let result = match tokio::spawn(async move { inner.deploy(request).await }).await {
            Ok(result) => result,
            Err(e) => NodeResult::failure(FailureKind::Load, format!("deploy task aborted: {e}")),
        };
        if !result.is_success() {
            SharedMetrics::inc(&self.inner.metrics.deploy_failures_total);
        }
        result
    }

    async fn undeploy(&self, request: UndeployModelRequest) -> NodeResult {
        SharedMetrics::inc(&self.inner.metrics.undeploy_total);
        let inner = self.inner.clone();
        match tokio::spawn(async move { inner.undeploy(request).await }).await {
            Ok(result) => result,
            Err(e) => NodeResult::failure(FailureKind::Load, format!("undeploy task aborted: {e}")),
        }
    }

    async fn refresh_limiters(&self, request: RefreshLimitersRequest) -> Result<(), QuasarError> {
        if self.inner.cache.refresh_limiters(&request) {
            tracing::info!(model_id=%request.model_id, "rate limiters refreshed");
            Ok(())
        } else {
            Err(QuasarError::NotFound(format!(
                "model {} is not deployed on node {}",
                request.model_id,
                self.node_id()
            )))
        }
    }

    async fn model_profile(&self, model_id: &str) -> Option<NodeModelProfile> {
        self.inner.cache.model_profile(model_id)
    }

    async fn deployed_models(&self) -> Result<BTreeSet<String>, QuasarError> {
        Ok(self.inner.cache.deployed_models().into_iter().collect())
    }
}
