use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use quasar_common::{
    now_ms, Caller, DeploymentTask, FunctionType, ModelRecord, NodeInfo, NodeRole,
    RateLimiterConfig, RegisterModelRequest,
};
use quasar_meta::{DocumentStore, Index, MemoryMetaStore, MetaStore};
use quasar_worker::metrics::SharedMetrics as WorkerMetrics;
use quasar_worker::{CircuitBreaker, ExecutorSettings, ModelCache, ModelLoader, WorkerExecutor};

use crate::coordinator::DeploymentCoordinator;
use crate::metrics::SharedMetrics;
use crate::settings::CoordinatorSettings;
use crate::topology::StaticTopology;
use crate::transport::LocalTransport;

/// Loader that waits and then succeeds or fails as told.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLoader {
    pub delay: Option<Duration>,
    pub fail_with: Option<String>,
}

impl ScriptedLoader {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            fail_with: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            delay: None,
            fail_with: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, _model: &ModelRecord) -> anyhow::Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.fail_with {
            Some(message) => anyhow::bail!("{message}"),
            None => Ok(()),
        }
    }

    async fn unload(&self, _model_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TestCluster {
    pub coordinator: DeploymentCoordinator,
    pub docs: DocumentStore,
    pub workers: BTreeMap<String, WorkerExecutor>,
}

pub struct ClusterBuilder {
    settings: CoordinatorSettings,
    nodes: Vec<(String, Vec<NodeRole>, ScriptedLoader)>,
    unreachable: BTreeSet<String>,
    store: Option<Arc<dyn MetaStore>>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            settings: CoordinatorSettings {
                dispatch_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            nodes: Vec::new(),
            unreachable: BTreeSet::new(),
            store: None,
        }
    }

    pub fn settings(mut self, change: impl FnOnce(&mut CoordinatorSettings)) -> Self {
        change(&mut self.settings);
        self
    }

    pub fn node(self, node_id: &str, loader: ScriptedLoader) -> Self {
        self.node_with_roles(node_id, &[NodeRole::Ml], loader)
    }

    pub fn node_with_roles(mut self, node_id: &str, roles: &[NodeRole], loader: ScriptedLoader) -> Self {
        self.nodes.push((node_id.to_string(), roles.to_vec(), loader));
        self
    }

    /// Back the cluster with `store` instead of a fresh in-memory one.
    pub fn store(mut self, store: Arc<dyn MetaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn nodes(mut self, node_ids: &[&str]) -> Self {
        for id in node_ids {
            self = self.node(id, ScriptedLoader::default());
        }
        self
    }

    /// Listed in the topology but without a worker behind it.
    pub fn unreachable_node(mut self, node_id: &str) -> Self {
        self.unreachable.insert(node_id.to_string());
        self
    }

    pub fn build(self) -> TestCluster {
        let store: Arc<dyn MetaStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryMetaStore::new()),
        };
        let docs = DocumentStore::new(store);
        let transport = Arc::new(LocalTransport::new());
        let mut infos = Vec::new();
        let mut workers = BTreeMap::new();

        for (node_id, roles, loader) in self.nodes {
            let executor = WorkerExecutor::new(
                ExecutorSettings {
                    node_id: node_id.clone(),
                    ..Default::default()
                },
                Arc::new(ModelCache::new()),
                Arc::new(CircuitBreaker::new(85.0, None)),
                Arc::new(loader),
                Arc::new(WorkerMetrics::default()),
            );
            transport.register(node_id.clone(), Arc::new(executor.clone()));
            infos.push(live_node(&node_id, &roles));
            workers.insert(node_id, executor);
        }
        infos.extend(self.unreachable.iter().map(|id| live_node(id, &[NodeRole::Ml])));

        let coordinator = DeploymentCoordinator::new(
            self.settings,
            docs.clone(),
            Arc::new(StaticTopology::new("c0", infos)),
            transport,
            Arc::new(SharedMetrics::default()),
        );
        TestCluster {
            coordinator,
            docs,
            workers,
        }
    }
}

fn live_node(node_id: &str, roles: &[NodeRole]) -> NodeInfo {
    let mut node = NodeInfo::new(node_id, roles.iter().copied());
    node.last_heartbeat_ms = now_ms();
    node
}

pub fn register_request(model_id: &str, function_type: FunctionType) -> RegisterModelRequest {
    RegisterModelRequest {
        model_id: Some(model_id.to_string()),
        name: format!("{model_id}-name"),
        function_type,
        model_group_id: None,
        content_hash: Some(format!("{model_id}-hash")),
        format: None,
        content_size_bytes: None,
        is_hidden: false,
        deploy_to_all_nodes: false,
        rate_limiter: None,
    }
}

pub fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

impl TestCluster {
    pub fn worker(&self, node_id: &str) -> &WorkerExecutor {
        &self.workers[node_id]
    }

    pub async fn register(&self, model_id: &str) -> ModelRecord {
        self.register_with(model_id, None).await
    }

    pub async fn register_with(&self, model_id: &str, limiter: Option<RateLimiterConfig>) -> ModelRecord {
        let mut request = register_request(model_id, FunctionType::TextEmbedding);
        request.rate_limiter = limiter;
        self.coordinator
            .register_model(&Caller::superuser(), request)
            .await
            .unwrap()
    }

    pub async fn model(&self, model_id: &str) -> ModelRecord {
        self.docs
            .get(Index::Models, model_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn wait(&self, task_id: &str) -> DeploymentTask {
        let task = self
            .coordinator
            .wait_for_task(task_id, Duration::from_secs(10))
            .await
            .unwrap();
        assert!(task.is_completed(), "task {task_id} did not complete");
        task
    }

    /// Deploy to every eligible node and wait for the outcome.
    pub async fn deploy(&self, model_id: &str) -> DeploymentTask {
        let task_id = self
            .coordinator
            .submit_deploy(&Caller::superuser(), model_id, None)
            .await
            .unwrap();
        self.wait(&task_id).await
    }
}
