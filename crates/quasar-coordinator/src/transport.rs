use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use quasar_common::{
    DeployModelRequest, NodeModelProfile, NodeResult, QuasarError,
    RefreshLimitersRequest, UndeployModelRequest, WorkerApi,
};

use crate::topology::ClusterTopology;

/// Resolves a node id to something that accepts worker calls.
///
/// Failing to connect any target aborts a task before dispatch starts.
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn connect(&self, node_id: &str) -> Result<Arc<dyn WorkerApi>, QuasarError>;
}

/// Workers living in the same process, keyed by node id.
#[derive(Default)]
pub struct LocalTransport {
    workers: DashMap<String, Arc<dyn WorkerApi>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<String>, worker: Arc<dyn WorkerApi>) {
        self.workers.insert(node_id.into(), worker);
    }

    pub fn unregister(&self, node_id: &str) {
        self.workers.remove(node_id);
    }
}

#[async_trait]
impl NodeTransport for LocalTransport {
    async fn connect(&self, node_id: &str) -> Result<Arc<dyn WorkerApi>, QuasarError> {
        self.workers
            .get(node_id)
            .map(|w| w.value().clone())
            .ok_or_else(|| QuasarError::Dispatch {
                node_id: node_id.to_string(),
                message: "no in-process worker registered".into(),
            })
    }
}

/// Reaches workers over HTTP at the address they registered.
pub struct HttpTransport {
    http: reqwest::Client,
    topology: Arc<dyn ClusterTopology>,
}

impl HttpTransport {
    pub fn new(topology: Arc<dyn ClusterTopology>, request_timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, topology })
    }
}

#[async_trait]
impl NodeTransport for HttpTransport {
    async fn connect(&self, node_id: &str) -> Result<Arc<dyn WorkerApi>, QuasarError> {
        let node = self
            .topology
            .node(node_id)
            .await?
            .ok_or_else(|| QuasarError::Dispatch {
                node_id: node_id.to_string(),
                message: "node is not registered".into(),
            })?;
        let base_url = node.address.ok_or_else(|| QuasarError::Dispatch {
            node_id: node_id.to_string(),
            message: "node registered without an address".into(),
        })?;
        Ok(Arc::new(HttpWorkerClient {
            http: self.http.clone(),
            node_id: node_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }))
    }
}

/// [`WorkerApi`] over the worker's HTTP routes.
pub struct HttpWorkerClient {
    http: reqwest::Client,
    node_id: String,
    base_url: String,
}

impl HttpWorkerClient {
    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, QuasarError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        self.send("POST", &url, self.http.post(&url).json(body)).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, QuasarError> {
        let url = format!("{}{}", self.base_url, path);
        self.send("GET", &url, self.http.get(&url)).await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, QuasarError> {
        let dispatch_error = |message: String| QuasarError::Dispatch {
            node_id: self.node_id.clone(),
            message,
        };
        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QuasarError::Timeout {
                    node_id: self.node_id.clone(),
                }
            } else {
                dispatch_error(format!("{method} {url}: {e}"))
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(dispatch_error(format!("{method} {url} returned {status}: {text}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| dispatch_error(format!("decode response from {url}: {e}")))
    }

    fn dispatch_failure(e: QuasarError) -> NodeResult {
        NodeResult::failure(e.failure_kind(), e.to_string())
    }
}

#[async_trait]
impl WorkerApi for HttpWorkerClient {
    async fn deploy(&self, request: DeployModelRequest) -> NodeResult {
        self.post("/v1/deploy", &request)
            .await
            .unwrap_or_else(Self::dispatch_failure)
    }

    async fn undeploy(&self, request: UndeployModelRequest) -> NodeResult {
        self.post("/v1/undeploy", &request)
            .await
            .unwrap_or_else(Self::dispatch_failure)
    }

    async fn refresh_limiters(&self, request: RefreshLimitersRequest) -> Result<(), QuasarError> {
        self.post::<_, serde_json::Value>("/v1/limiters", &request)
            .await
            .map(|_| ())
    }

    async fn model_profile(&self, model_id: &str) -> Option<NodeModelProfile> {
        let url = format!("{}/v1/profile/{}", self.base_url, model_id);
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(node_id=%self.node_id, %model_id, status=%r.status(), "no profile on node");
                return None;
            }
            Err(e) => {
                tracing::warn!(node_id=%self.node_id, %model_id, error=%e, "profile request failed");
                return None;
            }
        };
        resp.json().await.ok()
    }

    async fn deployed_models(&self) -> Result<BTreeSet<String>, QuasarError> {
        let models: Vec<String> = self.get("/v1/models").await?;
        Ok(models.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use quasar_common::{FailureKind, NodeInfo, NodeRole};

    use super::*;
    use crate::topology::StaticTopology;

    #[tokio::test]
    async fn test_local_transport_unknown_node() {
        let transport = LocalTransport::new();
        assert!(matches!(
            transport.connect("nope").await,
            Err(QuasarError::Dispatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_http_transport_requires_address() {
        let mut with_address = NodeInfo::new("a", [NodeRole::Ml]);
        with_address.address = Some("http://10.0.0.1:9190/".into());
        let topology = Arc::new(StaticTopology::new(
            "c0",
            vec![with_address, NodeInfo::new("b", [NodeRole::Ml])],
        ));
        let transport = HttpTransport::new(topology, Duration::from_secs(1)).unwrap();

        assert!(transport.connect("a").await.is_ok());
        assert!(transport.connect("b").await.is_err());
        assert!(transport.connect("c").await.is_err());
    }

    #[test]
    fn test_dispatch_failure_kind() {
        let timeout = HttpWorkerClient::dispatch_failure(QuasarError::Timeout {
            node_id: "a".into(),
        });
        assert_eq!(timeout.failure, Some(FailureKind::Timeout));
        let refused = HttpWorkerClient::dispatch_failure(QuasarError::Dispatch {
            node_id: "a".into(),
            message: "connection refused".into(),
        });
        assert_eq!(refused.failure, Some(FailureKind::Dispatch));
        assert!(!refused.is_success());
    }
}
