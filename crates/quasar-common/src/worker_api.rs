use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::QuasarError;
use crate::messages::{
    DeployModelRequest, NodeModelProfile, RefreshLimitersRequest, UndeployModelRequest,
};
use crate::task::NodeResult;

/// Operations a worker node accepts from the coordinator.
///
/// Implemented by the worker's executor in process and by the HTTP client
/// the coordinator uses for remote nodes. Deploy and undeploy never fail as
/// a call; failures come back as a failed [`NodeResult`].
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn deploy(&self, request: DeployModelRequest) -> NodeResult;

    async fn undeploy(&self, request: UndeployModelRequest) -> NodeResult;

    async fn refresh_limiters(&self, request: RefreshLimitersRequest) -> Result<(), QuasarError>;

    async fn model_profile(&self, model_id: &str) -> Option<NodeModelProfile>;

    /// Ids of every model loaded on the node.
    async fn deployed_models(&self) -> Result<BTreeSet<String>, QuasarError>;
}
