use std::collections::BTreeSet;
use std::time::Duration;

use quasar_common::{FunctionType, NodeRole};

#[derive(Debug, Clone)]
pub struct SelectorSettings {
    /// Nodes whose last heartbeat is older than this are ignored.
    pub node_stale_ms: u64,
    /// Node ids or names never chosen.
    pub excluded_nodes: BTreeSet<String>,
    pub remote_eligible_roles: Vec<NodeRole>,
    pub local_eligible_roles: Vec<NodeRole>,
    /// Local models only go to ML nodes, even when none exist.
    pub only_run_on_ml_node: bool,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            node_stale_ms: 30_000,
            excluded_nodes: BTreeSet::new(),
            remote_eligible_roles: vec![NodeRole::Ml, NodeRole::Data],
            local_eligible_roles: vec![NodeRole::Data],
            only_run_on_ml_node: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Id of the node running the coordinator.
    pub node_id: String,
    /// Longest wait for node results before missing nodes count as timed out.
    pub dispatch_timeout: Duration,
    pub max_running_tasks: usize,
    pub allow_custom_deployment_plan: bool,
    pub enabled_function_types: BTreeSet<FunctionType>,
    /// Cancel tasks that target a node when it leaves the cluster.
    pub cancel_tasks_on_node_left: bool,
    /// Period of the sync-up pass that rebuilds model records from nodes.
    pub sync_up_interval: Duration,
    /// A `DEPLOYING` record with no running task is settled by sync-up only
    /// once it is older than this.
    pub deploying_grace: Duration,
    pub selector: SelectorSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            node_id: "coordinator-0".into(),
            dispatch_timeout: Duration::from_secs(30),
            max_running_tasks: 10,
            allow_custom_deployment_plan: false,
            enabled_function_types: FunctionType::ALL.into_iter().collect(),
            cancel_tasks_on_node_left: false,
            sync_up_interval: Duration::from_secs(10),
            deploying_grace: Duration::from_secs(120),
            selector: SelectorSettings::default(),
        }
    }
}
