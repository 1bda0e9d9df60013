use std::collections::BTreeMap;

use clap::Parser;

use quasar_common::{NodeInfo, NodeRole};

use crate::executor::ExecutorSettings;

#[derive(Debug, Parser)]
#[command(name = "quasar-worker", about = "Loads models and enforces admission on one node")]
pub struct Args {
    #[arg(long, env = "QUASAR_NODE_ID", default_value = "worker-0")]
    pub node_id: String,

    /// Display name; defaults to the node id.
    #[arg(long, env = "QUASAR_NODE_NAME")]
    pub node_name: Option<String>,

    /// Comma separated: ml, data, warm, ingest, cluster_manager.
    #[arg(long, env = "QUASAR_NODE_ROLES", value_delimiter = ',', default_value = "ml")]
    pub roles: Vec<String>,

    /// Extra node attributes as key=value, e.g. ml.function_types=REMOTE.
    #[arg(long = "attribute", value_parser = parse_attribute)]
    pub attributes: Vec<(String, String)>,

    #[arg(long, env = "QUASAR_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "QUASAR_META_ROOT", default_value = "/quasar")]
    pub meta_root: String,

    #[arg(long, env = "QUASAR_WORKER_LISTEN", default_value = "0.0.0.0:9190")]
    pub listen: String,

    /// Address the coordinator uses to reach this worker.
    #[arg(long, env = "QUASAR_WORKER_ADVERTISE")]
    pub advertise_url: Option<String>,

    #[arg(long, default_value_t = 10_000)]
    pub heartbeat_ttl_ms: u64,

    #[arg(long, default_value_t = 3_000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 4)]
    pub max_concurrent_loads: usize,

    #[arg(long, default_value_t = 16)]
    pub max_models_per_node: usize,

    #[arg(long, default_value_t = 85.0)]
    pub memory_threshold_percent: f64,

    /// Also trip on GPU memory usage when set.
    #[arg(long)]
    pub gpu_memory_threshold_percent: Option<f64>,

    #[arg(long, default_value_t = 5_000)]
    pub breaker_sample_interval_ms: u64,

    #[arg(long, env = "QUASAR_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

pub fn parse_role(raw: &str) -> Option<NodeRole> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ml" => Some(NodeRole::Ml),
        "data" => Some(NodeRole::Data),
        "warm" => Some(NodeRole::Warm),
        "ingest" => Some(NodeRole::Ingest),
        "cluster_manager" | "master" => Some(NodeRole::ClusterManager),
        _ => None,
    }
}

impl Args {
    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            node_id: self.node_id.clone(),
            max_concurrent_loads: self.max_concurrent_loads,
            max_models_per_node: self.max_models_per_node,
        }
    }

    pub fn node_info(&self) -> NodeInfo {
        let roles = self.roles.iter().filter_map(|raw| {
            let role = parse_role(raw);
            if role.is_none() {
                tracing::warn!(role=%raw, "unknown node role, skipping");
            }
            role
        });
        let mut info = NodeInfo::new(self.node_id.clone(), roles);
        if let Some(name) = &self.node_name {
            info.name = name.clone();
        }
        info.attributes = self.attributes.iter().cloned().collect::<BTreeMap<_, _>>();
        info.address = Some(
            self.advertise_url
                .clone()
                .unwrap_or_else(|| format!("http://{}", self.listen)),
        );
        info
    }
}
