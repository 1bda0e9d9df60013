use std::time::Duration;

use clap::Parser;

use quasar_common::{FunctionType, NodeRole};

use crate::settings::{CoordinatorSettings, SelectorSettings};

#[derive(Debug, Parser)]
#[command(name = "quasar-coordinator", about = "Places models on worker nodes and tracks deployments")]
pub struct Args {
    #[arg(long, env = "QUASAR_NODE_ID", default_value = "coordinator-0")]
    pub node_id: String,

    #[arg(long, env = "QUASAR_ETCD_ENDPOINT", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoint: String,

    #[arg(long, env = "QUASAR_META_ROOT", default_value = "/quasar")]
    pub meta_root: String,

    #[arg(long, env = "QUASAR_COORDINATOR_LISTEN", default_value = "0.0.0.0:9180")]
    pub listen: String,

    #[arg(long, default_value_t = 30_000)]
    pub dispatch_timeout_ms: u64,

    #[arg(long, default_value_t = 10)]
    pub max_running_tasks: usize,

    #[arg(long, env = "QUASAR_ALLOW_CUSTOM_DEPLOYMENT_PLAN", default_value_t = false)]
    pub allow_custom_deployment_plan: bool,

    /// Function types accepted for deployment; all when empty.
    #[arg(long, value_delimiter = ',')]
    pub enabled_function_types: Vec<String>,

    #[arg(long, default_value_t = false)]
    pub cancel_tasks_on_node_left: bool,

    #[arg(long, env = "QUASAR_SYNC_UP_INTERVAL_MS", default_value_t = 10_000)]
    pub sync_up_interval_ms: u64,

    #[arg(long, default_value_t = 120_000)]
    pub deploying_grace_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub node_stale_ms: u64,

    #[arg(long, value_delimiter = ',')]
    pub exclude_nodes: Vec<String>,

    #[arg(long, env = "QUASAR_ONLY_RUN_ON_ML_NODE", default_value_t = false)]
    pub only_run_on_ml_node: bool,

    /// Only ML nodes are eligible for remote models.
    #[arg(long, default_value_t = false)]
    pub remote_on_ml_only: bool,

    #[arg(long, env = "QUASAR_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "QUASAR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "QUASAR_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn settings(&self) -> anyhow::Result<CoordinatorSettings> {
        let enabled_function_types = if self.enabled_function_types.is_empty() {
            FunctionType::ALL.into_iter().collect()
        } else {
            self.enabled_function_types
                .iter()
                .map(|raw| raw.parse::<FunctionType>())
                .collect::<Result<_, _>>()?
        };

        let remote_eligible_roles = if self.remote_on_ml_only {
            vec![NodeRole::Ml]
        } else {
            vec![NodeRole::Ml, NodeRole::Data]
        };

        Ok(CoordinatorSettings {
            node_id: self.node_id.clone(),
            dispatch_timeout: Duration::from_millis(self.dispatch_timeout_ms),
            max_running_tasks: self.max_running_tasks,
            allow_custom_deployment_plan: self.allow_custom_deployment_plan,
            enabled_function_types,
            cancel_tasks_on_node_left: self.cancel_tasks_on_node_left,
            sync_up_interval: Duration::from_millis(self.sync_up_interval_ms),
            deploying_grace: Duration::from_millis(self.deploying_grace_ms),
            selector: SelectorSettings {
                node_stale_ms: self.node_stale_ms,
                excluded_nodes: self
                    .exclude_nodes
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                remote_eligible_roles,
                only_run_on_ml_node: self.only_run_on_ml_node,
                ..SelectorSettings::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_args() {
        let args = Args::parse_from([
            "quasar-coordinator",
            "--enabled-function-types",
            "remote,text_embedding",
            "--exclude-nodes",
            "n1, n2",
            "--dispatch-timeout-ms",
            "500",
            "--sync-up-interval-ms",
            "2000",
        ]);
        let settings = args.settings().unwrap();
        assert_eq!(settings.enabled_function_types.len(), 2);
        assert!(settings.enabled_function_types.contains(&FunctionType::Remote));
        assert_eq!(settings.selector.excluded_nodes.len(), 2);
        assert_eq!(settings.dispatch_timeout, Duration::from_millis(500));
        assert_eq!(settings.sync_up_interval, Duration::from_secs(2));
        assert_eq!(settings.deploying_grace, Duration::from_secs(120));
    }

    #[test]
    fn test_unknown_function_type_rejected() {
        let args = Args::parse_from(["quasar-coordinator", "--enabled-function-types", "llm"]);
        assert!(args.settings().is_err());
    }
}
