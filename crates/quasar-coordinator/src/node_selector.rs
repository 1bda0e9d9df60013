use std::collections::BTreeSet;
use std::sync::Arc;

use quasar_common::{now_ms, FunctionType, NodeInfo, NodeRole, QuasarError};

use crate::settings::SelectorSettings;
use crate::topology::ClusterTopology;

/// Picks the nodes a model may run on.
#[derive(Clone)]
pub struct NodeSelector {
    topology: Arc<dyn ClusterTopology>,
    settings: SelectorSettings,
}

impl NodeSelector {
    pub fn new(topology: Arc<dyn ClusterTopology>, settings: SelectorSettings) -> Self {
        Self { topology, settings }
    }

    pub fn topology(&self) -> &Arc<dyn ClusterTopology> {
        &self.topology
    }

    /// Ids of every node eligible for `function_type`.
    ///
    /// Stale, excluded and warm nodes never qualify, nor nodes whose
    /// advertised function types leave this one out. Remote models go to
    /// nodes holding a remote-eligible role. Local models go to ML nodes
    /// when the cluster has any, otherwise to local-eligible roles unless
    /// restricted to ML nodes.
    pub async fn eligible_nodes(
        &self,
        function_type: FunctionType,
    ) -> Result<BTreeSet<String>, QuasarError> {
        let nodes = self.topology.list_nodes().await?;
        let eligible = self.select(&nodes, function_type, now_ms());
        if eligible.is_empty() {
            return Err(QuasarError::NoEligibleNodes(format!(
                "no eligible node found for {function_type} model"
            )));
        }
        Ok(eligible)
    }

    fn select(&self, nodes: &[NodeInfo], function_type: FunctionType, now_ms: u64) -> BTreeSet<String> {
        let s = &self.settings;
        let live: Vec<&NodeInfo> = nodes
            .iter()
            .filter(|n| !n.is_stale(now_ms, s.node_stale_ms))
            .filter(|n| !s.excluded_nodes.contains(&n.node_id) && !s.excluded_nodes.contains(&n.name))
            .filter(|n| !n.has_role(NodeRole::Warm))
            .filter(|n| n.accepts(function_type))
            .collect();

        let ids = |pred: &dyn Fn(&NodeInfo) -> bool| -> BTreeSet<String> {
            live.iter()
                .filter(|n| pred(n))
                .map(|n| n.node_id.clone())
                .collect()
        };

        if function_type.is_remote() {
            return ids(&|n| n.has_any_role(&s.remote_eligible_roles));
        }

        let ml_nodes = ids(&|n| n.has_role(NodeRole::Ml));
        if !ml_nodes.is_empty() || s.only_run_on_ml_node {
            return ml_nodes;
        }
        ids(&|n| n.has_any_role(&s.local_eligible_roles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::StaticTopology;

    const NOW: u64 = 1_000_000;

    fn node(id: &str, roles: &[NodeRole]) -> NodeInfo {
        let mut n = NodeInfo::new(id, roles.iter().copied());
        n.last_heartbeat_ms = NOW;
        n
    }

    fn selector(settings: SelectorSettings) -> NodeSelector {
        NodeSelector::new(Arc::new(StaticTopology::new("c0", Vec::new())), settings)
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_models_prefer_ml_nodes() {
        let nodes = vec![
            node("ml1", &[NodeRole::Ml]),
            node("d1", &[NodeRole::Data]),
            node("ml2", &[NodeRole::Ml, NodeRole::Data]),
        ];
        let sel = selector(SelectorSettings::default());
        assert_eq!(sel.select(&nodes, FunctionType::TextEmbedding, NOW), set(&["ml1", "ml2"]));
    }

    #[test]
    fn test_local_models_fall_back_to_data_nodes() {
        let nodes = vec![node("d1", &[NodeRole::Data]), node("i1", &[NodeRole::Ingest])];
        let sel = selector(SelectorSettings::default());
        assert_eq!(sel.select(&nodes, FunctionType::Kmeans, NOW), set(&["d1"]));

        let ml_only = selector(SelectorSettings {
            only_run_on_ml_node: true,
            ..Default::default()
        });
        assert!(ml_only.select(&nodes, FunctionType::Kmeans, NOW).is_empty());
    }

    #[test]
    fn test_remote_models_use_ml_and_data_nodes() {
        let nodes = vec![
            node("ml1", &[NodeRole::Ml]),
            node("d1", &[NodeRole::Data]),
            node("cm", &[NodeRole::ClusterManager]),
        ];
        let sel = selector(SelectorSettings::default());
        assert_eq!(sel.select(&nodes, FunctionType::Remote, NOW), set(&["d1", "ml1"]));
    }

    #[test]
    fn test_excluded_stale_and_warm_nodes_dropped() {
        let mut stale = node("stale", &[NodeRole::Ml]);
        stale.last_heartbeat_ms = NOW - 60_000;
        let mut named = node("n9", &[NodeRole::Ml]);
        named.name = "gpu-box".into();
        let nodes = vec![
            stale,
            named,
            node("warm", &[NodeRole::Ml, NodeRole::Warm]),
            node("ex", &[NodeRole::Ml]),
            node("ok", &[NodeRole::Ml]),
        ];
        let sel = selector(SelectorSettings {
            excluded_nodes: set(&["ex", "gpu-box"]),
            ..Default::default()
        });
        assert_eq!(sel.select(&nodes, FunctionType::TextEmbedding, NOW), set(&["ok"]));
    }

    #[test]
    fn test_function_type_attribute() {
        let mut remote_only = node("r", &[NodeRole::Ml]);
        remote_only
            .attributes
            .insert(quasar_common::node::FUNCTION_TYPES_ATTRIBUTE.into(), "REMOTE".into());
        let nodes = vec![remote_only, node("any", &[NodeRole::Ml])];
        let sel = selector(SelectorSettings::default());
        assert_eq!(sel.select(&nodes, FunctionType::TextEmbedding, NOW), set(&["any"]));
        assert_eq!(sel.select(&nodes, FunctionType::Remote, NOW), set(&["any", "r"]));
    }

    #[tokio::test]
    async fn test_no_eligible_nodes_is_an_error() {
        let sel = NodeSelector::new(
            Arc::new(StaticTopology::new("c0", vec![node("i", &[NodeRole::Ingest])])),
            SelectorSettings::default(),
        );
        assert!(matches!(
            sel.eligible_nodes(FunctionType::TextEmbedding).await,
            Err(QuasarError::NoEligibleNodes(_))
        ));
    }
}
