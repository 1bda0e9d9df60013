use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::FunctionType;

/// Attribute holding the comma separated function types a node accepts.
pub const FUNCTION_TYPES_ATTRIBUTE: &str = "ml.function_types";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeRole {
    Ml,
    Data,
    Warm,
    Ingest,
    ClusterManager,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuStatus {
    pub index: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

/// A cluster member as seen by the coordinator.
///
/// Workers write this under `/nodes/{node_id}` on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: String,
    pub name: String,

    #[serde(default)]
    pub roles: BTreeSet<NodeRole>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    pub last_heartbeat_ms: u64,

    #[serde(default)]
    pub gpus: Vec<GpuStatus>,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        let node_id = node_id.into();
        Self {
            name: node_id.clone(),
            node_id,
            roles: roles.into_iter().collect(),
            attributes: BTreeMap::new(),
            address: None,
            last_heartbeat_ms: 0,
            gpus: Vec::new(),
        }
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_any_role(&self, roles: &[NodeRole]) -> bool {
        roles.iter().any(|r| self.roles.contains(r))
    }

    pub fn is_stale(&self, now_ms: u64, stale_after_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) > stale_after_ms
    }

    /// False only when the node advertises a function type list that does
    /// not contain `function_type`.
    pub fn accepts(&self, function_type: FunctionType) -> bool {
        match self.attributes.get(FUNCTION_TYPES_ATTRIBUTE) {
            None => true,
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .any(|s| s.eq_ignore_ascii_case(function_type.as_str())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts() {
        let mut node = NodeInfo::new("n1", [NodeRole::Ml]);
        assert!(node.accepts(FunctionType::Kmeans));

        node.attributes.insert(
            FUNCTION_TYPES_ATTRIBUTE.into(),
            "text_embedding, REMOTE".into(),
        );
        assert!(node.accepts(FunctionType::TextEmbedding));
        assert!(node.accepts(FunctionType::Remote));
        assert!(!node.accepts(FunctionType::Kmeans));
    }

    #[test]
    fn test_stale() {
        let mut node = NodeInfo::new("n1", [NodeRole::Data]);
        node.last_heartbeat_ms = 1_000;
        assert!(!node.is_stale(1_500, 1_000));
        assert!(node.is_stale(2_001, 1_000));
        assert!(node.has_any_role(&[NodeRole::Ml, NodeRole::Data]));
        assert!(!node.has_role(NodeRole::Ml));
    }
}
