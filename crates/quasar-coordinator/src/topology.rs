use async_trait::async_trait;

use quasar_common::{NodeInfo, QuasarError};
use quasar_meta::{DocumentStore, Index};

/// Source of cluster membership.
#[async_trait]
pub trait ClusterTopology: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, QuasarError>;

    fn local_node_id(&self) -> &str;

    async fn node(&self, node_id: &str) -> Result<Option<NodeInfo>, QuasarError> {
        Ok(self
            .list_nodes()
            .await?
            .into_iter()
            .find(|n| n.node_id == node_id))
    }
}

/// Fixed node list.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    local_node_id: String,
    nodes: Vec<NodeInfo>,
}

impl StaticTopology {
    pub fn new(local_node_id: impl Into<String>, nodes: Vec<NodeInfo>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            nodes,
        }
    }
}

#[async_trait]
impl ClusterTopology for StaticTopology {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, QuasarError> {
        Ok(self.nodes.clone())
    }

    fn local_node_id(&self) -> &str {
        &self.local_node_id
    }
}

/// Nodes registered by worker heartbeats under `/nodes/`.
#[derive(Clone)]
pub struct MetaTopology {
    local_node_id: String,
    docs: DocumentStore,
}

impl MetaTopology {
    pub fn new(local_node_id: impl Into<String>, docs: DocumentStore) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            docs,
        }
    }
}

#[async_trait]
impl ClusterTopology for MetaTopology {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>, QuasarError> {
        self.docs
            .search(Index::Nodes, |_: &NodeInfo| true)
            .await
            .map_err(QuasarError::store)
    }

    fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    async fn node(&self, node_id: &str) -> Result<Option<NodeInfo>, QuasarError> {
        self.docs
            .get(Index::Nodes, node_id)
            .await
            .map_err(QuasarError::store)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use quasar_common::NodeRole;
    use quasar_meta::MemoryMetaStore;

    use super::*;

    #[tokio::test]
    async fn test_meta_topology_reads_heartbeats() {
        let docs = DocumentStore::new(Arc::new(MemoryMetaStore::new()));
        let topology = MetaTopology::new("c0", docs.clone());
        assert!(topology.list_nodes().await.unwrap().is_empty());

        docs.put(Index::Nodes, "n1", &NodeInfo::new("n1", [NodeRole::Ml]))
            .await
            .unwrap();
        docs.put(Index::Nodes, "n2", &NodeInfo::new("n2", [NodeRole::Data]))
            .await
            .unwrap();

        assert_eq!(topology.list_nodes().await.unwrap().len(), 2);
        assert!(topology.node("n2").await.unwrap().unwrap().has_role(NodeRole::Data));
        assert!(topology.node("n3").await.unwrap().is_none());
        assert_eq!(topology.local_node_id(), "c0");
    }

    #[tokio::test]
    async fn test_static_topology_node_lookup() {
        let topology = StaticTopology::new("c0", vec![NodeInfo::new("a", [NodeRole::Ml])]);
        assert!(topology.node("a").await.unwrap().is_some());
        assert!(topology.node("b").await.unwrap().is_none());
    }
}
