use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quasar_common::{now_ms, NodeInfo};
use quasar_meta::{DocumentStore, Index};

use crate::gpu::read_gpu_statuses;

/// Write this node's [`NodeInfo`] under `/nodes/{node_id}` with a TTL.
pub async fn register_node(docs: &DocumentStore, info: &NodeInfo, ttl_ms: u64) -> anyhow::Result<()> {
    docs.put_with_ttl(Index::Nodes, &info.node_id, info, ttl_ms)
        .await?;
    Ok(())
}

/// Refresh the registration every `interval_ms` until cancelled, then
/// remove it so the coordinator sees the node leave right away.
pub async fn heartbeat_loop(
    docs: DocumentStore,
    mut info: NodeInfo,
    ttl_ms: u64,
    interval_ms: u64,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        info.gpus = read_gpu_statuses().await;
        info.last_heartbeat_ms = now_ms();
        if let Err(e) = register_node(&docs, &info, ttl_ms).await {
            tracing::warn!(error=%e, node_id=%info.node_id, "failed to write heartbeat");
        }
    }

    match docs.delete(Index::Nodes, &info.node_id).await {
        Ok(_) => tracing::info!(node_id=%info.node_id, "node deregistered"),
        Err(e) => tracing::warn!(error=%e, node_id=%info.node_id, "failed to deregister node"),
    }
}
