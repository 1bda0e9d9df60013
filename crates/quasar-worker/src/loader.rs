use async_trait::async_trait;

use quasar_common::ModelRecord;

/// Brings a model's runtime up or down on this node.
///
/// The executor calls `load` on its own task, so implementations may block
/// inside `spawn_blocking` as they see fit.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model: &ModelRecord) -> anyhow::Result<()>;

    async fn unload(&self, model_id: &str) -> anyhow::Result<()>;
}

/// Loader for models served through an external connector. Local models
/// are rejected since there is no runtime to host them.
#[derive(Debug, Default, Clone)]
pub struct ConnectorLoader;

#[async_trait]
impl ModelLoader for ConnectorLoader {
    async fn load(&self, model: &ModelRecord) -> anyhow::Result<()> {
        anyhow::ensure!(
            model.function_type.is_remote(),
            "no local runtime available for {} model {}",
            model.function_type,
            model.model_id
        );
        tracing::debug!(model_id=%model.model_id, "connector model registered");
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> anyhow::Result<()> {
        tracing::debug!(%model_id, "connector model released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quasar_common::FunctionType;

    #[tokio::test]
    async fn test_connector_loader_only_accepts_remote() {
        let loader = ConnectorLoader;
        let remote = ModelRecord::new("r", "r", FunctionType::Remote, 0);
        let local = ModelRecord::new("l", "l", FunctionType::Kmeans, 0);
        assert!(loader.load(&remote).await.is_ok());
        let err = loader.load(&local).await.unwrap_err();
        assert!(err.to_string().contains("no local runtime"));
    }
}
