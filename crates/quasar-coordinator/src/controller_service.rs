use std::collections::BTreeSet;

use futures_util::future::join_all;

use quasar_common::{
    now_ms, AccessController, Caller, LimiterUpdateOutcome, ModelRecord, QuasarError,
    RateLimiterConfig, RefreshLimitersRequest,
};
use quasar_meta::Index;

use crate::coordinator::DeploymentCoordinator;
use crate::metrics::SharedMetrics;

/// Model and per-user rate limiter updates.
///
/// Every change is stored first. A serving model then either gets its
/// limiters resized in place on each worker or, when the time unit moved
/// between valid configurations, a redeploy to its current nodes.
#[derive(Clone)]
pub struct ControllerService {
    coordinator: DeploymentCoordinator,
}

impl ControllerService {
    pub fn new(coordinator: DeploymentCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn update_model_rate_limiter(
        &self,
        caller: &Caller,
        model_id: &str,
        update: RateLimiterConfig,
    ) -> Result<LimiterUpdateOutcome, QuasarError> {
        self.coordinator.get_model(caller, model_id).await?;

        // the merge base must be the stored limiter as of the write
        let (updated, merged, redeploy) = {
            let _guard = self.coordinator.lock_model(model_id).await;
            let before = self.coordinator.require_model(model_id).await?.rate_limiter;
            if !RateLimiterConfig::update_validity_pre_check(Some(&before), Some(&update)) {
                return Ok(LimiterUpdateOutcome::Unchanged);
            }
            let redeploy =
                RateLimiterConfig::is_deploy_required_after_update(Some(&before), Some(&update));
            let merged = before.merge(&update);
            merged.require_valid_or_empty("model rate limiter")?;
            self.ensure_no_running_task(model_id)?;
            let updated = self
                .write_record(model_id, |r| r.rate_limiter = merged.clone())
                .await?;
            (updated, merged, redeploy)
        };
        tracing::info!(%model_id, limit=?merged.limit, unit=?merged.unit, redeploy, "model rate limiter updated");
        self.apply(updated, redeploy).await
    }

    pub async fn create_controller(
        &self,
        caller: &Caller,
        controller: AccessController,
    ) -> Result<LimiterUpdateOutcome, QuasarError> {
        let model_id = controller.model_id.clone();
        self.coordinator.get_model(caller, &model_id).await?;
        let redeploy =
            AccessController::new(&model_id).is_deploy_required_after_update(Some(&controller));

        let updated = {
            let _guard = self.coordinator.lock_model(&model_id).await;
            self.ensure_no_running_task(&model_id)?;
            let created = self
                .coordinator
                .docs()
                .create(Index::Controllers, &model_id, &controller)
                .await
                .map_err(QuasarError::store)?;
            if !created {
                return Err(QuasarError::Conflict(format!(
                    "controller for model {model_id} already exists"
                )));
            }
            self.write_record(&model_id, |r| r.controller = Some(controller.clone()))
                .await?
        };
        tracing::info!(%model_id, users=controller.user_rate_limiter.len(), "controller created");
        self.apply(updated, redeploy).await
    }

    /// Merge `incoming` into the stored controller. A model without one is
    /// treated as having an empty controller.
    pub async fn update_controller(
        &self,
        caller: &Caller,
        model_id: &str,
        incoming: AccessController,
    ) -> Result<LimiterUpdateOutcome, QuasarError> {
        if incoming.model_id != model_id {
            return Err(QuasarError::Validation(format!(
                "controller model_id {} does not match model {model_id}",
                incoming.model_id
            )));
        }
        self.coordinator.get_model(caller, model_id).await?;

        let (updated, redeploy) = {
            let _guard = self.coordinator.lock_model(model_id).await;
            self.ensure_no_running_task(model_id)?;
            let mut current = self
                .coordinator
                .docs()
                .get::<AccessController>(Index::Controllers, model_id)
                .await
                .map_err(QuasarError::store)?
                .unwrap_or_else(|| AccessController::new(model_id));
            if !current.is_update_meaningful(&incoming) {
                return Ok(LimiterUpdateOutcome::Unchanged);
            }
            let redeploy = current.is_deploy_required_after_update(Some(&incoming));
            current.update(Some(&incoming));

            self.coordinator
                .docs()
                .put(Index::Controllers, model_id, &current)
                .await
                .map_err(QuasarError::store)?;
            let updated = self
                .write_record(model_id, |r| r.controller = Some(current.clone()))
                .await?;
            (updated, redeploy)
        };
        tracing::info!(%model_id, redeploy, "controller updated");
        self.apply(updated, redeploy).await
    }

    pub async fn get_controller(
        &self,
        caller: &Caller,
        model_id: &str,
    ) -> Result<AccessController, QuasarError> {
        self.coordinator.get_model(caller, model_id).await?;
        self.coordinator
            .docs()
            .get(Index::Controllers, model_id)
            .await
            .map_err(QuasarError::store)?
            .ok_or_else(|| QuasarError::NotFound(format!("controller for model {model_id}")))
    }

    /// Remove the controller; serving nodes drop their per-user buckets.
    pub async fn delete_controller(
        &self,
        caller: &Caller,
        model_id: &str,
    ) -> Result<LimiterUpdateOutcome, QuasarError> {
        self.coordinator.get_model(caller, model_id).await?;
        let updated = {
            let _guard = self.coordinator.lock_model(model_id).await;
            self.ensure_no_running_task(model_id)?;
            let deleted = self
                .coordinator
                .docs()
                .delete(Index::Controllers, model_id)
                .await
                .map_err(QuasarError::store)?;
            if !deleted {
                return Err(QuasarError::NotFound(format!(
                    "controller for model {model_id}"
                )));
            }
            self.write_record(model_id, |r| r.controller = None).await?
        };
        tracing::info!(%model_id, "controller deleted");
        self.apply(updated, false).await
    }

    fn ensure_no_running_task(&self, model_id: &str) -> Result<(), QuasarError> {
        match self.coordinator.tasks().active_for_model(model_id) {
            Some(task_id) => Err(QuasarError::Conflict(format!(
                "model {model_id} has running task {task_id}, retry once it completes"
            ))),
            None => Ok(()),
        }
    }

    async fn write_record<F>(&self, model_id: &str, mut change: F) -> Result<ModelRecord, QuasarError>
    where
        F: FnMut(&mut ModelRecord),
    {
        let now = now_ms();
        self.coordinator
            .docs()
            .update(Index::Models, model_id, |r: &mut ModelRecord| {
                change(r);
                r.touch(now);
                true
            })
            .await
            .map_err(QuasarError::store)?
            .ok_or_else(|| QuasarError::NotFound(format!("model {model_id}")))
    }

    /// Bring serving nodes in line with a stored limiter change.
    async fn apply(
        &self,
        record: ModelRecord,
        redeploy: bool,
    ) -> Result<LimiterUpdateOutcome, QuasarError> {
        let model_id = record.model_id.clone();
        if !record.state.is_serving() || record.current_worker_nodes.is_empty() {
            return Ok(LimiterUpdateOutcome::Stored);
        }

        let metrics = self.coordinator.metrics();
        if redeploy {
            let task_id = self
                .coordinator
                .start_deploy_task(&model_id, record.current_worker_nodes.clone())
                .await?;
            SharedMetrics::inc(&metrics.redeploys_total);
            return Ok(LimiterUpdateOutcome::Redeploying { task_id });
        }

        let request = RefreshLimitersRequest::from_record(&record);
        let transport = self.coordinator.transport();
        let model_id = model_id.as_str();
        let refreshes = record.current_worker_nodes.iter().map(|node_id| {
            let request = request.clone();
            async move {
                let refreshed = match transport.connect(node_id).await {
                    Ok(worker) => worker.refresh_limiters(request).await,
                    Err(e) => Err(e),
                };
                match refreshed {
                    Ok(()) => Some(node_id.clone()),
                    Err(e) => {
                        tracing::warn!(%model_id, %node_id, error=%e, "limiter refresh failed");
                        None
                    }
                }
            }
        });
        let nodes: BTreeSet<String> = join_all(refreshes).await.into_iter().flatten().collect();
        SharedMetrics::inc(&metrics.limiter_refreshes_total);
        Ok(LimiterUpdateOutcome::Refreshed { nodes })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use quasar_common::{ModelState, TimeUnit};
    use quasar_meta::{MemoryMetaStore, MetaStore, WatchStream};

    use super::*;
    use crate::test_support::{set, ClusterBuilder, TestCluster};

    /// Memory store whose reads take a while, so concurrent updates overlap.
    struct SlowReads(MemoryMetaStore);

    #[async_trait]
    impl MetaStore for SlowReads {
        async fn put(&self, key: &str, value: Vec<u8>, ttl_ms: Option<u64>) -> anyhow::Result<u64> {
            self.0.put(key, value, ttl_ms).await
        }

        async fn get(&self, key: &str) -> anyhow::Result<Option<(Vec<u8>, u64)>> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.get(key).await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<bool> {
            self.0.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> anyhow::Result<Vec<(String, Vec<u8>, u64)>> {
            self.0.list_prefix(prefix).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected_revision: u64,
            value: Vec<u8>,
        ) -> anyhow::Result<(bool, u64)> {
            self.0.compare_and_swap(key, expected_revision, value).await
        }

        async fn watch_prefix(
            &self,
            prefix: &str,
            start_revision_exclusive: Option<u64>,
        ) -> anyhow::Result<WatchStream> {
            self.0.watch_prefix(prefix, start_revision_exclusive).await
        }
    }

    fn per_second(limit: &str) -> RateLimiterConfig {
        RateLimiterConfig::new(limit, TimeUnit::Seconds)
    }

    async fn serving_cluster(limiter: Option<RateLimiterConfig>) -> (TestCluster, ControllerService) {
        let cluster = ClusterBuilder::new().nodes(&["a", "b"]).build();
        cluster.register_with("m1", limiter).await;
        cluster.deploy("m1").await;
        let service = ControllerService::new(cluster.coordinator.clone());
        (cluster, service)
    }

    #[tokio::test]
    async fn test_limit_change_refreshes_in_place() {
        let (cluster, service) = serving_cluster(Some(per_second("10"))).await;
        let caller = Caller::superuser();

        let outcome = service
            .update_model_rate_limiter(
                &caller,
                "m1",
                RateLimiterConfig {
                    limit: Some("20".into()),
                    unit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, LimiterUpdateOutcome::Refreshed { nodes: set(&["a", "b"]) });
        assert_eq!(cluster.model("m1").await.rate_limiter, per_second("20"));
        let bucket = cluster.worker("a").cache().get_rate_limiter("m1").unwrap();
        assert_eq!(bucket.spec().capacity, 20.0);

        let again = service
            .update_model_rate_limiter(&caller, "m1", per_second("20"))
            .await
            .unwrap();
        assert_eq!(again, LimiterUpdateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_unit_change_redeploys() {
        let (cluster, service) = serving_cluster(Some(per_second("10"))).await;

        let outcome = service
            .update_model_rate_limiter(
                &Caller::superuser(),
                "m1",
                RateLimiterConfig {
                    limit: None,
                    unit: Some(TimeUnit::Minutes),
                },
            )
            .await
            .unwrap();
        let LimiterUpdateOutcome::Redeploying { task_id } = outcome else {
            panic!("expected a redeploy, got {outcome:?}");
        };
        let task = cluster.wait(&task_id).await;
        assert_eq!(task.target_nodes, set(&["a", "b"]));
        assert_eq!(task.outcome, Some(ModelState::Deployed));

        let record = cluster.model("m1").await;
        assert_eq!(record.rate_limiter.unit, Some(TimeUnit::Minutes));
        let bucket = cluster.worker("b").cache().get_rate_limiter("m1").unwrap();
        assert!((bucket.spec().refill_per_second - 10.0 / 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_on_idle_model_is_only_stored() {
        let cluster = ClusterBuilder::new().nodes(&["a"]).build();
        cluster.register("m1").await;
        let service = ControllerService::new(cluster.coordinator.clone());

        let outcome = service
            .update_model_rate_limiter(&Caller::superuser(), "m1", per_second("3"))
            .await
            .unwrap();
        assert_eq!(outcome, LimiterUpdateOutcome::Stored);
        assert_eq!(cluster.model("m1").await.rate_limiter, per_second("3"));
    }

    #[tokio::test]
    async fn test_partial_limiter_rejected_without_base() {
        let cluster = ClusterBuilder::new().nodes(&["a"]).build();
        cluster.register("m1").await;
        let service = ControllerService::new(cluster.coordinator.clone());

        let result = service
            .update_model_rate_limiter(
                &Caller::superuser(),
                "m1",
                RateLimiterConfig {
                    limit: Some("3".into()),
                    unit: None,
                },
            )
            .await;
        assert!(matches!(result, Err(QuasarError::Validation(_))));
        assert!(cluster.model("m1").await.rate_limiter.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_limiter_updates_keep_both_fields() {
        let cluster = ClusterBuilder::new()
            .store(Arc::new(SlowReads(MemoryMetaStore::new())))
            .nodes(&["a"])
            .build();
        cluster.register_with("m1", Some(per_second("10"))).await;
        let service = ControllerService::new(cluster.coordinator.clone());
        let caller = Caller::superuser();

        let (limit, unit) = tokio::join!(
            service.update_model_rate_limiter(
                &caller,
                "m1",
                RateLimiterConfig {
                    limit: Some("20".into()),
                    unit: None,
                },
            ),
            service.update_model_rate_limiter(
                &caller,
                "m1",
                RateLimiterConfig {
                    limit: None,
                    unit: Some(TimeUnit::Minutes),
                },
            ),
        );
        assert_eq!(limit.unwrap(), LimiterUpdateOutcome::Stored);
        assert_eq!(unit.unwrap(), LimiterUpdateOutcome::Stored);
        assert_eq!(
            cluster.model("m1").await.rate_limiter,
            RateLimiterConfig::new("20", TimeUnit::Minutes)
        );
    }

    #[tokio::test]
    async fn test_controller_lifecycle() {
        let (cluster, service) = serving_cluster(None).await;
        let caller = Caller::superuser();

        let controller = AccessController::new("m1").with_user("alice", Some(per_second("2")));
        let created = service.create_controller(&caller, controller.clone()).await.unwrap();
        let LimiterUpdateOutcome::Redeploying { task_id } = created else {
            panic!("expected a redeploy, got {created:?}");
        };
        cluster.wait(&task_id).await;
        let worker = cluster.worker("a").cache();
        assert_eq!(worker.get_user_rate_limiter("m1", "alice").unwrap().spec().capacity, 2.0);
        assert!(matches!(
            service.create_controller(&caller, controller).await,
            Err(QuasarError::Conflict(_))
        ));

        let resize = AccessController::new("m1").with_user(
            "alice",
            Some(RateLimiterConfig {
                limit: Some("5".into()),
                unit: None,
            }),
        );
        let updated = service.update_controller(&caller, "m1", resize).await.unwrap();
        assert_eq!(updated, LimiterUpdateOutcome::Refreshed { nodes: set(&["a", "b"]) });
        assert_eq!(worker.get_user_rate_limiter("m1", "alice").unwrap().spec().capacity, 5.0);
        let same = AccessController::new("m1").with_user("alice", Some(per_second("5")));
        assert_eq!(
            service.update_controller(&caller, "m1", same).await.unwrap(),
            LimiterUpdateOutcome::Unchanged
        );

        let stored = service.get_controller(&caller, "m1").await.unwrap();
        assert_eq!(
            stored.user_rate_limiter["alice"],
            Some(per_second("5"))
        );
        assert_eq!(cluster.model("m1").await.controller, Some(stored));

        let deleted = service.delete_controller(&caller, "m1").await.unwrap();
        assert!(matches!(deleted, LimiterUpdateOutcome::Refreshed { .. }));
        assert!(worker.get_user_rate_limiter("m1", "alice").is_none());
        assert!(cluster.model("m1").await.controller.is_none());
        assert!(matches!(
            service.get_controller(&caller, "m1").await,
            Err(QuasarError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_controller_rejects_mismatched_model() {
        let (_cluster, service) = serving_cluster(None).await;
        let result = service
            .update_controller(&Caller::superuser(), "m1", AccessController::new("other"))
            .await;
        assert!(matches!(result, Err(QuasarError::Validation(_))));
    }

    #[tokio::test]
    async fn test_limiter_update_conflicts_with_running_task() {
        let cluster = ClusterBuilder::new()
            .node("a", crate::test_support::ScriptedLoader::slow(std::time::Duration::from_millis(300)))
            .build();
        cluster.register("m1").await;
        let service = ControllerService::new(cluster.coordinator.clone());
        let caller = Caller::superuser();

        let task_id = cluster.coordinator.submit_deploy(&caller, "m1", None).await.unwrap();
        assert!(matches!(
            service.update_model_rate_limiter(&caller, "m1", per_second("1")).await,
            Err(QuasarError::Conflict(_))
        ));
        cluster.wait(&task_id).await;
    }
}
