use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use quasar_common::{now_ms, ModelRecord, ModelState, QuasarError, UndeployModelRequest};
use quasar_meta::Index;

use crate::coordinator::DeploymentCoordinator;
use crate::metrics::SharedMetrics;

/// What one sync-up pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Nodes that answered with their loaded models.
    pub nodes_reached: BTreeSet<String>,
    pub models_updated: Vec<String>,
    /// `(model_id, node_id)` pairs unloaded because no record expects them.
    pub orphans_unloaded: Vec<(String, String)>,
}

/// Result of syncing a single model.
#[derive(Default)]
struct ModelSync {
    updated: bool,
    unloaded: Vec<String>,
}

impl DeploymentCoordinator {
    /// Rebuild every model's serving set from what the nodes actually hold.
    ///
    /// Reachable nodes are authoritative for their own entries. A recorded
    /// node that did not answer keeps its entry while it is still part of
    /// the cluster. Models with a running task are skipped, as are records
    /// written after the pass started. A `DEPLOYING` record with no task is
    /// settled once it is older than the deploying grace period. Models
    /// loaded on a node while their record expects none are unloaded.
    pub async fn sync_up(&self) -> Result<SyncReport, QuasarError> {
        let started = now_ms();
        let members: BTreeSet<String> = self
            .topology()
            .list_nodes()
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();

        let lookups = members.iter().map(|node_id| async move {
            let worker = match self.transport().connect(node_id).await {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::debug!(%node_id, error=%e, "node unreachable during sync-up");
                    return None;
                }
            };
            match worker.deployed_models().await {
                Ok(models) => Some((node_id.clone(), models)),
                Err(e) => {
                    tracing::debug!(%node_id, error=%e, "failed to list models during sync-up");
                    None
                }
            }
        });

        let mut reached = BTreeSet::new();
        let mut loaded_on: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (node_id, models) in join_all(lookups).await.into_iter().flatten() {
            for model_id in models {
                loaded_on.entry(model_id).or_default().insert(node_id.clone());
            }
            reached.insert(node_id);
        }

        let records: Vec<ModelRecord> = self
            .docs()
            .search(Index::Models, |_: &ModelRecord| true)
            .await
            .map_err(QuasarError::store)?;
        let mut model_ids: BTreeSet<String> = records.into_iter().map(|r| r.model_id).collect();
        model_ids.extend(loaded_on.keys().cloned());

        let mut report = SyncReport::default();
        for model_id in model_ids {
            let reporting = loaded_on.remove(&model_id).unwrap_or_default();
            let synced = self
                .sync_model(&model_id, reporting, &members, &reached, started)
                .await?;
            if synced.updated {
                report.models_updated.push(model_id.clone());
            }
            for node_id in synced.unloaded {
                report.orphans_unloaded.push((model_id.clone(), node_id));
            }
        }
        report.nodes_reached = reached;

        let metrics = self.metrics();
        SharedMetrics::add(&metrics.models_resynced_total, report.models_updated.len() as u64);
        SharedMetrics::add(&metrics.orphans_unloaded_total, report.orphans_unloaded.len() as u64);
        Ok(report)
    }

    async fn sync_model(
        &self,
        model_id: &str,
        reporting: BTreeSet<String>,
        members: &BTreeSet<String>,
        reached: &BTreeSet<String>,
        started: u64,
    ) -> Result<ModelSync, QuasarError> {
        let _guard = self.lock_model(model_id).await;
        if self.tasks().active_for_model(model_id).is_some() {
            return Ok(ModelSync::default());
        }
        let record: Option<ModelRecord> = self
            .docs()
            .get(Index::Models, model_id)
            .await
            .map_err(QuasarError::store)?;
        let Some(record) = record else {
            return Ok(ModelSync {
                updated: false,
                unloaded: self.unload_orphans(model_id, &reporting).await,
            });
        };
        if record.last_updated_ms > started {
            return Ok(ModelSync::default());
        }

        match record.state {
            ModelState::Registered | ModelState::Undeployed => {
                return Ok(ModelSync {
                    updated: false,
                    unloaded: self.unload_orphans(model_id, &reporting).await,
                });
            }
            ModelState::Deploying => {
                let age = now_ms().saturating_sub(record.last_updated_ms);
                if age < self.settings().deploying_grace.as_millis() as u64 {
                    return Ok(ModelSync::default());
                }
                tracing::warn!(%model_id, age_ms=age, "deploying model has no running task, settling it");
            }
            _ => {}
        }

        let mut synced = record.clone();
        synced.current_worker_nodes = record
            .current_worker_nodes
            .iter()
            .filter(|node_id| members.contains(*node_id) && !reached.contains(*node_id))
            .cloned()
            .chain(reporting)
            .collect();
        let current = synced.current_worker_nodes.clone();
        synced.planned_worker_nodes.extend(current);
        synced.state = synced.settled_state();
        if synced.current_worker_nodes == record.current_worker_nodes
            && synced.planned_worker_nodes == record.planned_worker_nodes
            && synced.state == record.state
        {
            return Ok(ModelSync::default());
        }

        let now = now_ms();
        self.docs()
            .update(Index::Models, model_id, |r: &mut ModelRecord| {
                r.current_worker_nodes = synced.current_worker_nodes.clone();
                r.planned_worker_nodes = synced.planned_worker_nodes.clone();
                r.state = synced.state;
                r.touch(now);
                true
            })
            .await
            .map_err(QuasarError::store)?;
        tracing::info!(
            %model_id,
            from=%record.state,
            to=%synced.state,
            current=?synced.current_worker_nodes,
            "model record resynced"
        );
        Ok(ModelSync {
            updated: true,
            unloaded: Vec::new(),
        })
    }

    /// Unload `model_id` from every node in `nodes`. Returns the nodes that
    /// confirmed.
    async fn unload_orphans(&self, model_id: &str, nodes: &BTreeSet<String>) -> Vec<String> {
        let unloads = nodes.iter().map(|node_id| async move {
            let worker = match self.transport().connect(node_id).await {
                Ok(worker) => worker,
                Err(e) => {
                    tracing::warn!(%model_id, %node_id, error=%e, "cannot reach node to unload orphan");
                    return None;
                }
            };
            let result = worker
                .undeploy(UndeployModelRequest {
                    task_id: None,
                    model_id: model_id.to_string(),
                })
                .await;
            if result.is_success() {
                tracing::info!(%model_id, %node_id, "orphan model unloaded");
                Some(node_id.clone())
            } else {
                tracing::warn!(
                    %model_id, %node_id,
                    message=result.message.as_deref().unwrap_or(""),
                    "failed to unload orphan model"
                );
                None
            }
        });
        join_all(unloads).await.into_iter().flatten().collect()
    }
}

/// Run [`DeploymentCoordinator::sync_up`] every `sync_up_interval` until
/// `shutdown` fires.
pub async fn reconcile_loop(coordinator: DeploymentCoordinator, shutdown: CancellationToken) {
    let period = coordinator.settings().sync_up_interval.max(Duration::from_millis(10));
    tracing::info!(interval_ms = period.as_millis() as u64, "reconcile loop started");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("reconcile loop stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let metrics = coordinator.metrics();
        SharedMetrics::inc(&metrics.reconcile_total);
        match coordinator.sync_up().await {
            Ok(report) if !report.models_updated.is_empty() || !report.orphans_unloaded.is_empty() => {
                tracing::info!(
                    updated=?report.models_updated,
                    orphans=report.orphans_unloaded.len(),
                    "reconcile cycle repaired state"
                );
            }
            Ok(_) => {}
            Err(e) => {
                SharedMetrics::inc(&metrics.reconcile_errors_total);
                tracing::warn!(error=%e, "reconcile cycle failed");
            }
        }
    }
}
