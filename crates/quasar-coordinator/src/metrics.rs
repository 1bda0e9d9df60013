use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

use quasar_common::NodeResult;

use crate::handlers::AppState;

/// Shared metrics for the coordinator, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Deploy and undeploy tasks accepted.
    pub tasks_submitted_total: AtomicU64,
    /// Tasks aggregated to a final outcome.
    pub tasks_completed_total: AtomicU64,
    pub tasks_cancelled_total: AtomicU64,
    /// Tasks aborted before any node was contacted.
    pub tasks_plan_failed_total: AtomicU64,
    pub node_results_success_total: AtomicU64,
    pub node_results_failure_total: AtomicU64,
    /// Subset of failures where the node never answered.
    pub node_results_timeout_total: AtomicU64,
    pub redeploys_total: AtomicU64,
    pub limiter_refreshes_total: AtomicU64,
    /// Sync-up passes run, and those that failed.
    pub reconcile_total: AtomicU64,
    pub reconcile_errors_total: AtomicU64,
    pub models_resynced_total: AtomicU64,
    pub orphans_unloaded_total: AtomicU64,
}

impl SharedMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn observe_result(&self, result: &NodeResult) {
        if result.is_success() {
            Self::inc(&self.node_results_success_total);
        } else {
            Self::inc(&self.node_results_failure_total);
        }
    }
}

fn metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    out.push_str(&format!(
        "# HELP quasar_coordinator_{name} {help}\n# TYPE quasar_coordinator_{name} {kind}\nquasar_coordinator_{name} {value}\n"
    ));
}

pub fn render(metrics: &SharedMetrics, active_tasks: usize) -> String {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let mut out = String::new();
    for (name, help, value) in [
        ("tasks_submitted_total", "Tasks accepted.", &metrics.tasks_submitted_total),
        ("tasks_completed_total", "Tasks aggregated to an outcome.", &metrics.tasks_completed_total),
        ("tasks_cancelled_total", "Tasks cancelled before aggregation.", &metrics.tasks_cancelled_total),
        (
            "tasks_plan_failed_total",
            "Tasks aborted while building the dispatch plan.",
            &metrics.tasks_plan_failed_total,
        ),
        ("node_results_success_total", "Successful node results.", &metrics.node_results_success_total),
        ("node_results_failure_total", "Failed node results.", &metrics.node_results_failure_total),
        (
            "node_results_timeout_total",
            "Nodes that did not answer before the dispatch timeout.",
            &metrics.node_results_timeout_total,
        ),
        ("redeploys_total", "Redeploys triggered by limiter updates.", &metrics.redeploys_total),
        (
            "limiter_refreshes_total",
            "Limiter updates pushed to serving nodes in place.",
            &metrics.limiter_refreshes_total,
        ),
        ("reconcile_total", "Sync-up passes run.", &metrics.reconcile_total),
        ("reconcile_errors_total", "Sync-up passes that failed.", &metrics.reconcile_errors_total),
        (
            "models_resynced_total",
            "Model records rewritten by sync-up.",
            &metrics.models_resynced_total,
        ),
        (
            "orphans_unloaded_total",
            "Models unloaded from nodes no record assigned them to.",
            &metrics.orphans_unloaded_total,
        ),
    ] {
        metric(&mut out, name, help, "counter", load(value));
    }
    metric(&mut out, "active_tasks", "Tasks currently running.", "gauge", active_tasks as u64);
    out
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let body = render(coordinator.metrics(), coordinator.tasks().active_count());
    (axum::http::StatusCode::OK, body)
}

/// GET /healthz: liveness check.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use quasar_common::FailureKind;

    use super::*;

    #[test]
    fn test_render() {
        let metrics = SharedMetrics::default();
        metrics.observe_result(&NodeResult::success());
        metrics.observe_result(&NodeResult::failure(FailureKind::Load, "x"));
        SharedMetrics::inc(&metrics.tasks_submitted_total);
        SharedMetrics::add(&metrics.orphans_unloaded_total, 2);

        let text = render(&metrics, 3);
        assert!(text.contains("quasar_coordinator_tasks_submitted_total 1\n"));
        assert!(text.contains("quasar_coordinator_node_results_failure_total 1\n"));
        assert!(text.contains("quasar_coordinator_orphans_unloaded_total 2\n"));
        assert!(text.contains("# TYPE quasar_coordinator_active_tasks gauge\nquasar_coordinator_active_tasks 3\n"));
    }
}
