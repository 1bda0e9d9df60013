use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;

use crate::api::WorkerState;

/// Worker counters, updated lock-free by the executor and the admit path.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    pub deploy_total: AtomicU64,
    pub deploy_failures_total: AtomicU64,
    pub circuit_breaker_rejections_total: AtomicU64,
    pub undeploy_total: AtomicU64,
    pub admissions_allowed_total: AtomicU64,
    pub admissions_throttled_total: AtomicU64,
}

impl SharedMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

fn counter(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    out.push_str(&format!(
        "# HELP quasar_worker_{name} {help}\n# TYPE quasar_worker_{name} {kind}\nquasar_worker_{name} {value}\n"
    ));
}

pub fn render(metrics: &SharedMetrics, models_loaded: usize, memory_usage_percent: f64) -> String {
    let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
    let mut out = String::new();
    counter(&mut out, "deploy_total", "Deploy requests handled.", "counter", load(&metrics.deploy_total));
    counter(
        &mut out,
        "deploy_failures_total",
        "Deploy requests that failed.",
        "counter",
        load(&metrics.deploy_failures_total),
    );
    counter(
        &mut out,
        "circuit_breaker_rejections_total",
        "Deploys rejected by the circuit breaker.",
        "counter",
        load(&metrics.circuit_breaker_rejections_total),
    );
    counter(&mut out, "undeploy_total", "Undeploy requests handled.", "counter", load(&metrics.undeploy_total));
    counter(
        &mut out,
        "admissions_allowed_total",
        "Inference requests admitted.",
        "counter",
        load(&metrics.admissions_allowed_total),
    );
    counter(
        &mut out,
        "admissions_throttled_total",
        "Inference requests throttled by a rate limiter.",
        "counter",
        load(&metrics.admissions_throttled_total),
    );
    counter(&mut out, "models_loaded", "Models loaded on this node.", "gauge", models_loaded as u64);
    out.push_str(&format!(
        "# HELP quasar_worker_memory_usage_percent Host memory usage seen by the circuit breaker.\n\
         # TYPE quasar_worker_memory_usage_percent gauge\n\
         quasar_worker_memory_usage_percent {memory_usage_percent:.2}\n"
    ));
    out
}

/// GET /metrics: Prometheus text exposition.
pub async fn metrics_handler(State(state): State<Arc<WorkerState>>) -> impl IntoResponse {
    let executor = &state.executor;
    let body = render(
        executor.metrics(),
        executor.cache().len(),
        executor.breaker().memory_usage_percent(),
    );
    (axum::http::StatusCode::OK, body)
}

/// GET /healthz: liveness check.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}
