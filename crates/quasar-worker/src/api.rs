use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};

use quasar_common::{
    now_ms, AdmitRequest, Admission, DeployModelRequest, NodeModelProfile, NodeResult,
    QuasarError, RefreshLimitersRequest, UndeployModelRequest, WorkerApi,
};

use crate::executor::WorkerExecutor;
use crate::metrics::{healthz_handler, metrics_handler, SharedMetrics};

pub struct WorkerState {
    pub executor: WorkerExecutor,
}

pub fn router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/v1/deploy", post(deploy))
        .route("/v1/undeploy", post(undeploy))
        .route("/v1/limiters", post(refresh_limiters))
        .route("/v1/admit", post(admit))
        .route("/v1/models", get(list_models))
        .route("/v1/profile/:model_id", get(profile))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn deploy(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<DeployModelRequest>,
) -> Json<NodeResult> {
    Json(state.executor.deploy(request).await)
}

async fn undeploy(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<UndeployModelRequest>,
) -> Json<NodeResult> {
    Json(state.executor.undeploy(request).await)
}

async fn refresh_limiters(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<RefreshLimitersRequest>,
) -> Result<Json<serde_json::Value>, QuasarError> {
    state.executor.refresh_limiters(request).await?;
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn admit(
    State(state): State<Arc<WorkerState>>,
    Json(request): Json<AdmitRequest>,
) -> Json<Admission> {
    let executor = &state.executor;
    let decision = executor
        .cache()
        .admit(&request.model_id, request.user.as_deref(), now_ms());
    match decision {
        Admission::Allow => SharedMetrics::inc(&executor.metrics().admissions_allowed_total),
        Admission::Throttled { .. } => {
            SharedMetrics::inc(&executor.metrics().admissions_throttled_total)
        }
        Admission::NotDeployed | Admission::Disabled => {}
    }
    Json(decision)
}

async fn list_models(State(state): State<Arc<WorkerState>>) -> Json<Vec<String>> {
    Json(state.executor.cache().deployed_models())
}

async fn profile(
    State(state): State<Arc<WorkerState>>,
    Path(model_id): Path<String>,
) -> Result<Json<NodeModelProfile>, QuasarError> {
    state
        .executor
        .model_profile(&model_id)
        .await
        .map(Json)
        .ok_or_else(|| QuasarError::NotFound(format!("model {model_id} is not deployed here")))
}
