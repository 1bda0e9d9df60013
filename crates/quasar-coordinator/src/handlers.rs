use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;

use quasar_common::{
    AccessController, Caller, DeploymentTask, LimiterUpdateOutcome, ModelProfile, ModelRecord,
    NodeInfo, QuasarError, RateLimiterConfig, RegisterModelRequest, SubmitDeployRequest,
    SubmitUndeployRequest, TaskAccepted, UndeployAccepted,
};

use crate::controller_service::ControllerService;
use crate::coordinator::DeploymentCoordinator;
use crate::metrics::{healthz_handler, metrics_handler};

pub struct AppState {
    pub coordinator: DeploymentCoordinator,
    pub controllers: ControllerService,
}

impl AppState {
    pub fn new(coordinator: DeploymentCoordinator) -> Self {
        Self {
            controllers: ControllerService::new(coordinator.clone()),
            coordinator,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", post(register_model))
        .route("/v1/models/_undeploy", post(undeploy_models))
        .route("/v1/models/:model_id/deploy", post(deploy_model))
        .route("/v1/models/:model_id/profile", get(model_profile))
        .route("/v1/models/:model_id/rate_limiter", put(update_rate_limiter))
        .route("/v1/tasks/:task_id", get(get_task).delete(cancel_task))
        .route(
            "/v1/controllers/:model_id",
            post(create_controller)
                .put(update_controller)
                .get(get_controller)
                .delete(delete_controller),
        )
        .route("/v1/nodes", get(list_nodes))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

async fn register_model(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(request): Json<RegisterModelRequest>,
) -> Result<(StatusCode, Json<ModelRecord>), QuasarError> {
    let record = state.coordinator.register_model(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn deploy_model(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
    Json(request): Json<SubmitDeployRequest>,
) -> Result<Json<TaskAccepted>, QuasarError> {
    let task_id = state
        .coordinator
        .submit_deploy(&caller, &model_id, request.node_ids)
        .await?;
    Ok(Json(TaskAccepted { task_id }))
}

async fn undeploy_models(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Json(request): Json<SubmitUndeployRequest>,
) -> Result<Json<UndeployAccepted>, QuasarError> {
    let task_ids = state
        .coordinator
        .submit_undeploy(&caller, &request.model_ids, request.node_ids)
        .await?;
    Ok(Json(UndeployAccepted { task_ids }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<DeploymentTask>, QuasarError> {
    Ok(Json(state.coordinator.get_task_status(&task_id).await?))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, QuasarError> {
    let cancelled = state.coordinator.cancel_task(&task_id).await?;
    if !cancelled {
        // unknown ids are a 404; finished tasks report cancelled=false
        state.coordinator.get_task_status(&task_id).await?;
    }
    Ok(Json(serde_json::json!({"task_id": task_id, "cancelled": cancelled})))
}

async fn model_profile(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
) -> Result<Json<ModelProfile>, QuasarError> {
    Ok(Json(
        state.coordinator.get_model_profile(&caller, &model_id).await?,
    ))
}

async fn update_rate_limiter(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<LimiterUpdateOutcome>, QuasarError> {
    let update = RateLimiterConfig::from_value(body)?;
    let outcome = state
        .controllers
        .update_model_rate_limiter(&caller, &model_id, update)
        .await?;
    Ok(Json(outcome))
}

/// Controller bodies may leave out `model_id`; the path supplies it.
fn controller_from_body(
    model_id: &str,
    mut body: serde_json::Value,
) -> Result<AccessController, QuasarError> {
    if let Some(obj) = body.as_object_mut() {
        obj.entry("model_id")
            .or_insert_with(|| serde_json::Value::String(model_id.to_string()));
    }
    let controller: AccessController =
        serde_json::from_value(body).map_err(|e| QuasarError::Validation(e.to_string()))?;
    if controller.model_id != model_id {
        return Err(QuasarError::Validation(format!(
            "controller model_id {} does not match model {model_id}",
            controller.model_id
        )));
    }
    Ok(controller)
}

async fn create_controller(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<LimiterUpdateOutcome>), QuasarError> {
    let controller = controller_from_body(&model_id, body)?;
    let outcome = state.controllers.create_controller(&caller, controller).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn update_controller(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<LimiterUpdateOutcome>, QuasarError> {
    let controller = controller_from_body(&model_id, body)?;
    let outcome = state
        .controllers
        .update_controller(&caller, &model_id, controller)
        .await?;
    Ok(Json(outcome))
}

async fn get_controller(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
) -> Result<Json<AccessController>, QuasarError> {
    Ok(Json(
        state.controllers.get_controller(&caller, &model_id).await?,
    ))
}

async fn delete_controller(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(model_id): Path<String>,
) -> Result<Json<LimiterUpdateOutcome>, QuasarError> {
    Ok(Json(
        state.controllers.delete_controller(&caller, &model_id).await?,
    ))
}

#[derive(Serialize)]
struct NodesResponse {
    local_node_id: String,
    nodes: Vec<NodeInfo>,
}

async fn list_nodes(State(state): State<Arc<AppState>>) -> Result<Json<NodesResponse>, QuasarError> {
    let topology = state.coordinator.topology();
    Ok(Json(NodesResponse {
        local_node_id: topology.local_node_id().to_string(),
        nodes: topology.list_nodes().await?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_body_takes_model_id_from_path() {
        let c = controller_from_body(
            "m1",
            serde_json::json!({"user_rate_limiter": {"alice": {"limit": "2", "unit": "SECONDS"}}}),
        )
        .unwrap();
        assert_eq!(c.model_id, "m1");
        assert_eq!(c.user_rate_limiter.len(), 1);

        let mismatch = controller_from_body("m1", serde_json::json!({"model_id": "m2"}));
        assert!(matches!(mismatch, Err(QuasarError::Validation(_))));
    }
}
