use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::task::FailureKind;

/// Errors surfaced by the control plane.
///
/// Pre-dispatch variants (`Validation`, `AccessDenied`, `NotFound`,
/// `Conflict`, `NoEligibleNodes`) reject a request before any task exists.
/// `Dispatch`, `ResourceExhausted` and `Timeout` describe a single node and
/// end up as that node's failed result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuasarError {
    #[error("{0}")]
    Validation(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no eligible node found: {0}")]
    NoEligibleNodes(String),

    #[error("dispatch to node {node_id} failed: {message}")]
    Dispatch { node_id: String, message: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("node {node_id} did not respond in time")]
    Timeout { node_id: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QuasarError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            QuasarError::Validation(_) => StatusCode::BAD_REQUEST,
            QuasarError::AccessDenied(_) => StatusCode::FORBIDDEN,
            QuasarError::NotFound(_) => StatusCode::NOT_FOUND,
            QuasarError::Conflict(_) => StatusCode::CONFLICT,
            QuasarError::NoEligibleNodes(_) => StatusCode::SERVICE_UNAVAILABLE,
            QuasarError::Dispatch { .. } => StatusCode::BAD_GATEWAY,
            QuasarError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            QuasarError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            QuasarError::Store(_) | QuasarError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Classification used when this error becomes a node's failed result.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            QuasarError::ResourceExhausted(_) => FailureKind::ResourceExhausted,
            QuasarError::Timeout { .. } => FailureKind::Timeout,
            QuasarError::Dispatch { .. } => FailureKind::Dispatch,
            _ => FailureKind::Load,
        }
    }

    pub fn store(e: impl std::fmt::Display) -> Self {
        QuasarError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for QuasarError {
    fn from(e: serde_json::Error) -> Self {
        QuasarError::Internal(format!("serialization failed: {e}"))
    }
}

impl IntoResponse for QuasarError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            Json(serde_json::json!({"error": {"message": self.to_string()}})),
        )
            .into_response()
    }
}
