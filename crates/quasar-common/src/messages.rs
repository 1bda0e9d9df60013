use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::controller::AccessController;
use crate::model::{FunctionType, ModelFormat, ModelRecord, ModelState};
use crate::rate_limiter::RateLimiterConfig;

// ── coordinator API ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterModelRequest {
    /// Generated when absent.
    #[serde(default)]
    pub model_id: Option<String>,

    pub name: String,
    pub function_type: FunctionType,

    #[serde(default)]
    pub model_group_id: Option<String>,

    #[serde(default)]
    pub content_hash: Option<String>,

    #[serde(default)]
    pub format: Option<ModelFormat>,

    #[serde(default)]
    pub content_size_bytes: Option<u64>,

    #[serde(default)]
    pub is_hidden: bool,

    #[serde(default)]
    pub deploy_to_all_nodes: bool,

    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitDeployRequest {
    #[serde(default)]
    pub node_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitUndeployRequest {
    pub model_ids: Vec<String>,

    #[serde(default)]
    pub node_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskAccepted {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UndeployAccepted {
    pub task_ids: Vec<String>,
}

/// What a rate limiter update did to the serving model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LimiterUpdateOutcome {
    /// Nothing changed.
    Unchanged,
    /// Stored only; the model is not serving.
    Stored,
    /// Live limiters resized on the serving nodes.
    Refreshed { nodes: BTreeSet<String> },
    /// A redeploy task was started.
    Redeploying { task_id: String },
}

// ── worker API ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployModelRequest {
    pub task_id: String,
    pub model: ModelRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndeployModelRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshLimitersRequest {
    pub model_id: String,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub controller: Option<AccessController>,

    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RefreshLimitersRequest {
    pub fn from_record(record: &ModelRecord) -> Self {
        Self {
            model_id: record.model_id.clone(),
            rate_limiter: record.rate_limiter.clone(),
            controller: record.controller.clone(),
            is_enabled: record.is_enabled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub model_id: String,

    #[serde(default)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleScope {
    Model,
    User,
}

/// Admission decision for one inference request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Allow,
    Throttled { scope: ThrottleScope },
    NotDeployed,
    Disabled,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        self == Admission::Allow
    }
}

// ── profiles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceStats {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p90_ms: f64,
}

/// One worker's view of a model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeModelProfile {
    pub model_id: String,
    pub state: ModelState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    pub is_enabled: bool,
    pub deployed_at_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_stats: Option<InferenceStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelProfile {
    pub model_id: String,
    pub state: ModelState,
    pub planned_worker_nodes: BTreeSet<String>,
    pub current_worker_nodes: BTreeSet<String>,

    /// Per-node profiles; nodes that could not be queried are absent.
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeModelProfile>,

    pub generated_at: chrono::DateTime<chrono::Utc>,
}
