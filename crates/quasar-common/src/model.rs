use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::controller::AccessController;
use crate::error::QuasarError;
use crate::rate_limiter::RateLimiterConfig;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelState {
    Registered,
    Deploying,
    Deployed,
    PartiallyDeployed,
    DeployFailed,
    Undeployed,
}

impl ModelState {
    /// At least one node is expected to serve the model.
    pub fn is_serving(self) -> bool {
        matches!(self, ModelState::Deployed | ModelState::PartiallyDeployed)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Registered => "REGISTERED",
            ModelState::Deploying => "DEPLOYING",
            ModelState::Deployed => "DEPLOYED",
            ModelState::PartiallyDeployed => "PARTIALLY_DEPLOYED",
            ModelState::DeployFailed => "DEPLOY_FAILED",
            ModelState::Undeployed => "UNDEPLOYED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionType {
    TextEmbedding,
    SparseEncoding,
    TextSimilarity,
    QuestionAnswering,
    Kmeans,
    BatchRcf,
    Remote,
}

impl FunctionType {
    pub const ALL: [FunctionType; 7] = [
        FunctionType::TextEmbedding,
        FunctionType::SparseEncoding,
        FunctionType::TextSimilarity,
        FunctionType::QuestionAnswering,
        FunctionType::Kmeans,
        FunctionType::BatchRcf,
        FunctionType::Remote,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FunctionType::TextEmbedding => "TEXT_EMBEDDING",
            FunctionType::SparseEncoding => "SPARSE_ENCODING",
            FunctionType::TextSimilarity => "TEXT_SIMILARITY",
            FunctionType::QuestionAnswering => "QUESTION_ANSWERING",
            FunctionType::Kmeans => "KMEANS",
            FunctionType::BatchRcf => "BATCH_RCF",
            FunctionType::Remote => "REMOTE",
        }
    }

    /// Served through an external connector rather than loaded in process.
    pub fn is_remote(self) -> bool {
        self == FunctionType::Remote
    }

    pub fn is_local(self) -> bool {
        !self.is_remote()
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionType {
    type Err = QuasarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        FunctionType::ALL
            .into_iter()
            .find(|f| f.as_str() == wanted)
            .ok_or_else(|| QuasarError::Validation(format!("unknown function type: {s}")))
    }
}

/// Serialized model format, used for memory estimation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelFormat {
    Onnx,
    TorchScript,
}

impl ModelFormat {
    /// Runtime footprint relative to the artifact size.
    pub fn memory_scale(self) -> f64 {
        match self {
            ModelFormat::Onnx => 1.5,
            ModelFormat::TorchScript => 1.2,
        }
    }

    pub fn estimate_memory_bytes(self, content_size_bytes: u64) -> u64 {
        (content_size_bytes as f64 * self.memory_scale()).ceil() as u64
    }
}

/// Persistent record of one model and where it runs.
///
/// Stored in the `models` index under `model_id`. The coordinator is the
/// only writer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRecord {
    pub model_id: String,
    pub name: String,
    pub function_type: FunctionType,
    pub state: ModelState,

    #[serde(default)]
    pub is_hidden: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_group_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ModelFormat>,

    #[serde(default)]
    pub planned_worker_nodes: BTreeSet<String>,

    #[serde(default)]
    pub current_worker_nodes: BTreeSet<String>,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<AccessController>,

    #[serde(default)]
    pub memory_estimate_cpu: u64,

    #[serde(default)]
    pub memory_estimate_gpu: u64,

    #[serde(default)]
    pub deploy_to_all_nodes: bool,

    #[serde(default = "default_enabled")]
    pub is_enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub created_at_ms: u64,

    #[serde(default)]
    pub last_updated_ms: u64,
}

fn default_enabled() -> bool {
    true
}

impl ModelRecord {
    pub fn new(
        model_id: impl Into<String>,
        name: impl Into<String>,
        function_type: FunctionType,
        now_ms: u64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            name: name.into(),
            function_type,
            state: ModelState::Registered,
            is_hidden: false,
            model_group_id: None,
            content_hash: None,
            format: None,
            planned_worker_nodes: BTreeSet::new(),
            current_worker_nodes: BTreeSet::new(),
            rate_limiter: RateLimiterConfig::default(),
            controller: None,
            memory_estimate_cpu: 0,
            memory_estimate_gpu: 0,
            deploy_to_all_nodes: false,
            is_enabled: true,
            last_error: None,
            created_at_ms: now_ms,
            last_updated_ms: now_ms,
        }
    }

    /// Fill the memory estimates from the artifact size when a format is known.
    pub fn with_content_size(mut self, content_size_bytes: u64) -> Self {
        if let Some(format) = self.format {
            let estimate = format.estimate_memory_bytes(content_size_bytes);
            self.memory_estimate_cpu = estimate;
            self.memory_estimate_gpu = estimate;
        }
        self
    }

    /// Nodes currently serving the model that are not in `targets`.
    pub fn nodes_outside(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        self.current_worker_nodes.difference(targets).cloned().collect()
    }

    /// State implied by the current and planned node sets once no task is
    /// running for the model.
    pub fn settled_state(&self) -> ModelState {
        if self.current_worker_nodes.is_empty() {
            if self.planned_worker_nodes.is_empty() {
                ModelState::Undeployed
            } else {
                ModelState::DeployFailed
            }
        } else if self
            .planned_worker_nodes
            .is_subset(&self.current_worker_nodes)
        {
            ModelState::Deployed
        } else {
            ModelState::PartiallyDeployed
        }
    }

    /// Remove `node_id` from both node sets. Returns true if it was serving.
    pub fn drop_node(&mut self, node_id: &str, now_ms: u64) -> bool {
        let was_serving = self.current_worker_nodes.remove(node_id);
        self.planned_worker_nodes.remove(node_id);
        if was_serving {
            self.last_updated_ms = now_ms;
        }
        was_serving
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_updated_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_function_type_parse() {
        assert_eq!("remote".parse::<FunctionType>().unwrap(), FunctionType::Remote);
        assert_eq!(
            " TEXT_EMBEDDING ".parse::<FunctionType>().unwrap(),
            FunctionType::TextEmbedding
        );
        assert!("llm".parse::<FunctionType>().is_err());
        assert!(FunctionType::Kmeans.is_local());
    }

    #[test]
    fn test_memory_estimate() {
        assert_eq!(ModelFormat::Onnx.estimate_memory_bytes(100), 150);
        assert_eq!(ModelFormat::TorchScript.estimate_memory_bytes(100), 120);

        let mut record = ModelRecord::new("m", "m", FunctionType::TextEmbedding, 0);
        record.format = Some(ModelFormat::Onnx);
        let record = record.with_content_size(1_000);
        assert_eq!(record.memory_estimate_cpu, 1_500);
    }

    #[test]
    fn test_settled_state() {
        let mut record = ModelRecord::new("m", "m", FunctionType::TextEmbedding, 0);
        assert_eq!(record.settled_state(), ModelState::Undeployed);

        record.planned_worker_nodes = set(&["a", "b"]);
        assert_eq!(record.settled_state(), ModelState::DeployFailed);

        record.current_worker_nodes = set(&["a"]);
        assert_eq!(record.settled_state(), ModelState::PartiallyDeployed);

        record.current_worker_nodes = set(&["a", "b"]);
        assert_eq!(record.settled_state(), ModelState::Deployed);

        assert!(record.drop_node("b", 5));
        assert_eq!(record.settled_state(), ModelState::Deployed);
        assert!(!record.drop_node("b", 6));
        assert_eq!(record.last_updated_ms, 5);
    }

    #[test]
    fn test_nodes_outside() {
        let mut record = ModelRecord::new("m", "m", FunctionType::TextEmbedding, 0);
        record.current_worker_nodes = set(&["a", "b"]);
        assert_eq!(record.nodes_outside(&set(&["a", "c"])), set(&["b"]));
    }

    #[test]
    fn test_defaults_on_deserialize() {
        let record: ModelRecord = serde_json::from_str(
            r#"{"model_id":"m","name":"n","function_type":"REMOTE","state":"REGISTERED"}"#,
        )
        .unwrap();
        assert!(record.is_enabled);
        assert!(record.rate_limiter.is_empty());
        assert!(record.controller.is_none());
    }
}
