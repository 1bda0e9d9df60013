use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::model::ModelState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Deploy,
    Undeploy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Running,
    Completed,
}

/// Coordinator progress through one task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorPhase {
    Created,
    Dispatching,
    AwaitingResults,
    Aggregated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Why a node failed. All kinds aggregate as a plain failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Dispatch,
    ResourceExhausted,
    Timeout,
    Load,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeResult {
    pub status: ResultStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeResult {
    pub fn success() -> Self {
        Self {
            status: ResultStatus::Success,
            failure: None,
            message: None,
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failure,
            failure: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn timed_out() -> Self {
        Self::failure(FailureKind::Timeout, "node did not respond before the dispatch timeout")
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }
}

/// One deploy or undeploy attempt of a single model.
///
/// Stored in the `tasks` index under `task_id`. Only the coordinator
/// mutates it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentTask {
    pub task_id: String,
    pub model_id: String,
    pub kind: TaskKind,
    pub target_nodes: BTreeSet<String>,

    #[serde(default)]
    pub per_node_result: BTreeMap<String, NodeResult>,

    pub state: TaskState,
    pub phase: CoordinatorPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ModelState>,

    pub created_at_ms: u64,
    pub last_updated_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

impl DeploymentTask {
    pub fn new(
        model_id: impl Into<String>,
        kind: TaskKind,
        target_nodes: BTreeSet<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            model_id: model_id.into(),
            kind,
            target_nodes,
            per_node_result: BTreeMap::new(),
            state: TaskState::Created,
            phase: CoordinatorPhase::Created,
            outcome: None,
            created_at_ms: now_ms,
            last_updated_ms: now_ms,
            error_summary: None,
        }
    }

    /// Record the first result a node reports. Returns false for nodes that
    /// are not targets or already responded.
    pub fn record(&mut self, node_id: &str, result: NodeResult, now_ms: u64) -> bool {
        if !self.target_nodes.contains(node_id) || self.per_node_result.contains_key(node_id) {
            return false;
        }
        self.per_node_result.insert(node_id.to_string(), result);
        self.last_updated_ms = now_ms;
        true
    }

    pub fn responded(&self) -> BTreeSet<String> {
        self.per_node_result.keys().cloned().collect()
    }

    pub fn all_responded(&self) -> bool {
        self.per_node_result.len() == self.target_nodes.len()
    }

    /// Fill a TIMEOUT failure for every target that has not responded.
    pub fn mark_unresponsive_as_timed_out(&mut self, now_ms: u64) -> Vec<String> {
        let missing: Vec<String> = self
            .target_nodes
            .iter()
            .filter(|n| !self.per_node_result.contains_key(*n))
            .cloned()
            .collect();
        for node in &missing {
            self.per_node_result.insert(node.clone(), NodeResult::timed_out());
        }
        if !missing.is_empty() {
            self.last_updated_ms = now_ms;
        }
        missing
    }

    pub fn succeeded_nodes(&self) -> BTreeSet<String> {
        self.per_node_result
            .iter()
            .filter(|(_, r)| r.is_success())
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn failed_nodes(&self) -> BTreeSet<String> {
        self.per_node_result
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Outcome of a deploy once every target has a result.
    pub fn deploy_outcome(&self) -> ModelState {
        let ok = self.succeeded_nodes().len();
        if ok == 0 {
            ModelState::DeployFailed
        } else if ok == self.target_nodes.len() {
            ModelState::Deployed
        } else {
            ModelState::PartiallyDeployed
        }
    }

    /// Failures joined as `node: message` pairs, if any.
    pub fn failure_summary(&self) -> Option<String> {
        let parts: Vec<String> = self
            .per_node_result
            .iter()
            .filter(|(_, r)| !r.is_success())
            .map(|(n, r)| format!("{n}: {}", r.message.as_deref().unwrap_or("failed")))
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }

    pub fn advance(&mut self, phase: CoordinatorPhase, now_ms: u64) {
        self.phase = phase;
        if phase != CoordinatorPhase::Created {
            self.state = TaskState::Running;
        }
        self.last_updated_ms = now_ms;
    }

    pub fn complete(&mut self, outcome: Option<ModelState>, now_ms: u64) {
        self.state = TaskState::Completed;
        self.phase = CoordinatorPhase::Aggregated;
        self.outcome = outcome;
        if self.error_summary.is_none() {
            self.error_summary = self.failure_summary();
        }
        self.last_updated_ms = now_ms;
    }

    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_partial_outcome() {
        let mut task = DeploymentTask::new("m1", TaskKind::Deploy, nodes(&["a", "b", "c"]), 1);
        assert!(task.record("a", NodeResult::success(), 2));
        assert!(task.record(
            "b",
            NodeResult::failure(FailureKind::ResourceExhausted, "circuit breaker open"),
            3
        ));
        assert!(!task.all_responded());
        assert!(task.record("c", NodeResult::success(), 4));
        assert!(task.all_responded());

        assert_eq!(task.deploy_outcome(), ModelState::PartiallyDeployed);
        assert_eq!(task.succeeded_nodes(), nodes(&["a", "c"]));

        task.complete(Some(task.deploy_outcome()), 5);
        assert!(task.is_completed());
        assert_eq!(task.error_summary.as_deref(), Some("b: circuit breaker open"));
    }

    #[test]
    fn test_record_ignores_duplicates_and_strangers() {
        let mut task = DeploymentTask::new("m1", TaskKind::Deploy, nodes(&["a"]), 1);
        assert!(!task.record("z", NodeResult::success(), 2));
        assert!(task.record("a", NodeResult::failure(FailureKind::Load, "boom"), 2));
        assert!(!task.record("a", NodeResult::success(), 3));
        assert_eq!(task.deploy_outcome(), ModelState::DeployFailed);
    }

    #[test]
    fn test_timeout_fill() {
        let mut task = DeploymentTask::new("m1", TaskKind::Deploy, nodes(&["a", "b"]), 1);
        task.record("a", NodeResult::success(), 2);
        let missing = task.mark_unresponsive_as_timed_out(3);
        assert_eq!(missing, vec!["b".to_string()]);
        assert_eq!(task.per_node_result["b"].failure, Some(FailureKind::Timeout));
        assert_eq!(task.deploy_outcome(), ModelState::PartiallyDeployed);
        assert_eq!(task.responded(), nodes(&["a", "b"]));
    }

    #[test]
    fn test_serde_shape() {
        let mut task = DeploymentTask::new("m1", TaskKind::Undeploy, nodes(&["a"]), 7);
        task.advance(CoordinatorPhase::Dispatching, 8);
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["kind"], "UNDEPLOY");
        assert_eq!(v["state"], "RUNNING");
        assert_eq!(v["phase"], "DISPATCHING");
        assert!(v.get("outcome").is_none());
        let back: DeploymentTask = serde_json::from_value(v).unwrap();
        assert_eq!(back, task);
    }
}
