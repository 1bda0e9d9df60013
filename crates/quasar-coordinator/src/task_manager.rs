use std::sync::Mutex;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use quasar_common::{now_ms, DeploymentTask, QuasarError};
use quasar_meta::{DocumentStore, Index};

pub const TASK_CANCELLED: &str = "task cancelled";

struct ActiveTask {
    task: DeploymentTask,
    cancel: CancellationToken,
}

/// In-flight tasks, at most one per model.
///
/// A task leaves the active index exactly once, either through [`finish`]
/// by the coordinator that ran it or through [`cancel`]. Whoever removes it
/// owns the final write.
///
/// [`finish`]: TaskManager::finish
/// [`cancel`]: TaskManager::cancel
pub struct TaskManager {
    docs: DocumentStore,
    active: DashMap<String, ActiveTask>,
    by_model: DashMap<String, String>,
    max_running_tasks: usize,
    admission: Mutex<()>,
}

impl TaskManager {
    pub fn new(docs: DocumentStore, max_running_tasks: usize) -> Self {
        Self {
            docs,
            active: DashMap::new(),
            by_model: DashMap::new(),
            max_running_tasks,
            admission: Mutex::new(()),
        }
    }

    /// Reject a new task for `model_id` without reserving anything.
    pub fn check_can_start(&self, model_id: &str) -> Result<(), QuasarError> {
        if let Some(task_id) = self.by_model.get(model_id) {
            return Err(QuasarError::Conflict(format!(
                "model {model_id} already has running task {}",
                task_id.value()
            )));
        }
        if self.active.len() >= self.max_running_tasks {
            return Err(QuasarError::ResourceExhausted(format!(
                "exceed max running task limit of {}",
                self.max_running_tasks
            )));
        }
        Ok(())
    }

    /// Put `task` into the active index and hand back its cancellation token.
    pub fn register(&self, task: &DeploymentTask) -> Result<CancellationToken, QuasarError> {
        let _guard = self
            .admission
            .lock()
            .map_err(|_| QuasarError::Internal("task admission lock poisoned".into()))?;
        self.check_can_start(&task.model_id)?;

        let cancel = CancellationToken::new();
        self.by_model
            .insert(task.model_id.clone(), task.task_id.clone());
        self.active.insert(
            task.task_id.clone(),
            ActiveTask {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    pub async fn persist(&self, task: &DeploymentTask) -> Result<(), QuasarError> {
        self.docs
            .put(Index::Tasks, &task.task_id, task)
            .await
            .map(|_| ())
            .map_err(QuasarError::store)
    }

    /// Replace the in-memory snapshot of a still active task.
    pub fn update_snapshot(&self, task: &DeploymentTask) -> bool {
        match self.active.get_mut(&task.task_id) {
            Some(mut entry) => {
                entry.task = task.clone();
                true
            }
            None => false,
        }
    }

    /// Active snapshot first, then the stored document.
    pub async fn get(&self, task_id: &str) -> Result<Option<DeploymentTask>, QuasarError> {
        if let Some(entry) = self.active.get(task_id) {
            return Ok(Some(entry.task.clone()));
        }
        self.docs
            .get(Index::Tasks, task_id)
            .await
            .map_err(QuasarError::store)
    }

    fn take(&self, task_id: &str) -> Option<ActiveTask> {
        let (_, entry) = self.active.remove(task_id)?;
        self.by_model
            .remove_if(&entry.task.model_id, |_, id| id == task_id);
        Some(entry)
    }

    /// Claim a task for its final write. Returns `None` if it was cancelled.
    pub fn finish(&self, task_id: &str) -> Option<DeploymentTask> {
        self.take(task_id).map(|entry| entry.task)
    }

    /// Cancel an active task. In-flight node calls keep running but whatever
    /// they return is dropped. Returns false when the task is not active.
    pub async fn cancel(&self, task_id: &str) -> Result<bool, QuasarError> {
        let Some(ActiveTask { mut task, cancel }) = self.take(task_id) else {
            return Ok(false);
        };
        cancel.cancel();
        task.error_summary = Some(TASK_CANCELLED.to_string());
        task.complete(None, now_ms());
        tracing::info!(%task_id, model_id=%task.model_id, "task cancelled");
        self.persist(&task).await?;
        Ok(true)
    }

    pub fn tasks_targeting(&self, node_id: &str) -> Vec<String> {
        self.active
            .iter()
            .filter(|e| e.task.target_nodes.contains(node_id))
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn active_for_model(&self, model_id: &str) -> Option<String> {
        self.by_model.get(model_id).map(|id| id.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use quasar_common::TaskKind;
    use quasar_meta::MemoryMetaStore;

    use super::*;

    fn manager(max: usize) -> TaskManager {
        TaskManager::new(DocumentStore::new(Arc::new(MemoryMetaStore::new())), max)
    }

    fn task(model_id: &str, nodes: &[&str]) -> DeploymentTask {
        let targets: BTreeSet<String> = nodes.iter().map(|s| s.to_string()).collect();
        DeploymentTask::new(model_id, TaskKind::Deploy, targets, 1)
    }

    #[test]
    fn test_one_active_task_per_model() {
        let tasks = manager(10);
        let first = task("m1", &["a"]);
        tasks.register(&first).unwrap();
        assert!(matches!(
            tasks.register(&task("m1", &["b"])),
            Err(QuasarError::Conflict(_))
        ));
        assert!(tasks.register(&task("m2", &["a"])).is_ok());
        assert_eq!(tasks.active_for_model("m1"), Some(first.task_id.clone()));

        assert!(tasks.finish(&first.task_id).is_some());
        assert!(tasks.finish(&first.task_id).is_none());
        assert!(tasks.check_can_start("m1").is_ok());
    }

    #[test]
    fn test_running_task_limit() {
        let tasks = manager(1);
        tasks.register(&task("m1", &["a"])).unwrap();
        assert!(matches!(
            tasks.check_can_start("m2"),
            Err(QuasarError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_persists_completed_task() {
        let tasks = manager(10);
        let t = task("m1", &["a", "b"]);
        let token = tasks.register(&t).unwrap();
        assert_eq!(tasks.tasks_targeting("b"), vec![t.task_id.clone()]);

        assert!(tasks.cancel(&t.task_id).await.unwrap());
        assert!(token.is_cancelled());
        assert!(!tasks.cancel(&t.task_id).await.unwrap());
        assert!(tasks.finish(&t.task_id).is_none());

        let stored = tasks.get(&t.task_id).await.unwrap().unwrap();
        assert!(stored.is_completed());
        assert_eq!(stored.error_summary.as_deref(), Some(TASK_CANCELLED));
        assert_eq!(stored.outcome, None);
    }

    #[tokio::test]
    async fn test_get_prefers_active_snapshot() {
        let tasks = manager(10);
        let mut t = task("m1", &["a"]);
        tasks.register(&t).unwrap();
        tasks.persist(&t).await.unwrap();

        t.advance(quasar_common::CoordinatorPhase::AwaitingResults, 2);
        assert!(tasks.update_snapshot(&t));
        let seen = tasks.get(&t.task_id).await.unwrap().unwrap();
        assert_eq!(seen.phase, quasar_common::CoordinatorPhase::AwaitingResults);
        assert_eq!(tasks.active_count(), 1);
    }
}
