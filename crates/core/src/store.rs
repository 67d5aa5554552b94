//! Optional persistence seam for tasks and execution records

use crate::task::{ExecutionFilter, Task, TaskExecution};
use async_trait::async_trait;
use dashmap::DashMap;
use finflow_common::{Result, TaskId};
use parking_lot::Mutex;

/// Write-through persistence for task state and execution history.
///
/// The core calls `save_task` on every state transition. When no store is
/// configured the core runs purely in memory.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save_task(&self, task: &Task) -> Result<()>;

    async fn load_tasks(&self) -> Result<Vec<Task>>;

    async fn save_execution(&self, execution: &TaskExecution) -> Result<()>;

    async fn load_executions(&self, filter: &ExecutionFilter) -> Result<Vec<TaskExecution>>;
}

/// In-memory reference store
#[derive(Default)]
pub struct MemoryStore {
    tasks: DashMap<TaskId, Task>,
    executions: Mutex<Vec<TaskExecution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.iter().map(|e| e.value().clone()).collect())
    }

    async fn save_execution(&self, execution: &TaskExecution) -> Result<()> {
        self.executions.lock().push(execution.clone());
        Ok(())
    }

    async fn load_executions(&self, filter: &ExecutionFilter) -> Result<Vec<TaskExecution>> {
        let executions = self.executions.lock();
        let mut matched: Vec<TaskExecution> = executions
            .iter()
            .filter(|e| filter.task_id.map_or(true, |id| e.task_id == id))
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let start = matched.len().saturating_sub(limit);
            matched = matched.split_off(start);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use finflow_common::TaskStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let store = MemoryStore::new();
        let task = Task::new("persisted", "x");
        store.save_task(&task).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, task.id);
    }

    #[tokio::test]
    async fn save_task_overwrites_by_id() {
        let store = MemoryStore::new();
        let mut task = Task::new("v1", "x");
        store.save_task(&task).await.unwrap();
        task.name = "v2".into();
        store.save_task(&task).await.unwrap();

        let loaded = store.load_tasks().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "v2");
    }

    #[tokio::test]
    async fn execution_filter_by_task_and_limit() {
        let store = MemoryStore::new();
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();

        for attempt in 1..=3 {
            let mut e = TaskExecution::begin(wanted, attempt, Utc::now());
            e.finish(TaskStatus::Completed, Utc::now(), None, None);
            store.save_execution(&e).await.unwrap();
        }
        let e = TaskExecution::begin(other, 1, Utc::now());
        store.save_execution(&e).await.unwrap();

        let filter = ExecutionFilter {
            task_id: Some(wanted),
            status: None,
            limit: Some(2),
        };
        let matched = store.load_executions(&filter).await.unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|e| e.task_id == wanted));
        // Limit keeps the most recent attempts.
        assert_eq!(matched[0].attempt, 2);
        assert_eq!(matched[1].attempt, 3);
    }
}
