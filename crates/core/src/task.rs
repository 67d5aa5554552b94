//! Task record and lifecycle state machine

use chrono::{DateTime, Utc};
use finflow_common::{
    Error, ExecutionId, Progress, Result, TaskId, TaskPriority, TaskStatus, ValueMap,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

/// Default wall-clock bound for a single run
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Default retry budget
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// An independent unit of work with identity, params, and a lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub task_type: String,
    pub params: ValueMap,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub progress: Progress,
    /// Tasks that must be COMPLETED before this one may leave PENDING.
    /// Used by the task manager's single-task dependency mode only; the
    /// DAG engine carries its own node-level dependencies.
    pub dependencies: HashSet<TaskId>,
    pub max_retries: u32,
    pub retry_count: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<ValueMap>,
    pub error: Option<String>,
    /// Whether a bulk "start all" enqueues this task
    pub include_in_global_start: bool,
}

impl Task {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_type: task_type.into(),
            params: ValueMap::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            progress: Progress::default(),
            dependencies: HashSet::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            timeout: DEFAULT_TASK_TIMEOUT,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            include_in_global_start: true,
        }
    }

    pub fn with_params(mut self, params: ValueMap) -> Self {
        self.params = params;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = TaskId>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self
    }

    pub fn with_include_in_global_start(mut self, include: bool) -> Self {
        self.include_in_global_start = include;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, enforcing the lifecycle state machine.
    ///
    /// Every transition bumps `updated_at`; terminal transitions stamp
    /// `completed_at`, and the first RUNNING transition stamps `started_at`.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState {
                operation: format!("transition to {}", next.as_str()),
                status: self.status.as_str().to_string(),
            });
        }

        self.updated_at = now;
        match next {
            TaskStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
            }
            TaskStatus::Completed => {
                self.completed_at = Some(now);
                self.progress.complete();
                self.retry_count = 0;
            }
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped => {
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    /// Install a success payload; clears any previous error
    pub fn set_result(&mut self, result: ValueMap) {
        self.result = Some(result);
        self.error = None;
    }

    /// Install a failure message; clears any previous result
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.result = None;
    }

    /// Duration of the most recent run, when both timestamps are set
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Clone this task as a fresh instance, as trigger fires do
    pub fn instantiate(&self, now: DateTime<Utc>) -> Task {
        let mut task = self.clone();
        task.id = Uuid::new_v4();
        task.status = TaskStatus::Pending;
        task.progress = Progress::default();
        task.retry_count = 0;
        task.created_at = now;
        task.updated_at = now;
        task.started_at = None;
        task.completed_at = None;
        task.result = None;
        task.error = None;
        task
    }
}

/// One attempt of a task: a bounded-history append-only record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: ExecutionId,
    pub task_id: TaskId,
    /// Run ordinal, starting at 1 for the first attempt
    pub attempt: u32,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error: Option<String>,
}

impl TaskExecution {
    pub fn begin(task_id: TaskId, attempt: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            task_id,
            attempt,
            status: TaskStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            records_processed: 0,
            records_failed: 0,
            error: None,
        }
    }

    /// Close the record with a terminal status, pulling record counts out of
    /// the handler result when present
    pub fn finish(
        &mut self,
        status: TaskStatus,
        completed_at: DateTime<Utc>,
        result: Option<&ValueMap>,
        error: Option<&str>,
    ) {
        self.status = status;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds().max(0) as u64);
        self.error = error.map(ToOwned::to_owned);
        if let Some(result) = result {
            self.records_processed = result
                .get("records_processed")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            self.records_failed = result
                .get("records_failed")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
        }
    }
}

/// Query filter for execution history
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub task_id: Option<TaskId>,
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn happy_path_stamps_timestamps_once() {
        let mut task = Task::new("collect quotes", "quote_collection");
        task.transition(TaskStatus::Queued, at(0)).unwrap();
        task.transition(TaskStatus::Running, at(1)).unwrap();
        task.transition(TaskStatus::Completed, at(5)).unwrap();

        assert_eq!(task.started_at, Some(at(1)));
        assert_eq!(task.completed_at, Some(at(5)));
        assert!(task.started_at <= task.completed_at);
        assert_eq!(task.progress.fraction, 1.0);
    }

    #[test]
    fn completion_resets_retry_count() {
        let mut task = Task::new("t", "x");
        task.retry_count = 2;
        task.transition(TaskStatus::Queued, at(0)).unwrap();
        task.transition(TaskStatus::Running, at(1)).unwrap();
        task.transition(TaskStatus::Completed, at(2)).unwrap();
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn pause_resume_keeps_single_started_at() {
        let mut task = Task::new("t", "x");
        task.transition(TaskStatus::Queued, at(0)).unwrap();
        task.transition(TaskStatus::Running, at(1)).unwrap();
        task.transition(TaskStatus::Paused, at(2)).unwrap();
        task.transition(TaskStatus::Queued, at(3)).unwrap();
        task.transition(TaskStatus::Running, at(4)).unwrap();
        task.transition(TaskStatus::Completed, at(5)).unwrap();

        assert_eq!(task.started_at, Some(at(1)));
        assert_eq!(task.completed_at, Some(at(5)));
    }

    #[test]
    fn cancelled_task_cannot_requeue() {
        let mut task = Task::new("t", "x");
        task.transition(TaskStatus::Queued, at(0)).unwrap();
        task.transition(TaskStatus::Cancelled, at(1)).unwrap();
        let err = task.transition(TaskStatus::Queued, at(2)).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn pause_is_invalid_unless_running() {
        let mut task = Task::new("t", "x");
        let err = task.transition(TaskStatus::Paused, at(0)).unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[test]
    fn instantiate_issues_fresh_identity() {
        let mut template = Task::new("template", "x");
        template.retry_count = 2;
        template.set_error("old failure");
        let clone = template.instantiate(at(10));

        assert_ne!(clone.id, template.id);
        assert_eq!(clone.status, TaskStatus::Pending);
        assert_eq!(clone.retry_count, 0);
        assert!(clone.error.is_none());
        assert_eq!(clone.created_at, at(10));
    }

    #[test]
    fn execution_finish_extracts_record_counts() {
        let mut execution = TaskExecution::begin(Uuid::new_v4(), 1, at(0));
        let mut result = ValueMap::new();
        result.insert("records_processed".into(), serde_json::json!(120));
        result.insert("records_failed".into(), serde_json::json!(3));
        execution.finish(TaskStatus::Completed, at(2), Some(&result), None);

        assert_eq!(execution.records_processed, 120);
        assert_eq!(execution.records_failed, 3);
        assert_eq!(execution.duration_ms, Some(2_000));
    }

    proptest! {
        /// Any sequence of attempted transitions leaves the task in a state
        /// reachable purely through legal edges.
        #[test]
        fn random_walks_never_escape_the_state_machine(steps in proptest::collection::vec(0usize..8, 0..32)) {
            use TaskStatus::*;
            let statuses = [Pending, Queued, Running, Paused, Completed, Failed, Cancelled, Skipped];
            let mut task = Task::new("walk", "x");
            let mut tick = 0i64;

            for step in steps {
                let target = statuses[step];
                let before = task.status;
                tick += 1;
                match task.transition(target, at(tick)) {
                    Ok(()) => prop_assert!(before.can_transition_to(target)),
                    Err(_) => prop_assert!(!before.can_transition_to(target)),
                }
            }

            if task.status == Completed {
                prop_assert_eq!(task.progress.fraction, 1.0);
            }
            if let (Some(start), Some(end)) = (task.started_at, task.completed_at) {
                prop_assert!(start <= end);
            }
        }
    }
}
