//! Task manager: lifecycle operations and the dispatcher loop

use crate::queue::{QueueStats, WorkQueue};
use finflow_common::{
    metrics::MetricsCollector, Error, Result, TaskId, TaskStatus, ValueMap,
};
use finflow_core::{
    BackoffPolicy, CancelToken, Clock, CoreEvent, EventBus, ExecutionFilter, HandlerContext,
    HandlerRegistry, ProgressReporter, ProgressSink, Task, TaskExecution, TaskStore,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

/// Task manager configuration
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub shutdown_deadline: Duration,
    pub cancel_grace: Duration,
    pub execution_history_capacity: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_timeout: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
            shutdown_deadline: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(5),
            execution_history_capacity: 10_000,
        }
    }
}

/// Aggregate view for dashboards
#[derive(Debug, Clone)]
pub struct ManagerOverview {
    pub total_tasks: usize,
    pub status_counts: HashMap<&'static str, usize>,
    pub queue: QueueStats,
    pub handlers: usize,
}

#[derive(Clone)]
struct RunningControl {
    cancel: CancelToken,
    pause: CancelToken,
}

struct ManagerState {
    tasks: HashMap<TaskId, Task>,
    queue: WorkQueue,
    running: HashMap<TaskId, RunningControl>,
}

struct ManagerInner {
    config: TaskManagerConfig,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,
    store: Option<Arc<dyn TaskStore>>,
    /// Coarse lock over task map, queue structure, and running set
    state: Mutex<ManagerState>,
    executions: Mutex<VecDeque<TaskExecution>>,
    /// Signalled on every state change the dispatcher may care about
    wakeup: Notify,
    shutdown: Mutex<CancelToken>,
    accepting: AtomicBool,
}

enum WorkerOutcome {
    Done(Result<ValueMap>),
    Paused,
}

struct ManagerProgressSink {
    inner: Arc<ManagerInner>,
}

impl ProgressSink for ManagerProgressSink {
    fn report(&self, task_id: TaskId, fraction: f64, message: &str) {
        let progress = {
            let mut state = self.inner.state.lock();
            state.tasks.get_mut(&task_id).map(|task| {
                task.progress.update(fraction, message);
                task.progress.clone()
            })
        };
        if let Some(progress) = progress {
            self.inner.events.publish(CoreEvent::TaskProgress {
                task_id,
                fraction: progress.fraction,
                message: progress.message,
            });
        }
    }
}

/// Priority-ordered task execution with bounded concurrency, retries,
/// pause/resume/cancel, and observable lifecycle state.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(
        config: TaskManagerConfig,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Arc<dyn MetricsCollector>,
        store: Option<Arc<dyn TaskStore>>,
    ) -> Self {
        let max_concurrent = config.max_concurrent;
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry,
                clock,
                events,
                metrics,
                store,
                state: Mutex::new(ManagerState {
                    tasks: HashMap::new(),
                    queue: WorkQueue::new(max_concurrent),
                    running: HashMap::new(),
                }),
                executions: Mutex::new(VecDeque::new()),
                wakeup: Notify::new(),
                shutdown: Mutex::new(CancelToken::new()),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Register a PENDING task; does not enqueue it
    pub async fn create_task(&self, task: Task) -> Result<TaskId> {
        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidState {
                operation: "create".to_string(),
                status: task.status.as_str().to_string(),
            });
        }
        let task_id = task.id;
        self.inner.state.lock().tasks.insert(task_id, task.clone());
        persist_task(&self.inner, &task).await;
        Ok(task_id)
    }

    /// Move a PENDING task into the work queue
    #[instrument(skip(self))]
    pub async fn enqueue_task(&self, task_id: TaskId) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(Error::InvalidState {
                operation: "enqueue".to_string(),
                status: "stopped".to_string(),
            });
        }

        let now = self.inner.clock.now_utc();
        let snapshot = {
            let mut state = self.inner.state.lock();
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::Internal(format!("task not found: {task_id}")))?;
            let from = task.status;
            task.transition(TaskStatus::Queued, now)?;
            let priority = task.priority;
            let snapshot = task.clone();
            state.queue.admit(task_id, priority);
            drop(state);
            self.publish_state_change(task_id, from, TaskStatus::Queued);
            snapshot
        };
        self.refresh_queue_metrics();
        persist_task(&self.inner, &snapshot).await;
        self.inner.wakeup.notify_one();
        Ok(())
    }

    pub fn get_task(&self, task_id: TaskId) -> Option<Task> {
        self.inner.state.lock().tasks.get(&task_id).cloned()
    }

    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        task_type: Option<&str>,
    ) -> Vec<Task> {
        let state = self.inner.state.lock();
        state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .filter(|t| task_type.map_or(true, |ty| t.task_type == ty))
            .cloned()
            .collect()
    }

    /// Request a pause; honoured by the worker at the next suspension point
    pub fn pause_task(&self, task_id: TaskId) -> Result<()> {
        let state = self.inner.state.lock();
        let task = state
            .tasks
            .get(&task_id)
            .ok_or_else(|| Error::Internal(format!("task not found: {task_id}")))?;
        if task.status != TaskStatus::Running {
            return Err(Error::InvalidState {
                operation: "pause".to_string(),
                status: task.status.as_str().to_string(),
            });
        }
        if let Some(control) = state.running.get(&task_id) {
            control.pause.cancel();
        }
        Ok(())
    }

    /// Requeue a PAUSED task at its original priority
    pub async fn resume_task(&self, task_id: TaskId) -> Result<()> {
        let now = self.inner.clock.now_utc();
        let snapshot = {
            let mut state = self.inner.state.lock();
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::Internal(format!("task not found: {task_id}")))?;
            if task.status != TaskStatus::Paused {
                return Err(Error::InvalidState {
                    operation: "resume".to_string(),
                    status: task.status.as_str().to_string(),
                });
            }
            task.transition(TaskStatus::Queued, now)?;
            let priority = task.priority;
            let snapshot = task.clone();
            state.queue.note_suspended(-1);
            state.queue.requeue(task_id, priority);
            snapshot
        };
        self.publish_state_change(task_id, TaskStatus::Paused, TaskStatus::Queued);
        self.refresh_queue_metrics();
        persist_task(&self.inner, &snapshot).await;
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Cancel any non-terminal task; a running task is signalled
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        let now = self.inner.clock.now_utc();
        enum Action {
            Signalled,
            Settled { from: TaskStatus, snapshot: Box<Task> },
        }

        let action = {
            let mut state = self.inner.state.lock();
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::Internal(format!("task not found: {task_id}")))?;
            let from = task.status;
            match from {
                TaskStatus::Running => {
                    if let Some(control) = state.running.get(&task_id) {
                        control.cancel.cancel();
                    }
                    Action::Signalled
                }
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Paused => {
                    task.transition(TaskStatus::Cancelled, now)?;
                    let snapshot = Box::new(task.clone());
                    match from {
                        TaskStatus::Queued => {
                            state.queue.remove_queued(&task_id);
                            state.queue.note_terminal(TaskStatus::Cancelled);
                        }
                        TaskStatus::Paused => {
                            state.queue.note_suspended(-1);
                            state.queue.note_terminal(TaskStatus::Cancelled);
                        }
                        // A PENDING task was never admitted to the queue.
                        _ => {}
                    }
                    Action::Settled { from, snapshot }
                }
                other => {
                    return Err(Error::InvalidState {
                        operation: "cancel".to_string(),
                        status: other.as_str().to_string(),
                    })
                }
            }
        };

        if let Action::Settled { from, snapshot } = action {
            self.publish_state_change(task_id, from, TaskStatus::Cancelled);
            self.refresh_queue_metrics();
            persist_task(&self.inner, &snapshot).await;
        }
        Ok(())
    }

    /// Requeue a FAILED task with a fresh retry budget
    pub async fn retry_task(&self, task_id: TaskId) -> Result<()> {
        let now = self.inner.clock.now_utc();
        let snapshot = {
            let mut state = self.inner.state.lock();
            let task = state
                .tasks
                .get_mut(&task_id)
                .ok_or_else(|| Error::Internal(format!("task not found: {task_id}")))?;
            if task.status != TaskStatus::Failed {
                return Err(Error::InvalidState {
                    operation: "retry".to_string(),
                    status: task.status.as_str().to_string(),
                });
            }
            task.retry_count = 0;
            task.progress.reset();
            task.error = None;
            task.transition(TaskStatus::Queued, now)?;
            let priority = task.priority;
            let snapshot = task.clone();
            state.queue.reopen_terminal(TaskStatus::Failed);
            state.queue.requeue(task_id, priority);
            snapshot
        };
        self.publish_state_change(task_id, TaskStatus::Failed, TaskStatus::Queued);
        self.refresh_queue_metrics();
        persist_task(&self.inner, &snapshot).await;
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Enqueue every PENDING task flagged for the bulk action
    pub async fn start_all(&self) -> usize {
        let eligible: Vec<TaskId> = {
            let state = self.inner.state.lock();
            state
                .tasks
                .values()
                .filter(|t| t.include_in_global_start && t.status == TaskStatus::Pending)
                .map(|t| t.id)
                .collect()
        };
        let mut started = 0;
        for task_id in eligible {
            if self.enqueue_task(task_id).await.is_ok() {
                started += 1;
            }
        }
        started
    }

    /// Signal a pause to every RUNNING task flagged for the bulk action
    pub fn pause_all(&self) -> usize {
        let state = self.inner.state.lock();
        let mut paused = 0;
        for task in state.tasks.values() {
            if task.include_in_global_start && task.status == TaskStatus::Running {
                if let Some(control) = state.running.get(&task.id) {
                    control.pause.cancel();
                    paused += 1;
                }
            }
        }
        paused
    }

    /// Start the dispatcher loop
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.inner.accepting.store(true, Ordering::SeqCst);
        let shutdown = CancelToken::new();
        *self.inner.shutdown.lock() = shutdown.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(dispatcher_loop(inner, shutdown))
    }

    /// Stop accepting work, await in-flight tasks up to the shutdown
    /// deadline, then cancel survivors
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.shutdown.lock().cancel();

        let deadline = self.inner.clock.now() + self.inner.config.shutdown_deadline;
        while self.inner.state.lock().running.len() > 0 && self.inner.clock.now() < deadline {
            self.inner.clock.sleep(Duration::from_millis(50)).await;
        }

        let survivors: Vec<CancelToken> = {
            let state = self.inner.state.lock();
            state.running.values().map(|c| c.cancel.clone()).collect()
        };
        if !survivors.is_empty() {
            warn!(count = survivors.len(), "cancelling tasks still running at shutdown");
            for token in survivors {
                token.cancel();
            }
            let grace = self.inner.clock.now() + self.inner.config.cancel_grace;
            while self.inner.state.lock().running.len() > 0 && self.inner.clock.now() < grace {
                self.inner.clock.sleep(Duration::from_millis(50)).await;
            }
        }
        info!("task manager stopped");
    }

    pub fn overview(&self) -> ManagerOverview {
        let state = self.inner.state.lock();
        let mut status_counts: HashMap<&'static str, usize> = HashMap::new();
        for task in state.tasks.values() {
            *status_counts.entry(task.status.as_str()).or_default() += 1;
        }
        ManagerOverview {
            total_tasks: state.tasks.len(),
            status_counts,
            queue: state.queue.stats(),
            handlers: self.inner.registry.len(),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.state.lock().queue.stats()
    }

    /// Query execution history, most recent last
    pub fn executions(&self, filter: &ExecutionFilter) -> Vec<TaskExecution> {
        let executions = self.inner.executions.lock();
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
        matched
    }

    /// Drop terminal tasks from the in-memory map
    pub fn purge_terminal(&self) -> usize {
        let mut state = self.inner.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !task.status.is_terminal());
        before - state.tasks.len()
    }

    /// Reload persisted tasks after a restart.
    ///
    /// Non-terminal tasks requeue; a task persisted as RUNNING is treated
    /// as FAILED with its retry budget unchanged.
    pub async fn recover(&self) -> Result<usize> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(0);
        };
        let loaded = store.load_tasks().await?;
        let now = self.inner.clock.now_utc();
        let mut restored = 0;

        let resaves = {
            let mut state = self.inner.state.lock();
            let mut resaves = Vec::new();
            for mut task in loaded {
                let task_id = task.id;
                match task.status {
                    TaskStatus::Running => {
                        task.transition(TaskStatus::Failed, now)?;
                        task.set_error("interrupted by process restart");
                        resaves.push(task.clone());
                    }
                    TaskStatus::Queued => {
                        let priority = task.priority;
                        state.queue.admit(task_id, priority);
                    }
                    TaskStatus::Paused => {
                        task.transition(TaskStatus::Queued, now)?;
                        let priority = task.priority;
                        state.queue.admit(task_id, priority);
                        resaves.push(task.clone());
                    }
                    _ => {}
                }
                state.tasks.insert(task_id, task);
                restored += 1;
            }
            resaves
        };

        for task in &resaves {
            persist_task(&self.inner, task).await;
        }
        self.inner.wakeup.notify_one();
        Ok(restored)
    }

    fn publish_state_change(&self, task_id: TaskId, from: TaskStatus, to: TaskStatus) {
        self.inner.events.publish(CoreEvent::TaskStateChanged { task_id, from, to });
    }

    fn refresh_queue_metrics(&self) {
        refresh_queue_metrics(&self.inner);
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }
}

fn refresh_queue_metrics(inner: &ManagerInner) {
    let stats = inner.state.lock().queue.stats();
    for (i, priority) in finflow_common::TaskPriority::ALL.iter().enumerate() {
        inner
            .metrics
            .set_queue_depth(priority.as_str(), stats.queued_by_priority[i] as i64);
    }
    inner.metrics.set_running("manager", stats.running as i64);
}

async fn persist_task(inner: &Arc<ManagerInner>, task: &Task) {
    if let Some(store) = &inner.store {
        if let Err(e) = store.save_task(task).await {
            warn!(task_id = %task.id, error = %e, "failed to persist task");
        }
    }
}

async fn record_execution(inner: &Arc<ManagerInner>, execution: TaskExecution) {
    {
        let mut executions = inner.executions.lock();
        executions.push_back(execution.clone());
        while executions.len() > inner.config.execution_history_capacity {
            executions.pop_front();
        }
    }
    if let Some(store) = &inner.store {
        if let Err(e) = store.save_execution(&execution).await {
            warn!(task_id = %execution.task_id, error = %e, "failed to persist execution");
        }
    }
}

async fn dispatcher_loop(inner: Arc<ManagerInner>, shutdown: CancelToken) {
    info!("task dispatcher started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }

        for (task, control) in dispatch_batch(&inner) {
            let task_id = task.id;
            let from = TaskStatus::Queued;
            inner.events.publish(CoreEvent::TaskStateChanged {
                task_id,
                from,
                to: TaskStatus::Running,
            });
            persist_task(&inner, &task).await;
            let worker_inner = Arc::clone(&inner);
            tokio::spawn(run_task(worker_inner, task, control));
        }
        refresh_queue_metrics(&inner);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = inner.wakeup.notified() => {}
        }
    }
    info!("task dispatcher stopped");
}

/// Pop every dispatchable task, marking each RUNNING under the lock
fn dispatch_batch(inner: &Arc<ManagerInner>) -> Vec<(Task, RunningControl)> {
    let now = inner.clock.now_utc();
    let mut state = inner.state.lock();
    let ManagerState { tasks, queue, running } = &mut *state;

    let mut launches = Vec::new();
    while queue.has_capacity() {
        let popped = queue.pop_ready(|task_id| {
            tasks.get(task_id).map_or(false, |task| {
                task.dependencies.iter().all(|dep| {
                    tasks
                        .get(dep)
                        .map_or(false, |d| d.status == TaskStatus::Completed)
                })
            })
        });
        let Some(task_id) = popped else { break };

        let Some(task) = tasks.get_mut(&task_id) else {
            queue.finish_running(&task_id);
            continue;
        };
        if let Err(e) = task.transition(TaskStatus::Running, now) {
            warn!(task_id = %task_id, error = %e, "dispatch raced a state change");
            queue.finish_running(&task_id);
            continue;
        }

        let control = RunningControl {
            cancel: CancelToken::new(),
            pause: CancelToken::new(),
        };
        running.insert(task_id, control.clone());
        launches.push((task.clone(), control));
    }
    launches
}

async fn run_task(inner: Arc<ManagerInner>, task: Task, control: RunningControl) {
    let task_id = task.id;
    let attempt = task.retry_count + 1;
    let run_started = inner.clock.now();
    let mut execution = TaskExecution::begin(task_id, attempt, inner.clock.now_utc());

    let outcome = match inner.registry.resolve(&task.task_type) {
        Err(e) => WorkerOutcome::Done(Err(e)),
        Ok(handler) => {
            let ctx = HandlerContext::new(
                ProgressReporter::new(
                    task_id,
                    Arc::new(ManagerProgressSink {
                        inner: Arc::clone(&inner),
                    }),
                ),
                control.cancel.clone(),
            );
            let params = task.params.clone();
            // A zero timeout means "use the manager default".
            let timeout = if task.timeout.is_zero() {
                inner.config.default_timeout
            } else {
                task.timeout
            };
            tokio::select! {
                res = tokio::time::timeout(timeout, handler.execute(&task, &params, ctx)) => {
                    WorkerOutcome::Done(match res {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(format!(
                            "task {task_id} exceeded {timeout:?}"
                        ))),
                    })
                }
                _ = control.cancel.cancelled() => WorkerOutcome::Done(Err(Error::Cancelled)),
                _ = control.pause.cancelled() => WorkerOutcome::Paused,
            }
        }
    };

    let now = inner.clock.now_utc();
    let duration_secs = (inner.clock.now() - run_started).as_secs_f64();

    match outcome {
        WorkerOutcome::Paused => {
            let snapshot = {
                let mut state = inner.state.lock();
                state.running.remove(&task_id);
                state.queue.finish_running(&task_id);
                state.queue.note_suspended(1);
                state.tasks.get_mut(&task_id).and_then(|task| {
                    task.transition(TaskStatus::Paused, now).ok()?;
                    Some(task.clone())
                })
            };
            execution.finish(TaskStatus::Paused, now, None, None);
            record_execution(&inner, execution).await;
            if let Some(snapshot) = snapshot {
                inner.events.publish(CoreEvent::TaskStateChanged {
                    task_id,
                    from: TaskStatus::Running,
                    to: TaskStatus::Paused,
                });
                persist_task(&inner, &snapshot).await;
            }
            inner.wakeup.notify_one();
        }
        WorkerOutcome::Done(Ok(result)) => {
            let snapshot = {
                let mut state = inner.state.lock();
                state.running.remove(&task_id);
                state.queue.finish_running(&task_id);
                state.queue.note_terminal(TaskStatus::Completed);
                state.tasks.get_mut(&task_id).and_then(|task| {
                    task.transition(TaskStatus::Completed, now).ok()?;
                    task.set_result(result.clone());
                    Some(task.clone())
                })
            };
            execution.finish(TaskStatus::Completed, now, Some(&result), None);
            record_execution(&inner, execution).await;
            if let Some(snapshot) = snapshot {
                inner.metrics.record_task(
                    "completed",
                    snapshot.priority.as_str(),
                    &snapshot.task_type,
                    duration_secs,
                );
                inner.events.publish(CoreEvent::TaskStateChanged {
                    task_id,
                    from: TaskStatus::Running,
                    to: TaskStatus::Completed,
                });
                persist_task(&inner, &snapshot).await;
            }
            inner.wakeup.notify_one();
        }
        WorkerOutcome::Done(Err(Error::Cancelled)) => {
            settle_terminal(&inner, task_id, TaskStatus::Cancelled, &Error::Cancelled, execution)
                .await;
        }
        WorkerOutcome::Done(Err(error)) => {
            let retry = {
                let state = inner.state.lock();
                state.tasks.get(&task_id).map_or(false, |task| {
                    error.is_retryable()
                        && task.retry_count < task.max_retries
                        && !control.cancel.is_cancelled()
                })
            };

            if retry {
                execution.finish(TaskStatus::Failed, now, None, Some(error.to_string().as_str()));
                record_execution(&inner, execution).await;
                let Some((delay, task_type)) = ({
                    let state = inner.state.lock();
                    state.tasks.get(&task_id).map(|task| {
                        (inner.config.backoff.delay(task.retry_count), task.task_type.clone())
                    })
                }) else {
                    return;
                };
                warn!(task_id = %task_id, attempt, %error, delay_ms = delay.as_millis() as u64,
                    "task failed, retrying after backoff");
                inner.metrics.record_retry(&task_type);

                // The task stays RUNNING and holds its slot while the
                // backoff elapses; cancellation short-circuits the retry.
                tokio::select! {
                    _ = inner.clock.sleep(delay) => {
                        let now = inner.clock.now_utc();
                        let snapshot = {
                            let mut state = inner.state.lock();
                            state.running.remove(&task_id);
                            state.queue.finish_running(&task_id);
                            let ManagerState { tasks, queue, .. } = &mut *state;
                            tasks.get_mut(&task_id).and_then(|task| {
                                task.retry_count += 1;
                                task.progress.reset();
                                task.transition(TaskStatus::Queued, now).ok()?;
                                let priority = task.priority;
                                let snapshot = task.clone();
                                queue.requeue(task_id, priority);
                                Some(snapshot)
                            })
                        };
                        if let Some(snapshot) = snapshot {
                            inner.events.publish(CoreEvent::TaskStateChanged {
                                task_id,
                                from: TaskStatus::Running,
                                to: TaskStatus::Queued,
                            });
                            persist_task(&inner, &snapshot).await;
                        }
                        inner.wakeup.notify_one();
                    }
                    _ = control.cancel.cancelled() => {
                        let cancel_execution =
                            TaskExecution::begin(task_id, attempt, inner.clock.now_utc());
                        settle_terminal(
                            &inner,
                            task_id,
                            TaskStatus::Cancelled,
                            &Error::Cancelled,
                            cancel_execution,
                        )
                        .await;
                    }
                }
            } else {
                settle_terminal(&inner, task_id, TaskStatus::Failed, &error, execution).await;
            }
        }
    }
}

async fn settle_terminal(
    inner: &Arc<ManagerInner>,
    task_id: TaskId,
    status: TaskStatus,
    error: &Error,
    mut execution: TaskExecution,
) {
    let now = inner.clock.now_utc();
    let snapshot = {
        let mut state = inner.state.lock();
        state.running.remove(&task_id);
        state.queue.finish_running(&task_id);
        state.queue.note_terminal(status);
        state.tasks.get_mut(&task_id).and_then(|task| {
            task.transition(status, now).ok()?;
            task.set_error(error.to_string());
            Some(task.clone())
        })
    };
    execution.finish(status, now, None, Some(error.to_string().as_str()));
    record_execution(inner, execution).await;

    if let Some(snapshot) = snapshot {
        inner.metrics.record_task(
            status.as_str(),
            snapshot.priority.as_str(),
            &snapshot.task_type,
            0.0,
        );
        inner
            .metrics
            .record_error(error.kind(), error.severity().as_str());
        inner.events.publish(CoreEvent::TaskStateChanged {
            task_id,
            from: TaskStatus::Running,
            to: status,
        });
        persist_task(inner, &snapshot).await;
    }
    inner.wakeup.notify_one();
}
