//! DAG execution engine

use crate::dag::Dag;
use chrono::{DateTime, Utc};
use finflow_common::{
    metrics::MetricsCollector, DagId, Error, NodeId, Result, TaskStatus, ValueMap,
};
use finflow_core::{
    BackoffPolicy, CancelToken, Clock, CoreEvent, EventBus, HandlerContext, HandlerRegistry,
    ProgressReporter, ProgressSink, Task, TaskHandler,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct DagEngineConfig {
    pub max_concurrent_tasks: usize,
    pub execution_log_capacity: usize,
    /// Default failure propagation; overridable per DAG at registration
    pub strict_propagation: bool,
    pub backoff: BackoffPolicy,
}

impl Default for DagEngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            execution_log_capacity: 10_000,
            strict_propagation: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Execution log event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    DagStarted,
    DagCompleted,
    DagFailed,
    DagCancelled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeRetrying,
    NodeSkipped,
}

impl LogEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DagStarted => "dag_started",
            Self::DagCompleted => "dag_completed",
            Self::DagFailed => "dag_failed",
            Self::DagCancelled => "dag_cancelled",
            Self::NodeStarted => "node_started",
            Self::NodeCompleted => "node_completed",
            Self::NodeFailed => "node_failed",
            Self::NodeRetrying => "node_retrying",
            Self::NodeSkipped => "node_skipped",
        }
    }
}

/// One entry of the bounded in-memory execution log
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLogEntry {
    pub log_id: Uuid,
    pub dag_id: DagId,
    pub node_id: Option<NodeId>,
    pub event: LogEvent,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
}

/// Result of one DAG execution
#[derive(Debug, Clone)]
pub struct DagRunSummary {
    pub dag_id: DagId,
    pub status: TaskStatus,
    pub nodes_succeeded: usize,
    pub nodes_failed: usize,
    pub nodes_skipped: usize,
    pub total_nodes: usize,
    pub duration_ms: u64,
    pub context: ValueMap,
    pub errors: Vec<String>,
}

/// Status snapshot for listings
#[derive(Debug, Clone)]
pub struct DagStatusSummary {
    pub id: DagId,
    pub name: String,
    pub status: TaskStatus,
    pub total_nodes: usize,
    pub status_counts: HashMap<&'static str, usize>,
}

/// Per-node progress callback: `(dag_id, node_id, fraction)`
pub type ProgressCallback = Arc<dyn Fn(&str, &str, f64) + Send + Sync>;

enum NodeMsg {
    Progress { node_id: NodeId, fraction: f64 },
    Done { node_id: NodeId, outcome: Result<ValueMap> },
    RetryReady { node_id: NodeId },
}

struct NodeProgressSink {
    node_id: NodeId,
    tx: mpsc::UnboundedSender<NodeMsg>,
}

impl ProgressSink for NodeProgressSink {
    fn report(&self, _task_id: finflow_common::TaskId, fraction: f64, _message: &str) {
        let _ = self.tx.send(NodeMsg::Progress {
            node_id: self.node_id.clone(),
            fraction,
        });
    }
}

/// Executes registered DAGs honoring dependencies, running independent
/// nodes in parallel, retrying failures with backoff, and recording an
/// execution log.
pub struct DagEngine {
    config: DagEngineConfig,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,
    dags: Mutex<HashMap<DagId, Dag>>,
    strict_modes: DashMap<DagId, bool>,
    runs: DashMap<DagId, CancelToken>,
    logs: Mutex<VecDeque<ExecutionLogEntry>>,
}

impl DagEngine {
    pub fn new(
        config: DagEngineConfig,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            clock,
            events,
            metrics,
            dags: Mutex::new(HashMap::new()),
            strict_modes: DashMap::new(),
            runs: DashMap::new(),
            logs: Mutex::new(VecDeque::new()),
        }
    }

    /// Register a DAG with the engine's default propagation mode
    pub fn register_dag(&self, dag: Dag) -> Result<DagId> {
        self.register_dag_with_mode(dag, self.config.strict_propagation)
    }

    /// Register a DAG; rejected on cycles or dangling dependencies
    pub fn register_dag_with_mode(&self, dag: Dag, strict: bool) -> Result<DagId> {
        dag.ensure_valid()?;
        let dag_id = dag.id.clone();
        info!(dag_id = %dag_id, nodes = dag.len(), strict, "registered DAG");
        self.strict_modes.insert(dag_id.clone(), strict);
        self.dags.lock().insert(dag_id.clone(), dag);
        Ok(dag_id)
    }

    /// Snapshot of a registered DAG
    pub fn get_dag(&self, dag_id: &str) -> Option<Dag> {
        self.dags.lock().get(dag_id).cloned()
    }

    pub fn dag_status(&self, dag_id: &str) -> Option<DagStatusSummary> {
        let dags = self.dags.lock();
        let dag = dags.get(dag_id)?;
        Some(DagStatusSummary {
            id: dag.id.clone(),
            name: dag.name.clone(),
            status: dag.status,
            total_nodes: dag.len(),
            status_counts: dag.status_counts(),
        })
    }

    pub fn list_dags(&self) -> Vec<DagStatusSummary> {
        let dags = self.dags.lock();
        dags.values()
            .map(|dag| DagStatusSummary {
                id: dag.id.clone(),
                name: dag.name.clone(),
                status: dag.status,
                total_nodes: dag.len(),
                status_counts: dag.status_counts(),
            })
            .collect()
    }

    /// Query the execution log, most recent last
    pub fn logs(
        &self,
        dag_id: Option<&str>,
        node_id: Option<&str>,
        limit: usize,
    ) -> Vec<ExecutionLogEntry> {
        let logs = self.logs.lock();
        let matched: Vec<ExecutionLogEntry> = logs
            .iter()
            .filter(|entry| dag_id.map_or(true, |d| entry.dag_id == d))
            .filter(|entry| node_id.map_or(true, |n| entry.node_id.as_deref() == Some(n)))
            .cloned()
            .collect();
        let start = matched.len().saturating_sub(limit);
        matched[start..].to_vec()
    }

    fn log(
        &self,
        dag_id: &str,
        node_id: Option<&str>,
        event: LogEvent,
        status: TaskStatus,
        message: Option<String>,
        duration_ms: Option<u64>,
    ) {
        if matches!(
            event,
            LogEvent::NodeStarted
                | LogEvent::NodeCompleted
                | LogEvent::NodeFailed
                | LogEvent::NodeRetrying
                | LogEvent::NodeSkipped
        ) {
            self.metrics.record_node_event(event.as_str());
        }
        let mut logs = self.logs.lock();
        logs.push_back(ExecutionLogEntry {
            log_id: Uuid::new_v4(),
            dag_id: dag_id.to_string(),
            node_id: node_id.map(ToOwned::to_owned),
            event,
            status,
            message,
            timestamp: self.clock.now_utc(),
            duration_ms,
        });
        while logs.len() > self.config.execution_log_capacity {
            logs.pop_front();
        }
    }

    /// Cancel a DAG: running nodes are signalled, pending nodes SKIPPED
    #[instrument(skip(self))]
    pub fn cancel_dag(&self, dag_id: &str) -> Result<()> {
        if let Some(token) = self.runs.get(dag_id).map(|entry| entry.value().clone()) {
            token.cancel();
            return Ok(());
        }

        // Not executing: settle the DAG statically.
        let skipped = {
            let mut dags = self.dags.lock();
            let dag = dags
                .get_mut(dag_id)
                .ok_or_else(|| Error::Validation(format!("DAG not found: {dag_id}")))?;
            if dag.status.is_terminal() {
                return Err(Error::InvalidState {
                    operation: "cancel".to_string(),
                    status: dag.status.as_str().to_string(),
                });
            }
            let now = self.clock.now_utc();
            let mut skipped = Vec::new();
            let node_ids: Vec<NodeId> = dag.node_ids().to_vec();
            for node_id in node_ids {
                if let Some(node) = dag.node_mut(&node_id) {
                    if node.status == TaskStatus::Pending {
                        node.status = TaskStatus::Skipped;
                        node.completed_at = Some(now);
                        skipped.push(node_id);
                    }
                }
            }
            dag.status = TaskStatus::Cancelled;
            dag.completed_at = Some(now);
            skipped
        };

        for node_id in &skipped {
            self.log(
                dag_id,
                Some(node_id),
                LogEvent::NodeSkipped,
                TaskStatus::Skipped,
                Some("DAG cancelled".to_string()),
                None,
            );
            self.events.publish(CoreEvent::NodeStateChanged {
                dag_id: dag_id.to_string(),
                node_id: node_id.clone(),
                status: TaskStatus::Skipped,
            });
        }
        self.log(
            dag_id,
            None,
            LogEvent::DagCancelled,
            TaskStatus::Cancelled,
            None,
            None,
        );
        self.events.publish(CoreEvent::DagStateChanged {
            dag_id: dag_id.to_string(),
            status: TaskStatus::Cancelled,
        });
        Ok(())
    }

    /// Execute a registered DAG to completion
    pub async fn execute_dag(&self, dag_id: &str) -> Result<DagRunSummary> {
        self.execute_dag_with(dag_id, ValueMap::new(), None).await
    }

    /// Execute with seed context and an optional per-node progress callback
    #[instrument(skip(self, context, on_progress))]
    pub async fn execute_dag_with(
        &self,
        dag_id: &str,
        context: ValueMap,
        on_progress: Option<ProgressCallback>,
    ) -> Result<DagRunSummary> {
        let strict = self
            .strict_modes
            .get(dag_id)
            .map(|entry| *entry.value())
            .unwrap_or(self.config.strict_propagation);
        let run_started = self.clock.now();

        {
            let mut dags = self.dags.lock();
            let dag = dags
                .get_mut(dag_id)
                .ok_or_else(|| Error::Validation(format!("DAG not found: {dag_id}")))?;
            if dag.status != TaskStatus::Pending {
                return Err(Error::InvalidState {
                    operation: "execute".to_string(),
                    status: dag.status.as_str().to_string(),
                });
            }
            dag.status = TaskStatus::Running;
            dag.started_at = Some(self.clock.now_utc());
            dag.context.extend(context);
        }

        let token = CancelToken::new();
        self.runs.insert(dag_id.to_string(), token.clone());
        self.log(
            dag_id,
            None,
            LogEvent::DagStarted,
            TaskStatus::Running,
            None,
            None,
        );
        self.events.publish(CoreEvent::DagStateChanged {
            dag_id: dag_id.to_string(),
            status: TaskStatus::Running,
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<NodeMsg>();
        // Nodes running or sleeping out a retry backoff; both hold a slot.
        let mut in_flight: HashSet<NodeId> = HashSet::new();
        let mut cancelled = false;

        loop {
            if !cancelled {
                self.launch_ready(dag_id, strict, &mut in_flight, &token, &tx);
            }

            let idle = {
                let dags = self.dags.lock();
                dags.get(dag_id)
                    .map_or(true, |dag| in_flight.is_empty() && dag.ready_nodes(strict).is_empty())
            };
            if idle {
                break;
            }

            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle_node_msg(
                        dag_id,
                        strict,
                        msg,
                        &mut in_flight,
                        cancelled,
                        &token,
                        &tx,
                        on_progress.as_ref(),
                    ),
                    None => break,
                },
                _ = token.cancelled(), if !cancelled => {
                    cancelled = true;
                    self.skip_pending(dag_id, "DAG cancelled");
                }
            }
        }

        self.runs.remove(dag_id);
        self.finalize(dag_id, cancelled, run_started)
    }

    /// Move every ready node into flight, up to the concurrency bound
    fn launch_ready(
        &self,
        dag_id: &str,
        strict: bool,
        in_flight: &mut HashSet<NodeId>,
        token: &CancelToken,
        tx: &mpsc::UnboundedSender<NodeMsg>,
    ) {
        struct Launch {
            node_id: NodeId,
            handler: Arc<dyn TaskHandler>,
            name: String,
            task_type: String,
            params: ValueMap,
            timeout: Duration,
        }

        let mut launches: Vec<Launch> = Vec::new();
        let mut immediate_failures: Vec<(NodeId, Error)> = Vec::new();

        {
            let mut dags = self.dags.lock();
            let Some(dag) = dags.get_mut(dag_id) else { return };
            let now = self.clock.now_utc();

            for node_id in dag.ready_nodes(strict) {
                if in_flight.len() + launches.len() >= self.config.max_concurrent_tasks {
                    break;
                }

                let context_snapshot = dag.context.clone();
                let Some(node) = dag.node_mut(&node_id) else { continue };
                let task_type = node.task_type.clone().unwrap_or_default();

                node.status = TaskStatus::Running;
                node.started_at = Some(now);
                node.progress = 0.0;

                match self.registry.resolve(&task_type) {
                    Ok(handler) => {
                        let mut params = node.params.clone();
                        params.insert(
                            "context".to_string(),
                            serde_json::Value::Object(
                                context_snapshot
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.clone()))
                                    .collect(),
                            ),
                        );
                        launches.push(Launch {
                            node_id: node_id.clone(),
                            handler,
                            name: node.name.clone(),
                            task_type,
                            params,
                            timeout: node.timeout,
                        });
                    }
                    Err(e) => immediate_failures.push((node_id.clone(), e)),
                }
            }
        }

        for launch in launches {
            in_flight.insert(launch.node_id.clone());
            self.log(
                dag_id,
                Some(&launch.node_id),
                LogEvent::NodeStarted,
                TaskStatus::Running,
                None,
                None,
            );
            self.events.publish(CoreEvent::NodeStateChanged {
                dag_id: dag_id.to_string(),
                node_id: launch.node_id.clone(),
                status: TaskStatus::Running,
            });

            let node_token = token.child();
            let node_tx = tx.clone();
            let node_id = launch.node_id;
            let handler = launch.handler;
            let params = launch.params;
            let timeout = launch.timeout;
            let task = Task::new(launch.name, launch.task_type);
            tokio::spawn(async move {
                let ctx = HandlerContext::new(
                    ProgressReporter::new(
                        task.id,
                        Arc::new(NodeProgressSink {
                            node_id: node_id.clone(),
                            tx: node_tx.clone(),
                        }),
                    ),
                    node_token.clone(),
                );
                let outcome = tokio::select! {
                    res = tokio::time::timeout(timeout, handler.execute(&task, &params, ctx)) => {
                        match res {
                            Ok(result) => result,
                            Err(_) => Err(Error::Timeout(format!(
                                "node {node_id} exceeded {timeout:?}"
                            ))),
                        }
                    }
                    () = node_token.cancelled() => Err(Error::Cancelled),
                };
                let _ = node_tx.send(NodeMsg::Done { node_id, outcome });
            });
        }

        // Nodes without a registered handler fail terminally; the retry
        // budget does not apply to an unknown task type.
        for (node_id, error) in immediate_failures {
            in_flight.insert(node_id.clone());
            let _ = tx.send(NodeMsg::Done {
                node_id,
                outcome: Err(error),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_node_msg(
        &self,
        dag_id: &str,
        strict: bool,
        msg: NodeMsg,
        in_flight: &mut HashSet<NodeId>,
        cancelled: bool,
        token: &CancelToken,
        tx: &mpsc::UnboundedSender<NodeMsg>,
        on_progress: Option<&ProgressCallback>,
    ) {
        match msg {
            NodeMsg::Progress { node_id, fraction } => {
                let mut dags = self.dags.lock();
                if let Some(node) = dags
                    .get_mut(dag_id)
                    .and_then(|dag| dag.node_mut(&node_id))
                {
                    let clamped = fraction.clamp(0.0, 1.0);
                    if clamped > node.progress {
                        node.progress = clamped;
                    }
                }
                drop(dags);
                if let Some(callback) = on_progress {
                    callback(dag_id, &node_id, fraction.clamp(0.0, 1.0));
                }
            }
            NodeMsg::Done { node_id, outcome } => {
                self.settle_node(dag_id, strict, &node_id, outcome, in_flight, cancelled, token, tx);
            }
            NodeMsg::RetryReady { node_id } => {
                in_flight.remove(&node_id);
                let now = self.clock.now_utc();
                let mut dags = self.dags.lock();
                if let Some(node) = dags
                    .get_mut(dag_id)
                    .and_then(|dag| dag.node_mut(&node_id))
                {
                    if cancelled {
                        node.status = TaskStatus::Cancelled;
                        node.completed_at = Some(now);
                    } else {
                        node.status = TaskStatus::Pending;
                        node.progress = 0.0;
                        node.error = None;
                    }
                }
                drop(dags);
                if cancelled {
                    self.events.publish(CoreEvent::NodeStateChanged {
                        dag_id: dag_id.to_string(),
                        node_id,
                        status: TaskStatus::Cancelled,
                    });
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn settle_node(
        &self,
        dag_id: &str,
        strict: bool,
        node_id: &NodeId,
        outcome: Result<ValueMap>,
        in_flight: &mut HashSet<NodeId>,
        cancelled: bool,
        token: &CancelToken,
        tx: &mpsc::UnboundedSender<NodeMsg>,
    ) {
        let now = self.clock.now_utc();

        match outcome {
            Ok(result) => {
                in_flight.remove(node_id);
                let duration_ms = {
                    let mut dags = self.dags.lock();
                    let Some(dag) = dags.get_mut(dag_id) else { return };

                    // Install the result into the shared context: once keyed
                    // by node id, and shallow-merged so downstream handlers
                    // see accumulated keys.
                    dag.context.insert(
                        node_id.clone(),
                        serde_json::Value::Object(
                            result.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                        ),
                    );
                    for (key, value) in &result {
                        dag.context.insert(key.clone(), value.clone());
                    }

                    let Some(node) = dag.node_mut(node_id) else { return };
                    node.status = TaskStatus::Completed;
                    node.completed_at = Some(now);
                    node.progress = 1.0;
                    node.result = Some(result);
                    node.started_at
                        .map(|s| (now - s).num_milliseconds().max(0) as u64)
                };
                self.log(
                    dag_id,
                    Some(node_id),
                    LogEvent::NodeCompleted,
                    TaskStatus::Completed,
                    None,
                    duration_ms,
                );
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: dag_id.to_string(),
                    node_id: node_id.clone(),
                    status: TaskStatus::Completed,
                });
            }
            Err(Error::Cancelled) => {
                in_flight.remove(node_id);
                {
                    let mut dags = self.dags.lock();
                    if let Some(node) = dags
                        .get_mut(dag_id)
                        .and_then(|dag| dag.node_mut(node_id))
                    {
                        node.status = TaskStatus::Cancelled;
                        node.completed_at = Some(now);
                    }
                }
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: dag_id.to_string(),
                    node_id: node_id.clone(),
                    status: TaskStatus::Cancelled,
                });
            }
            Err(error) => {
                let retry = {
                    let mut dags = self.dags.lock();
                    let Some(node) = dags
                        .get_mut(dag_id)
                        .and_then(|dag| dag.node_mut(node_id))
                    else {
                        in_flight.remove(node_id);
                        return;
                    };
                    if error.is_retryable() && node.retry_count < node.max_retries && !cancelled {
                        node.retry_count += 1;
                        Some(node.retry_count)
                    } else {
                        node.status = TaskStatus::Failed;
                        node.completed_at = Some(now);
                        node.error = Some(error.to_string());
                        None
                    }
                };

                match retry {
                    Some(attempt) => {
                        // Slot stays held while the backoff elapses.
                        warn!(dag_id, node_id = %node_id, attempt, %error, "node failed, retrying");
                        self.log(
                            dag_id,
                            Some(node_id),
                            LogEvent::NodeRetrying,
                            TaskStatus::Running,
                            Some(format!("attempt {attempt}: {error}")),
                            None,
                        );
                        let delay = self.config.backoff.delay(attempt - 1);
                        let clock = Arc::clone(&self.clock);
                        let run_token = token.clone();
                        let retry_tx = tx.clone();
                        let retry_node = node_id.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = clock.sleep(delay) => {}
                                _ = run_token.cancelled() => {}
                            }
                            let _ = retry_tx.send(NodeMsg::RetryReady { node_id: retry_node });
                        });
                    }
                    None => {
                        in_flight.remove(node_id);
                        self.log(
                            dag_id,
                            Some(node_id),
                            LogEvent::NodeFailed,
                            TaskStatus::Failed,
                            Some(error.to_string()),
                            None,
                        );
                        self.events.publish(CoreEvent::NodeStateChanged {
                            dag_id: dag_id.to_string(),
                            node_id: node_id.clone(),
                            status: TaskStatus::Failed,
                        });
                        if strict {
                            self.skip_descendants(dag_id, node_id);
                        }
                    }
                }
            }
        }
    }

    /// Mark the transitive dependents of a failed node SKIPPED (strict mode)
    fn skip_descendants(&self, dag_id: &str, node_id: &NodeId) {
        let now = self.clock.now_utc();
        let skipped: Vec<NodeId> = {
            let mut dags = self.dags.lock();
            let Some(dag) = dags.get_mut(dag_id) else { return };
            let descendants = dag.descendants(node_id);
            let mut skipped = Vec::new();
            for descendant in descendants {
                if let Some(node) = dag.node_mut(&descendant) {
                    if node.status == TaskStatus::Pending {
                        node.status = TaskStatus::Skipped;
                        node.completed_at = Some(now);
                        node.error = Some(format!("dependency {node_id} failed"));
                        skipped.push(descendant);
                    }
                }
            }
            skipped
        };

        for descendant in skipped {
            self.log(
                dag_id,
                Some(&descendant),
                LogEvent::NodeSkipped,
                TaskStatus::Skipped,
                Some(format!("dependency {node_id} failed")),
                None,
            );
            self.events.publish(CoreEvent::NodeStateChanged {
                dag_id: dag_id.to_string(),
                node_id: descendant,
                status: TaskStatus::Skipped,
            });
        }
    }

    /// Mark every PENDING node SKIPPED (cancellation path)
    fn skip_pending(&self, dag_id: &str, reason: &str) {
        let now = self.clock.now_utc();
        let skipped: Vec<NodeId> = {
            let mut dags = self.dags.lock();
            let Some(dag) = dags.get_mut(dag_id) else { return };
            let node_ids: Vec<NodeId> = dag.node_ids().to_vec();
            let mut skipped = Vec::new();
            for node_id in node_ids {
                if let Some(node) = dag.node_mut(&node_id) {
                    if node.status == TaskStatus::Pending {
                        node.status = TaskStatus::Skipped;
                        node.completed_at = Some(now);
                        skipped.push(node_id);
                    }
                }
            }
            skipped
        };

        for node_id in skipped {
            self.log(
                dag_id,
                Some(&node_id),
                LogEvent::NodeSkipped,
                TaskStatus::Skipped,
                Some(reason.to_string()),
                None,
            );
            self.events.publish(CoreEvent::NodeStateChanged {
                dag_id: dag_id.to_string(),
                node_id,
                status: TaskStatus::Skipped,
            });
        }
    }

    fn finalize(
        &self,
        dag_id: &str,
        cancelled: bool,
        run_started: tokio::time::Instant,
    ) -> Result<DagRunSummary> {
        let now = self.clock.now_utc();
        let (summary, final_status) = {
            let mut dags = self.dags.lock();
            let dag = dags
                .get_mut(dag_id)
                .ok_or_else(|| Error::Internal(format!("DAG vanished: {dag_id}")))?;

            let mut succeeded = 0;
            let mut failed = 0;
            let mut skipped = 0;
            let mut errors = Vec::new();
            for node in dag.nodes() {
                match node.status {
                    TaskStatus::Completed => succeeded += 1,
                    TaskStatus::Failed => {
                        failed += 1;
                        if let Some(error) = &node.error {
                            errors.push(format!("{}: {error}", node.id));
                        }
                    }
                    TaskStatus::Skipped => skipped += 1,
                    _ => {}
                }
            }

            let status = if cancelled {
                TaskStatus::Cancelled
            } else if failed > 0 {
                TaskStatus::Failed
            } else {
                TaskStatus::Completed
            };
            dag.status = status;
            dag.completed_at = Some(now);

            let duration_ms = (self.clock.now() - run_started).as_millis() as u64;
            (
                DagRunSummary {
                    dag_id: dag_id.to_string(),
                    status,
                    nodes_succeeded: succeeded,
                    nodes_failed: failed,
                    nodes_skipped: skipped,
                    total_nodes: dag.len(),
                    duration_ms,
                    context: dag.context.clone(),
                    errors,
                },
                status,
            )
        };

        let event = match final_status {
            TaskStatus::Cancelled => LogEvent::DagCancelled,
            TaskStatus::Failed => LogEvent::DagFailed,
            _ => LogEvent::DagCompleted,
        };
        self.log(
            dag_id,
            None,
            event,
            final_status,
            None,
            Some(summary.duration_ms),
        );
        self.events.publish(CoreEvent::DagStateChanged {
            dag_id: dag_id.to_string(),
            status: final_status,
        });

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::DagBuilder;
    use finflow_common::metrics::NoopMetricsCollector;
    use finflow_core::SystemClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn test_engine(
        max_concurrent: usize,
        strict: bool,
        log_capacity: usize,
    ) -> (Arc<DagEngine>, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        let engine = Arc::new(DagEngine::new(
            DagEngineConfig {
                max_concurrent_tasks: max_concurrent,
                execution_log_capacity: log_capacity,
                strict_propagation: strict,
                backoff: BackoffPolicy::default(),
            },
            Arc::clone(&registry),
            Arc::new(SystemClock),
            EventBus::default(),
            Arc::new(NoopMetricsCollector),
        ));
        (engine, registry)
    }

    fn label_params(label: &str) -> ValueMap {
        let mut params = ValueMap::new();
        params.insert("label".to_string(), json!(label));
        params
    }

    /// Appends its `label` param to the `trace` array threaded through context
    fn register_trace_handler(registry: &HandlerRegistry) {
        registry.register_fn("trace", |_task, params, _ctx| async move {
            let label = params
                .get("label")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut trace: Vec<serde_json::Value> = params
                .get("context")
                .and_then(|c| c.get("trace"))
                .and_then(|t| t.as_array())
                .cloned()
                .unwrap_or_default();
            trace.push(json!(label));
            let mut out = ValueMap::new();
            out.insert("trace".to_string(), serde_json::Value::Array(trace));
            Ok(out)
        });
    }

    #[tokio::test]
    async fn linear_chain_threads_context_in_order() {
        let (engine, registry) = test_engine(4, false, 10_000);
        register_trace_handler(&registry);

        let dag = DagBuilder::new("linear")
            .add_task("a", "A", "trace")
            .params(label_params("A"))
            .add_task("b", "B", "trace")
            .params(label_params("B"))
            .depends_on(["a"])
            .add_task("c", "C", "trace")
            .params(label_params("C"))
            .depends_on(["b"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();

        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.nodes_succeeded, 3);
        assert_eq!(summary.context["trace"], json!(["A", "B", "C"]));

        let completions: Vec<String> = engine
            .logs(Some(dag_id.as_str()), None, 100)
            .into_iter()
            .filter(|entry| entry.event == LogEvent::NodeCompleted)
            .filter_map(|entry| entry.node_id)
            .collect();
        assert_eq!(completions, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn diamond_runs_middle_nodes_concurrently() {
        let (engine, registry) = test_engine(4, false, 10_000);

        let gauge = Arc::new(Mutex::new((0usize, 0usize)));
        let sleeper_gauge = Arc::clone(&gauge);
        registry.register_fn("step", move |_task, _params, _ctx| {
            let gauge = Arc::clone(&sleeper_gauge);
            async move {
                {
                    let mut g = gauge.lock();
                    g.0 += 1;
                    g.1 = g.1.max(g.0);
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                gauge.lock().0 -= 1;
                Ok(ValueMap::new())
            }
        });

        let sink_runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&sink_runs);
        registry.register_fn("sink", move |_task, _params, _ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(ValueMap::new())
            }
        });

        let dag = DagBuilder::new("diamond")
            .add_task("a", "A", "step")
            .add_task("b", "B", "step")
            .depends_on(["a"])
            .add_task("c", "C", "step")
            .depends_on(["a"])
            .add_task("d", "D", "sink")
            .depends_on(["b", "c"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();

        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(sink_runs.load(AtomicOrdering::SeqCst), 1);
        assert!(gauge.lock().1 >= 2, "b and c should overlap");

        // d starts only after both b and c completed.
        let logs = engine.logs(Some(dag_id.as_str()), None, 100);
        let position = |event: LogEvent, node: &str| {
            logs.iter()
                .position(|e| e.event == event && e.node_id.as_deref() == Some(node))
                .unwrap()
        };
        assert!(position(LogEvent::NodeCompleted, "b") < position(LogEvent::NodeStarted, "d"));
        assert!(position(LogEvent::NodeCompleted, "c") < position(LogEvent::NodeStarted, "d"));
    }

    #[tokio::test(start_paused = true)]
    async fn max_concurrent_one_serializes_execution() {
        let (engine, registry) = test_engine(1, false, 10_000);

        let gauge = Arc::new(Mutex::new((0usize, 0usize)));
        let handler_gauge = Arc::clone(&gauge);
        registry.register_fn("step", move |_task, _params, _ctx| {
            let gauge = Arc::clone(&handler_gauge);
            async move {
                {
                    let mut g = gauge.lock();
                    g.0 += 1;
                    g.1 = g.1.max(g.0);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                gauge.lock().0 -= 1;
                Ok(ValueMap::new())
            }
        });

        let dag = DagBuilder::new("serial")
            .add_task("a", "A", "step")
            .add_task("b", "B", "step")
            .add_task("c", "C", "step")
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(gauge.lock().1, 1, "no two handlers may overlap");
    }

    #[tokio::test(start_paused = true)]
    async fn node_retries_with_backoff_then_succeeds() {
        let (engine, registry) = test_engine(2, false, 10_000);

        let attempts = Arc::new(AtomicU32::new(0));
        let handler_attempts = Arc::clone(&attempts);
        registry.register_fn("flaky", move |_task, _params, _ctx| {
            let attempts = Arc::clone(&handler_attempts);
            async move {
                let n = attempts.fetch_add(1, AtomicOrdering::SeqCst);
                if n < 2 {
                    Err(Error::Handler("transient upstream failure".to_string()))
                } else {
                    Ok(ValueMap::new())
                }
            }
        });

        let dag = DagBuilder::new("retry")
            .add_task("a", "A", "flaky")
            .max_retries(2)
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();

        let started = tokio::time::Instant::now();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
        // Backoffs of 1s then 2s elapsed between attempts.
        assert!(started.elapsed() >= Duration::from_secs(3));

        let dag = engine.get_dag(&dag_id).unwrap();
        assert_eq!(dag.node("a").unwrap().retry_count, 2);

        let retrying = engine
            .logs(Some(dag_id.as_str()), Some("a"), 100)
            .into_iter()
            .filter(|e| e.event == LogEvent::NodeRetrying)
            .count();
        assert_eq!(retrying, 2);
    }

    #[tokio::test]
    async fn zero_retry_budget_fails_on_first_error() {
        let (engine, registry) = test_engine(2, false, 10_000);

        let attempts = Arc::new(AtomicU32::new(0));
        let handler_attempts = Arc::clone(&attempts);
        registry.register_fn("broken", move |_task, _params, _ctx| {
            let attempts = Arc::clone(&handler_attempts);
            async move {
                attempts.fetch_add(1, AtomicOrdering::SeqCst);
                Err(Error::Handler("always fails".to_string()))
            }
        });

        let dag = DagBuilder::new("no_retry")
            .add_task("a", "A", "broken")
            .max_retries(0)
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Failed);
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(summary.errors.len(), 1);
    }

    #[tokio::test]
    async fn nonstrict_failure_leaves_dependents_pending() {
        let (engine, registry) = test_engine(2, false, 10_000);
        registry.register_fn("broken", |_task, _params, _ctx| async {
            Err(Error::Handler("boom".to_string()))
        });

        let dag = DagBuilder::new("nonstrict")
            .add_task("a", "A", "broken")
            .max_retries(0)
            .add_task("b", "B", "broken")
            .depends_on(["a"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Failed);
        assert_eq!(summary.nodes_failed, 1);
        assert_eq!(summary.nodes_skipped, 0);
        let dag = engine.get_dag(&dag_id).unwrap();
        assert_eq!(dag.node("b").unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn strict_failure_skips_dependents_transitively() {
        let (engine, registry) = test_engine(2, true, 10_000);
        registry.register_fn("broken", |_task, _params, _ctx| async {
            Err(Error::Handler("boom".to_string()))
        });

        let dag = DagBuilder::new("strict")
            .add_task("a", "A", "broken")
            .max_retries(0)
            .add_task("b", "B", "broken")
            .depends_on(["a"])
            .add_task("c", "C", "broken")
            .depends_on(["b"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Failed);
        assert_eq!(summary.nodes_failed, 1);
        assert_eq!(summary.nodes_skipped, 2);
        let dag = engine.get_dag(&dag_id).unwrap();
        assert_eq!(dag.node("b").unwrap().status, TaskStatus::Skipped);
        assert_eq!(dag.node("c").unwrap().status, TaskStatus::Skipped);

        let skipped_logs = engine
            .logs(Some(dag_id.as_str()), None, 100)
            .into_iter()
            .filter(|e| e.event == LogEvent::NodeSkipped)
            .count();
        assert_eq!(skipped_logs, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_cancels_running_and_skips_pending() {
        let (engine, registry) = test_engine(2, false, 10_000);
        registry.register_fn("long", |_task, _params, ctx| async move {
            loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let dag = DagBuilder::new("cancel")
            .add_task("a", "A", "long")
            .add_task("b", "B", "long")
            .depends_on(["a"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();

        let runner = Arc::clone(&engine);
        let run_id = dag_id.clone();
        let handle = tokio::spawn(async move { runner.execute_dag(&run_id).await });

        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.cancel_dag(&dag_id).unwrap();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.status, TaskStatus::Cancelled);

        let dag = engine.get_dag(&dag_id).unwrap();
        assert_eq!(dag.node("a").unwrap().status, TaskStatus::Cancelled);
        assert_eq!(dag.node("b").unwrap().status, TaskStatus::Skipped);
        assert_eq!(dag.node("a").unwrap().retry_count, 0);

        let retrying = engine
            .logs(Some(dag_id.as_str()), None, 100)
            .into_iter()
            .filter(|e| e.event == LogEvent::NodeRetrying)
            .count();
        assert_eq!(retrying, 0, "no retries after cancellation");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_first_attempt_when_budget_zero() {
        let (engine, registry) = test_engine(2, false, 10_000);
        registry.register_fn("slow", |_task, _params, _ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ValueMap::new())
        });

        let dag = DagBuilder::new("timeout")
            .add_task("a", "A", "slow")
            .timeout(Duration::from_secs(1))
            .max_retries(0)
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Failed);
        let dag = engine.get_dag(&dag_id).unwrap();
        let error = dag.node("a").unwrap().error.clone().unwrap();
        assert!(error.contains("exceeded"), "got: {error}");
    }

    #[tokio::test]
    async fn unknown_task_type_fails_node_terminally() {
        let (engine, _registry) = test_engine(2, false, 10_000);

        let dag = DagBuilder::new("ghost")
            .add_task("a", "A", "ghost_type")
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        let summary = engine.execute_dag(&dag_id).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Failed);
        let dag = engine.get_dag(&dag_id).unwrap();
        let error = dag.node("a").unwrap().error.clone().unwrap();
        assert!(error.contains("No handler registered"), "got: {error}");

        let retrying = engine
            .logs(Some(dag_id.as_str()), None, 100)
            .into_iter()
            .filter(|e| e.event == LogEvent::NodeRetrying)
            .count();
        assert_eq!(retrying, 0);
    }

    #[tokio::test]
    async fn cyclic_dag_is_rejected_at_registration() {
        let (engine, _registry) = test_engine(2, false, 10_000);
        let mut dag = crate::dag::Dag::new("cyclic");
        dag.add_node(crate::dag::DagNode::new("a", "A", "t")).unwrap();
        dag.add_edge("a", "a", "").unwrap();

        assert!(matches!(
            engine.register_dag(dag),
            Err(Error::CycleDetected(_))
        ));
    }

    #[tokio::test]
    async fn completed_dag_cannot_be_executed_again() {
        let (engine, registry) = test_engine(2, false, 10_000);
        registry.register_fn("ok", |_task, _params, _ctx| async { Ok(ValueMap::new()) });

        let dag = DagBuilder::new("once")
            .add_task("a", "A", "ok")
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        engine.execute_dag(&dag_id).await.unwrap();

        assert!(matches!(
            engine.execute_dag(&dag_id).await,
            Err(Error::InvalidState { .. })
        ));
        assert!(matches!(
            engine.cancel_dag(&dag_id),
            Err(Error::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn execution_log_is_bounded() {
        let (engine, registry) = test_engine(2, false, 5);
        registry.register_fn("ok", |_task, _params, _ctx| async { Ok(ValueMap::new()) });

        let dag = DagBuilder::new("bounded")
            .add_task("a", "A", "ok")
            .add_task("b", "B", "ok")
            .depends_on(["a"])
            .add_task("c", "C", "ok")
            .depends_on(["b"])
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();
        engine.execute_dag(&dag_id).await.unwrap();

        assert!(engine.logs(None, None, 100).len() <= 5);
    }

    #[tokio::test]
    async fn progress_reports_reach_node_and_callback() {
        let (engine, registry) = test_engine(2, false, 10_000);
        registry.register_fn("steps", |_task, _params, ctx| async move {
            ctx.progress.report(0.5, "halfway");
            ctx.progress.report(1.0, "done");
            Ok(ValueMap::new())
        });

        let dag = DagBuilder::new("progress")
            .add_task("a", "A", "steps")
            .build()
            .unwrap();
        let dag_id = engine.register_dag(dag).unwrap();

        let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
        let callback_seen = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |_dag, _node, fraction| {
            callback_seen.lock().push(fraction);
        });
        let summary = engine
            .execute_dag_with(&dag_id, ValueMap::new(), Some(callback))
            .await
            .unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        let fractions = seen.lock().clone();
        assert!(fractions.contains(&0.5));
        let dag = engine.get_dag(&dag_id).unwrap();
        assert_eq!(dag.node("a").unwrap().progress, 1.0);
    }
}
