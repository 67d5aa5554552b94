//! Stage-typed pipelines threading one data payload along edges

use crate::dag::{Dag, DagNode};
use crate::engine::{DagEngineConfig, ExecutionLogEntry, LogEvent};
use finflow_common::{
    metrics::MetricsCollector, DagId, Error, NodeId, Result, StageType, TaskStatus, ValueMap,
};
use finflow_core::{
    CancelToken, Clock, CoreEvent, EventBus, HandlerContext, HandlerRegistry, ProgressReporter,
    Task,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Predicate deciding whether a stage runs
pub type StageCondition = Arc<dyn Fn(&PipelineContext) -> bool + Send + Sync>;

/// Combines parallel fan-out outputs into one payload
pub type MergeFn = Arc<dyn Fn(Vec<Value>) -> Value + Send + Sync>;

/// Termination predicate for LOOP stages
pub type LoopPredicate = Arc<dyn Fn(&PipelineContext) -> bool + Send + Sync>;

/// Default iteration cap for LOOP stages
pub const DEFAULT_LOOP_CAP: u32 = 10;

/// The payload and named values visible to conditions and predicates
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// The single payload passed along edges
    pub data: Value,
    /// Per-stage outputs keyed by stage id
    pub values: ValueMap,
}

#[derive(Clone)]
struct StageInfo {
    stage_type: StageType,
    condition: Option<StageCondition>,
    merge: Option<MergeFn>,
    loop_until: Option<LoopPredicate>,
    max_iterations: u32,
}

impl Default for StageInfo {
    fn default() -> Self {
        Self {
            stage_type: StageType::Transform,
            condition: None,
            merge: None,
            loop_until: None,
            max_iterations: DEFAULT_LOOP_CAP,
        }
    }
}

/// A DAG whose nodes are typed stages
pub struct Pipeline {
    pub dag: Dag,
    stages: HashMap<NodeId, StageInfo>,
}

impl Pipeline {
    pub fn stage_type(&self, node_id: &str) -> Option<StageType> {
        self.stages.get(node_id).map(|s| s.stage_type)
    }

    /// Structural validation beyond the underlying DAG rules
    pub fn validate(&self) -> Result<()> {
        self.dag.ensure_valid()?;
        for node in self.dag.nodes() {
            let Some(stage) = self.stages.get(&node.id) else {
                continue;
            };
            match stage.stage_type {
                StageType::Source if !node.dependencies.is_empty() => {
                    return Err(Error::Validation(format!(
                        "source stage {} must have no dependencies",
                        node.id
                    )));
                }
                StageType::Branch => {
                    let labelled = self
                        .dag
                        .edges()
                        .iter()
                        .filter(|e| e.source == node.id)
                        .all(|e| !e.label.is_empty());
                    if !labelled {
                        return Err(Error::Validation(format!(
                            "branch stage {} requires labelled outgoing edges",
                            node.id
                        )));
                    }
                }
                StageType::Merge if node.dependencies.is_empty() => {
                    return Err(Error::Validation(format!(
                        "merge stage {} requires at least one dependency",
                        node.id
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Fluent builder for pipelines
pub struct PipelineBuilder {
    name: String,
    description: String,
    nodes: Vec<DagNode>,
    stages: Vec<StageInfo>,
    labelled_deps: Vec<(NodeId, NodeId, String)>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            nodes: Vec::new(),
            stages: Vec::new(),
            labelled_deps: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Add a stage; subsequent modifiers apply to it
    pub fn stage(
        mut self,
        stage_type: StageType,
        id: impl Into<NodeId>,
        task_type: impl Into<String>,
    ) -> Self {
        let id = id.into();
        self.nodes.push(DagNode::new(id.clone(), id, task_type));
        self.stages.push(StageInfo {
            stage_type,
            ..StageInfo::default()
        });
        self
    }

    pub fn source(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Source, id, task_type)
    }

    pub fn transform(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Transform, id, task_type)
    }

    pub fn validate_stage(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Validate, id, task_type)
    }

    pub fn filter(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Filter, id, task_type)
    }

    pub fn aggregate(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Aggregate, id, task_type)
    }

    pub fn sink(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Sink, id, task_type)
    }

    pub fn branch(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Branch, id, task_type)
    }

    pub fn merge(self, id: impl Into<NodeId>) -> Self {
        // Merge stages collect upstream outputs; no handler required.
        self.stage(StageType::Merge, id, "")
    }

    pub fn parallel(self, id: impl Into<NodeId>) -> Self {
        self.stage(StageType::Parallel, id, "")
    }

    pub fn loop_stage(self, id: impl Into<NodeId>, task_type: impl Into<String>) -> Self {
        self.stage(StageType::Loop, id, task_type)
    }

    pub fn params(mut self, params: ValueMap) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.params = params;
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.timeout = timeout;
        }
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.max_retries = max_retries;
        }
        self
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        if let Some(node) = self.nodes.last_mut() {
            node.dependencies
                .extend(dependencies.into_iter().map(Into::into));
        }
        self
    }

    /// Depend on a BRANCH stage; scheduled only when it picks `label`
    pub fn depends_on_branch(
        mut self,
        source: impl Into<NodeId>,
        label: impl Into<String>,
    ) -> Self {
        if let Some(node) = self.nodes.last() {
            self.labelled_deps
                .push((source.into(), node.id.clone(), label.into()));
        }
        self
    }

    /// Guard the current stage with a context predicate
    pub fn when(mut self, condition: StageCondition) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.condition = Some(condition);
        }
        self
    }

    /// Combine PARALLEL outputs with a custom function
    pub fn merge_with(mut self, merge: MergeFn) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.merge = Some(merge);
        }
        self
    }

    /// Re-run a LOOP stage until the predicate holds or the cap is reached
    pub fn until(mut self, predicate: LoopPredicate, max_iterations: u32) -> Self {
        if let Some(stage) = self.stages.last_mut() {
            stage.loop_until = Some(predicate);
            stage.max_iterations = max_iterations;
        }
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let mut dag = Dag::new(self.name).with_description(self.description);
        let mut stages = HashMap::new();
        for (node, stage) in self.nodes.into_iter().zip(self.stages) {
            stages.insert(node.id.clone(), stage);
            dag.add_node(node)?;
        }
        for (source, target, label) in self.labelled_deps {
            dag.add_edge(source, target, label)?;
        }
        let pipeline = Pipeline { dag, stages };
        pipeline.validate()?;
        Ok(pipeline)
    }
}

/// Result of one pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineRunSummary {
    pub pipeline_id: DagId,
    pub status: TaskStatus,
    pub stages_succeeded: usize,
    pub stages_failed: usize,
    pub stages_skipped: usize,
    pub duration_ms: u64,
    /// Final payload after the last completed stage
    pub data: Value,
    pub errors: Vec<String>,
}

/// Executes stage-typed pipelines.
///
/// Stages serialize on the shared payload; PARALLEL is the explicit
/// fan-out. Retry, timeout, and cancellation follow the DAG engine.
pub struct PipelineExecutor {
    config: DagEngineConfig,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,
    runs: Mutex<HashMap<DagId, CancelToken>>,
    logs: Mutex<VecDeque<ExecutionLogEntry>>,
}

impl PipelineExecutor {
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
            runs: Mutex::new(HashMap::new()),
            logs: Mutex::new(VecDeque::new()),
        }
    }

    /// Cancel a running pipeline
    pub fn cancel_pipeline(&self, pipeline_id: &str) -> Result<()> {
        self.runs
            .lock()
            .get(pipeline_id)
            .map(CancelToken::cancel)
            .ok_or_else(|| Error::Internal(format!("pipeline not running: {pipeline_id}")))
    }

    pub fn logs(&self, pipeline_id: Option<&str>, limit: usize) -> Vec<ExecutionLogEntry> {
        let logs = self.logs.lock();
        let matched: Vec<ExecutionLogEntry> = logs
            .iter()
            .filter(|entry| pipeline_id.map_or(true, |p| entry.dag_id == p))
            .cloned()
            .collect();
        let start = matched.len().saturating_sub(limit);
        matched[start..].to_vec()
    }

    fn log(
        &self,
        pipeline_id: &str,
        node_id: Option<&str>,
        event: LogEvent,
        status: TaskStatus,
        message: Option<String>,
    ) {
        if !matches!(
            event,
            LogEvent::DagStarted | LogEvent::DagCompleted | LogEvent::DagFailed | LogEvent::DagCancelled
        ) {
            self.metrics.record_node_event(event.as_str());
        }
        let mut logs = self.logs.lock();
        logs.push_back(ExecutionLogEntry {
            log_id: Uuid::new_v4(),
            dag_id: pipeline_id.to_string(),
            node_id: node_id.map(ToOwned::to_owned),
            event,
            status,
            message,
            timestamp: self.clock.now_utc(),
            duration_ms: None,
        });
        while logs.len() > self.config.execution_log_capacity {
            logs.pop_front();
        }
    }

    /// Run the pipeline to completion, threading `initial` through its stages
    #[instrument(skip(self, pipeline, initial))]
    pub async fn execute(
        &self,
        pipeline: &mut Pipeline,
        initial: Value,
    ) -> Result<PipelineRunSummary> {
        pipeline.validate()?;
        let pipeline_id = pipeline.dag.id.clone();
        if pipeline.dag.status != TaskStatus::Pending {
            return Err(Error::InvalidState {
                operation: "execute".to_string(),
                status: pipeline.dag.status.as_str().to_string(),
            });
        }

        let run_started = self.clock.now();
        pipeline.dag.status = TaskStatus::Running;
        pipeline.dag.started_at = Some(self.clock.now_utc());
        let token = CancelToken::new();
        self.runs.lock().insert(pipeline_id.clone(), token.clone());
        self.log(&pipeline_id, None, LogEvent::DagStarted, TaskStatus::Running, None);
        self.events.publish(CoreEvent::DagStateChanged {
            dag_id: pipeline_id.clone(),
            status: TaskStatus::Running,
        });

        let mut context = PipelineContext {
            data: initial,
            values: pipeline.dag.context.clone(),
        };
        let mut outputs: HashMap<NodeId, Value> = HashMap::new();
        let mut cancelled = false;

        loop {
            if token.is_cancelled() {
                cancelled = true;
                break;
            }
            // SKIPPED upstreams satisfy readiness so rejoin points after a
            // branch still run.
            let ready = pipeline.dag.ready_nodes(true);
            let Some(node_id) = ready.into_iter().next() else {
                break;
            };

            match self
                .run_stage(pipeline, &node_id, &mut context, &mut outputs, &token)
                .await
            {
                Ok(()) => {}
                Err(Error::Cancelled) => {
                    cancelled = true;
                    break;
                }
                Err(_) => {
                    // Stage settled FAILED; non-strict propagation leaves its
                    // dependents pending, so the ready set drains naturally.
                    if self.config.strict_propagation {
                        self.skip_descendants(pipeline, &node_id);
                    }
                }
            }
        }

        if cancelled {
            self.skip_pending(pipeline, "pipeline cancelled");
        }
        self.runs.lock().remove(&pipeline_id);
        Ok(self.finalize(pipeline, cancelled, run_started, context.data))
    }

    /// Execute a single ready stage, including retries
    async fn run_stage(
        &self,
        pipeline: &mut Pipeline,
        node_id: &NodeId,
        context: &mut PipelineContext,
        outputs: &mut HashMap<NodeId, Value>,
        token: &CancelToken,
    ) -> Result<()> {
        let pipeline_id = pipeline.dag.id.clone();
        let stage = pipeline.stages.get(node_id).cloned().unwrap_or_default();
        let input = self.stage_input(pipeline, node_id, &stage, context, outputs);

        // A false condition skips the stage; data passes through untouched.
        if let Some(condition) = &stage.condition {
            if !condition(context) {
                if let Some(node) = pipeline.dag.node_mut(node_id) {
                    node.status = TaskStatus::Skipped;
                    node.completed_at = Some(self.clock.now_utc());
                }
                outputs.insert(node_id.clone(), input);
                self.log(
                    &pipeline_id,
                    Some(node_id),
                    LogEvent::NodeSkipped,
                    TaskStatus::Skipped,
                    Some("condition not met".to_string()),
                );
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: pipeline_id,
                    node_id: node_id.clone(),
                    status: TaskStatus::Skipped,
                });
                return Ok(());
            }
        }

        {
            let node = pipeline
                .dag
                .node_mut(node_id)
                .ok_or_else(|| Error::Internal(format!("stage vanished: {node_id}")))?;
            node.status = TaskStatus::Running;
            node.started_at = Some(self.clock.now_utc());
        }
        self.log(
            &pipeline_id,
            Some(node_id),
            LogEvent::NodeStarted,
            TaskStatus::Running,
            None,
        );
        self.events.publish(CoreEvent::NodeStateChanged {
            dag_id: pipeline_id.clone(),
            node_id: node_id.clone(),
            status: TaskStatus::Running,
        });

        let outcome = loop {
            let attempt_result = self
                .invoke_stage(pipeline, node_id, &stage, input.clone(), context, token)
                .await;
            match attempt_result {
                Ok(output) => break Ok(output),
                Err(Error::Cancelled) => break Err(Error::Cancelled),
                Err(e) => {
                    let retry = {
                        let node = pipeline.dag.node_mut(node_id);
                        node.map_or(false, |node| {
                            if e.is_retryable() && node.retry_count < node.max_retries {
                                node.retry_count += 1;
                                true
                            } else {
                                false
                            }
                        })
                    };
                    if !retry {
                        break Err(e);
                    }
                    let attempt = pipeline
                        .dag
                        .node(node_id)
                        .map_or(0, |n| n.retry_count);
                    warn!(pipeline_id = %pipeline_id, node_id = %node_id, attempt, error = %e,
                        "stage failed, retrying");
                    self.log(
                        &pipeline_id,
                        Some(node_id),
                        LogEvent::NodeRetrying,
                        TaskStatus::Running,
                        Some(format!("attempt {attempt}: {e}")),
                    );
                    let delay = self.config.backoff.delay(attempt.saturating_sub(1));
                    tokio::select! {
                        _ = self.clock.sleep(delay) => {}
                        _ = token.cancelled() => break Err(Error::Cancelled),
                    }
                }
            }
        };

        let now = self.clock.now_utc();
        match outcome {
            Ok(output) => {
                if stage.stage_type == StageType::Branch {
                    self.apply_branch_choice(pipeline, node_id, &output);
                }
                // A branch routes; the payload passes through unchanged.
                let output = if stage.stage_type == StageType::Branch {
                    input
                } else {
                    output
                };
                if let Some(node) = pipeline.dag.node_mut(node_id) {
                    node.status = TaskStatus::Completed;
                    node.completed_at = Some(now);
                    node.progress = 1.0;
                }
                context.data = output.clone();
                context.values.insert(node_id.clone(), output.clone());
                pipeline
                    .dag
                    .context
                    .insert(node_id.clone(), output.clone());
                outputs.insert(node_id.clone(), output);
                self.log(
                    &pipeline.dag.id.clone(),
                    Some(node_id),
                    LogEvent::NodeCompleted,
                    TaskStatus::Completed,
                    None,
                );
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: pipeline.dag.id.clone(),
                    node_id: node_id.clone(),
                    status: TaskStatus::Completed,
                });
                Ok(())
            }
            Err(Error::Cancelled) => {
                if let Some(node) = pipeline.dag.node_mut(node_id) {
                    node.status = TaskStatus::Cancelled;
                    node.completed_at = Some(now);
                }
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: pipeline.dag.id.clone(),
                    node_id: node_id.clone(),
                    status: TaskStatus::Cancelled,
                });
                Err(Error::Cancelled)
            }
            Err(e) => {
                if let Some(node) = pipeline.dag.node_mut(node_id) {
                    node.status = TaskStatus::Failed;
                    node.completed_at = Some(now);
                    node.error = Some(e.to_string());
                }
                self.log(
                    &pipeline.dag.id.clone(),
                    Some(node_id),
                    LogEvent::NodeFailed,
                    TaskStatus::Failed,
                    Some(e.to_string()),
                );
                self.events.publish(CoreEvent::NodeStateChanged {
                    dag_id: pipeline.dag.id.clone(),
                    node_id: node_id.clone(),
                    status: TaskStatus::Failed,
                });
                Err(e)
            }
        }
    }

    /// Compute the input payload for a stage from its dependencies
    fn stage_input(
        &self,
        pipeline: &Pipeline,
        node_id: &NodeId,
        stage: &StageInfo,
        context: &PipelineContext,
        outputs: &HashMap<NodeId, Value>,
    ) -> Value {
        if stage.stage_type == StageType::Source {
            return Value::Null;
        }

        let Some(node) = pipeline.dag.node(node_id) else {
            return Value::Null;
        };
        // Completed dependencies in edge order; skipped branches contribute
        // nothing to a fan-in.
        let upstream: Vec<Value> = pipeline
            .dag
            .edges()
            .iter()
            .filter(|e| &e.target == node_id)
            .filter(|e| {
                pipeline
                    .dag
                    .node(&e.source)
                    .map_or(false, |n| n.status == TaskStatus::Completed)
            })
            .filter_map(|e| outputs.get(&e.source).cloned())
            .collect();

        match (node.dependencies.len(), upstream.len()) {
            (0, _) => context.data.clone(),
            (_, 0) => context.data.clone(),
            (_, 1) if stage.stage_type != StageType::Merge => {
                upstream.into_iter().next().unwrap_or(Value::Null)
            }
            _ => Value::Array(upstream),
        }
    }

    /// Invoke the stage handler once, honoring its timeout and the token
    async fn invoke_stage(
        &self,
        pipeline: &Pipeline,
        node_id: &NodeId,
        stage: &StageInfo,
        input: Value,
        context: &PipelineContext,
        token: &CancelToken,
    ) -> Result<Value> {
        let node = pipeline
            .dag
            .node(node_id)
            .ok_or_else(|| Error::Internal(format!("stage vanished: {node_id}")))?;

        match stage.stage_type {
            StageType::Merge if node.task_type.as_deref().unwrap_or("").is_empty() => {
                // Pure fan-in: the collected upstream list is the output.
                Ok(input)
            }
            StageType::Parallel => {
                self.invoke_parallel(node, stage, input, context, token).await
            }
            StageType::Loop => {
                let mut current = input;
                let mut iterations = 0u32;
                loop {
                    current = self
                        .invoke_handler(node, node.task_type.as_deref(), current, context, token)
                        .await?;
                    iterations += 1;
                    let probe = PipelineContext {
                        data: current.clone(),
                        values: context.values.clone(),
                    };
                    let done = stage
                        .loop_until
                        .as_ref()
                        .map_or(true, |predicate| predicate(&probe));
                    if done || iterations >= stage.max_iterations {
                        break;
                    }
                }
                Ok(current)
            }
            _ => {
                self.invoke_handler(node, node.task_type.as_deref(), input, context, token)
                    .await
            }
        }
    }

    /// Fork into the sub-tasks declared in `params.tasks`, merge the outputs
    async fn invoke_parallel(
        &self,
        node: &DagNode,
        stage: &StageInfo,
        input: Value,
        context: &PipelineContext,
        token: &CancelToken,
    ) -> Result<Value> {
        let specs: Vec<(String, ValueMap)> = node
            .params
            .get("tasks")
            .and_then(Value::as_array)
            .map(|tasks| {
                tasks
                    .iter()
                    .filter_map(|spec| {
                        let task_type = spec.get("task_type")?.as_str()?.to_string();
                        let params = spec
                            .get("params")
                            .and_then(Value::as_object)
                            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                            .unwrap_or_default();
                        Some((task_type, params))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if specs.is_empty() {
            return Err(Error::Validation(format!(
                "parallel stage {} declares no tasks",
                node.id
            )));
        }

        let attempts: Vec<_> = specs
            .iter()
            .map(|(task_type, params)| {
                let mut sub_node = node.clone();
                sub_node.params = params.clone();
                let input = input.clone();
                async move {
                    self.invoke_handler(&sub_node, Some(task_type.as_str()), input, context, token)
                        .await
                }
            })
            .collect();

        let results = futures::future::join_all(attempts).await;
        let mut combined = Vec::with_capacity(results.len());
        for result in results {
            combined.push(result?);
        }

        Ok(match &stage.merge {
            Some(merge) => merge(combined),
            None => Value::Array(combined),
        })
    }

    async fn invoke_handler(
        &self,
        node: &DagNode,
        task_type: Option<&str>,
        input: Value,
        context: &PipelineContext,
        token: &CancelToken,
    ) -> Result<Value> {
        let task_type = task_type.unwrap_or_default();
        let handler = self.registry.resolve(task_type)?;

        let mut params = node.params.clone();
        params.insert("data".to_string(), input);
        params.insert(
            "context".to_string(),
            Value::Object(
                context
                    .values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            ),
        );

        let task = Task::new(node.name.clone(), task_type);
        let node_token = token.child();
        let ctx = HandlerContext::new(ProgressReporter::null(task.id), node_token.clone());

        let result = tokio::select! {
            res = tokio::time::timeout(node.timeout, handler.execute(&task, &params, ctx)) => {
                match res {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "stage {} exceeded {:?}", node.id, node.timeout
                    ))),
                }
            }
            _ = node_token.cancelled() => Err(Error::Cancelled),
        };

        result.map(|mut map| match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map.into_iter().collect()),
        })
    }

    /// Skip the dependents a BRANCH stage did not choose
    fn apply_branch_choice(&self, pipeline: &mut Pipeline, node_id: &NodeId, output: &Value) {
        let chosen = output
            .get("branch")
            .and_then(Value::as_str)
            .or_else(|| output.as_str())
            .unwrap_or_default()
            .to_string();

        let not_chosen: Vec<NodeId> = pipeline
            .dag
            .edges()
            .iter()
            .filter(|e| &e.source == node_id && e.label != chosen)
            .map(|e| e.target.clone())
            .collect();

        let now = self.clock.now_utc();
        for target in not_chosen {
            if let Some(node) = pipeline.dag.node_mut(&target) {
                if node.status == TaskStatus::Pending {
                    node.status = TaskStatus::Skipped;
                    node.completed_at = Some(now);
                    self.log(
                        &pipeline.dag.id.clone(),
                        Some(&target),
                        LogEvent::NodeSkipped,
                        TaskStatus::Skipped,
                        Some(format!("branch chose {chosen}")),
                    );
                    self.events.publish(CoreEvent::NodeStateChanged {
                        dag_id: pipeline.dag.id.clone(),
                        node_id: target.clone(),
                        status: TaskStatus::Skipped,
                    });
                }
            }
        }

        // A node whose dependencies were all skipped is unreachable.
        loop {
            let unreachable: Vec<NodeId> = pipeline
                .dag
                .nodes()
                .filter(|n| n.status == TaskStatus::Pending && !n.dependencies.is_empty())
                .filter(|n| {
                    n.dependencies.iter().all(|dep| {
                        pipeline
                            .dag
                            .node(dep)
                            .map_or(false, |d| d.status == TaskStatus::Skipped)
                    })
                })
                .map(|n| n.id.clone())
                .collect();
            if unreachable.is_empty() {
                break;
            }
            for target in unreachable {
                if let Some(node) = pipeline.dag.node_mut(&target) {
                    node.status = TaskStatus::Skipped;
                    node.completed_at = Some(now);
                }
            }
        }
    }

    fn skip_descendants(&self, pipeline: &mut Pipeline, node_id: &NodeId) {
        let now = self.clock.now_utc();
        let descendants = pipeline.dag.descendants(node_id);
        for descendant in descendants {
            if let Some(node) = pipeline.dag.node_mut(&descendant) {
                if node.status == TaskStatus::Pending {
                    node.status = TaskStatus::Skipped;
                    node.completed_at = Some(now);
                    node.error = Some(format!("dependency {node_id} failed"));
                }
            }
        }
    }

    fn skip_pending(&self, pipeline: &mut Pipeline, reason: &str) {
        let now = self.clock.now_utc();
        let pending: Vec<NodeId> = pipeline
            .dag
            .nodes()
            .filter(|n| n.status == TaskStatus::Pending)
            .map(|n| n.id.clone())
            .collect();
        for node_id in pending {
            if let Some(node) = pipeline.dag.node_mut(&node_id) {
                node.status = TaskStatus::Skipped;
                node.completed_at = Some(now);
            }
            self.log(
                &pipeline.dag.id.clone(),
                Some(&node_id),
                LogEvent::NodeSkipped,
                TaskStatus::Skipped,
                Some(reason.to_string()),
            );
        }
    }

    fn finalize(
        &self,
        pipeline: &mut Pipeline,
        cancelled: bool,
        run_started: tokio::time::Instant,
        data: Value,
    ) -> PipelineRunSummary {
        let now = self.clock.now_utc();
        let mut succeeded = 0;
        let mut failed = 0;
        let mut skipped = 0;
        let mut errors = Vec::new();
        for node in pipeline.dag.nodes() {
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
        pipeline.dag.status = status;
        pipeline.dag.completed_at = Some(now);

        let event = match status {
            TaskStatus::Cancelled => LogEvent::DagCancelled,
            TaskStatus::Failed => LogEvent::DagFailed,
            _ => LogEvent::DagCompleted,
        };
        self.log(&pipeline.dag.id.clone(), None, event, status, None);
        self.events.publish(CoreEvent::DagStateChanged {
            dag_id: pipeline.dag.id.clone(),
            status,
        });

        PipelineRunSummary {
            pipeline_id: pipeline.dag.id.clone(),
            status,
            stages_succeeded: succeeded,
            stages_failed: failed,
            stages_skipped: skipped,
            duration_ms: (self.clock.now() - run_started).as_millis() as u64,
            data,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_common::metrics::NoopMetricsCollector;
    use finflow_core::SystemClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn executor(strict: bool) -> (Arc<PipelineExecutor>, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        let executor = Arc::new(PipelineExecutor::new(
            DagEngineConfig {
                strict_propagation: strict,
                ..DagEngineConfig::default()
            },
            Arc::clone(&registry),
            Arc::new(SystemClock),
            EventBus::default(),
            Arc::new(NoopMetricsCollector),
        ));
        (executor, registry)
    }

    fn data_out(value: Value) -> Result<ValueMap> {
        let mut out = ValueMap::new();
        out.insert("data".to_string(), value);
        Ok(out)
    }

    #[tokio::test]
    async fn linear_pipeline_threads_payload() {
        let (executor, registry) = executor(false);
        registry.register_fn("load", |_t, _p, _c| async { data_out(json!([1, 2, 3])) });
        registry.register_fn("double", |_t, params, _c| async move {
            let doubled: Vec<i64> = params
                .get("data")
                .and_then(Value::as_array)
                .map(|xs| xs.iter().filter_map(Value::as_i64).map(|x| x * 2).collect())
                .unwrap_or_default();
            data_out(json!(doubled))
        });
        let sunk = Arc::new(Mutex::new(Value::Null));
        let sink_cell = Arc::clone(&sunk);
        registry.register_fn("store", move |_t, params, _c| {
            let cell = Arc::clone(&sink_cell);
            async move {
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                *cell.lock() = data.clone();
                data_out(data)
            }
        });

        let mut pipeline = PipelineBuilder::new("quotes")
            .source("load", "load")
            .transform("double", "double")
            .depends_on(["load"])
            .sink("store", "store")
            .depends_on(["double"])
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.stages_succeeded, 3);
        assert_eq!(summary.data, json!([2, 4, 6]));
        assert_eq!(*sunk.lock(), json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn false_condition_skips_stage_and_passes_data_through() {
        let (executor, registry) = executor(false);
        registry.register_fn("load", |_t, _p, _c| async { data_out(json!(42)) });
        registry.register_fn("drop_all", |_t, _p, _c| async { data_out(json!(null)) });
        registry.register_fn("keep", |_t, params, _c| async move {
            data_out(params.get("data").cloned().unwrap_or(Value::Null))
        });

        let mut pipeline = PipelineBuilder::new("conditional")
            .source("load", "load")
            .filter("maybe_drop", "drop_all")
            .depends_on(["load"])
            .when(Arc::new(|_ctx| false))
            .sink("keep", "keep")
            .depends_on(["maybe_drop"])
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(
            pipeline.dag.node("maybe_drop").unwrap().status,
            TaskStatus::Skipped
        );
        // The sink still ran, on the untouched payload.
        assert_eq!(summary.data, json!(42));
    }

    #[tokio::test]
    async fn branch_schedules_only_the_chosen_path() {
        let (executor, registry) = executor(false);
        registry.register_fn("load", |_t, _p, _c| async { data_out(json!(100)) });
        registry.register_fn("route", |_t, _p, _c| async {
            let mut out = ValueMap::new();
            out.insert("branch".to_string(), json!("hot"));
            Ok(out)
        });
        registry.register_fn("tag_hot", |_t, params, _c| async move {
            data_out(json!({ "path": "hot", "value": params.get("data").cloned() }))
        });
        registry.register_fn("tag_cold", |_t, params, _c| async move {
            data_out(json!({ "path": "cold", "value": params.get("data").cloned() }))
        });

        let mut pipeline = PipelineBuilder::new("routed")
            .source("load", "load")
            .branch("route", "route")
            .depends_on(["load"])
            .transform("hot_path", "tag_hot")
            .depends_on_branch("route", "hot")
            .transform("cold_path", "tag_cold")
            .depends_on_branch("route", "cold")
            .merge("join")
            .depends_on(["hot_path", "cold_path"])
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(
            pipeline.dag.node("hot_path").unwrap().status,
            TaskStatus::Completed
        );
        assert_eq!(
            pipeline.dag.node("cold_path").unwrap().status,
            TaskStatus::Skipped
        );
        // The merge collects only the surviving branch output.
        assert_eq!(summary.data, json!([{ "path": "hot", "value": 100 }]));
    }

    #[tokio::test]
    async fn parallel_stage_merges_with_custom_function() {
        let (executor, registry) = executor(false);
        registry.register_fn("load", |_t, _p, _c| async { data_out(json!(10)) });
        registry.register_fn("add_one", |_t, params, _c| async move {
            let x = params.get("data").and_then(Value::as_i64).unwrap_or(0);
            data_out(json!(x + 1))
        });
        registry.register_fn("add_two", |_t, params, _c| async move {
            let x = params.get("data").and_then(Value::as_i64).unwrap_or(0);
            data_out(json!(x + 2))
        });

        let mut params = ValueMap::new();
        params.insert(
            "tasks".to_string(),
            json!([
                { "task_type": "add_one" },
                { "task_type": "add_two" },
            ]),
        );

        let mut pipeline = PipelineBuilder::new("fanout")
            .source("load", "load")
            .parallel("fan")
            .params(params)
            .depends_on(["load"])
            .merge_with(Arc::new(|outputs| {
                let sum: i64 = outputs.iter().filter_map(Value::as_i64).sum();
                json!(sum)
            }))
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        // (10 + 1) + (10 + 2)
        assert_eq!(summary.data, json!(23));
    }

    #[tokio::test]
    async fn loop_stage_runs_until_predicate_holds() {
        let (executor, registry) = executor(false);
        registry.register_fn("seed", |_t, _p, _c| async { data_out(json!(0)) });
        registry.register_fn("increment", |_t, params, _c| async move {
            let x = params.get("data").and_then(Value::as_i64).unwrap_or(0);
            data_out(json!(x + 1))
        });

        let mut pipeline = PipelineBuilder::new("looped")
            .source("seed", "seed")
            .loop_stage("count_up", "increment")
            .depends_on(["seed"])
            .until(
                Arc::new(|ctx| ctx.data.as_i64().unwrap_or(0) >= 3),
                DEFAULT_LOOP_CAP,
            )
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(summary.data, json!(3));
    }

    #[tokio::test]
    async fn loop_stage_respects_iteration_cap() {
        let (executor, registry) = executor(false);
        let calls = Arc::new(AtomicU32::new(0));
        let handler_calls = Arc::clone(&calls);
        registry.register_fn("spin", move |_t, _p, _c| {
            let calls = Arc::clone(&handler_calls);
            async move {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                data_out(json!("again"))
            }
        });

        let mut pipeline = PipelineBuilder::new("capped")
            .loop_stage("spin", "spin")
            .until(Arc::new(|_ctx| false), 5)
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_retries_with_backoff() {
        let (executor, registry) = executor(false);
        let calls = Arc::new(AtomicU32::new(0));
        let handler_calls = Arc::clone(&calls);
        registry.register_fn("flaky", move |_t, _p, _c| {
            let calls = Arc::clone(&handler_calls);
            async move {
                if calls.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                    Err(Error::Handler("transient".to_string()))
                } else {
                    data_out(json!("ok"))
                }
            }
        });

        let mut pipeline = PipelineBuilder::new("retrying")
            .source("flaky", "flaky")
            .max_retries(1)
            .build()
            .unwrap();

        let started = tokio::time::Instant::now();
        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Completed);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn failed_stage_fails_pipeline_nonstrict() {
        let (executor, registry) = executor(false);
        registry.register_fn("broken", |_t, _p, _c| async {
            Err(Error::Handler("boom".to_string()))
        });
        registry.register_fn("after", |_t, _p, _c| async { data_out(json!(1)) });

        let mut pipeline = PipelineBuilder::new("failing")
            .source("broken", "broken")
            .max_retries(0)
            .sink("after", "after")
            .depends_on(["broken"])
            .build()
            .unwrap();

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();
        assert_eq!(summary.status, TaskStatus::Failed);
        assert_eq!(summary.stages_failed, 1);
        assert_eq!(
            pipeline.dag.node("after").unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn source_with_dependencies_is_rejected() {
        let result = PipelineBuilder::new("bad")
            .transform("first", "x")
            .source("late_source", "x")
            .depends_on(["first"])
            .build();
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_skips_remaining_stages() {
        let (executor, registry) = executor(false);
        registry.register_fn("long", |_t, _p, ctx| async move {
            loop {
                ctx.checkpoint()?;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        registry.register_fn("after", |_t, _p, _c| async { data_out(json!(1)) });

        let mut pipeline = PipelineBuilder::new("cancellable")
            .source("long", "long")
            .sink("after", "after")
            .depends_on(["long"])
            .build()
            .unwrap();
        let pipeline_id = pipeline.dag.id.clone();

        let canceller = Arc::clone(&executor);
        let cancel_id = pipeline_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = canceller.cancel_pipeline(&cancel_id);
        });

        let summary = executor.execute(&mut pipeline, Value::Null).await.unwrap();

        assert_eq!(summary.status, TaskStatus::Cancelled);
        assert_eq!(
            pipeline.dag.node("long").unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            pipeline.dag.node("after").unwrap().status,
            TaskStatus::Skipped
        );
    }
}
