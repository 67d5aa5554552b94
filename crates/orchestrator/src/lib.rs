#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Orchestration engine for FinFlow
//!
//! Combines the priority work queue, task manager, DAG engine, trigger
//! scheduler, and pipeline executor behind one explicitly constructed
//! [`CoreRuntime`] handle.

use finflow_common::config::Config;
use finflow_common::metrics::{DefaultMetricsCollector, MetricsCollector, NoopMetricsCollector};
use finflow_core::{BackoffPolicy, Clock, EventBus, HandlerRegistry, SystemClock, TaskStore};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub mod cron;
pub mod dag;
pub mod engine;
pub mod manager;
pub mod pipeline;
pub mod queue;
pub mod trigger;

pub use cron::CronSchedule;
pub use dag::{Dag, DagBuilder, DagEdge, DagNode, DagValidation, Position};
pub use engine::{
    DagEngine, DagEngineConfig, DagRunSummary, DagStatusSummary, ExecutionLogEntry, LogEvent,
    ProgressCallback,
};
pub use manager::{ManagerOverview, TaskManager, TaskManagerConfig};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineContext, PipelineExecutor, PipelineRunSummary,
};
pub use queue::{QueueStats, WorkQueue};
pub use trigger::{ConditionFn, Trigger, TriggerManager};

/// The explicit runtime handle: one instance owns every subsystem.
///
/// Constructed once at program start and passed into whatever embeds the
/// core; there are no global singletons.
pub struct CoreRuntime {
    config: Config,
    clock: Arc<dyn Clock>,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    metrics: Arc<dyn MetricsCollector>,
    task_manager: TaskManager,
    dag_engine: Arc<DagEngine>,
    trigger_manager: Arc<TriggerManager>,
    pipeline_executor: Arc<PipelineExecutor>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CoreRuntime {
    /// Build with the system clock and the configured metrics backend
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> CoreRuntimeBuilder {
        CoreRuntimeBuilder {
            config,
            clock: None,
            metrics: None,
            store: None,
        }
    }

    /// Start the dispatcher and trigger ticker loops
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        handles.push(self.task_manager.start());
        handles.push(self.trigger_manager.start());
    }

    /// Stop triggers, drain in-flight tasks, and cancel survivors
    pub async fn stop(&self) {
        self.trigger_manager.stop();
        self.task_manager.stop().await;
        self.handles.lock().clear();
    }

    /// Restore persisted tasks per the restart policy
    pub async fn recover(&self) -> finflow_common::Result<usize> {
        self.task_manager.recover().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics
    }

    pub fn tasks(&self) -> &TaskManager {
        &self.task_manager
    }

    pub fn dags(&self) -> &Arc<DagEngine> {
        &self.dag_engine
    }

    pub fn triggers(&self) -> &Arc<TriggerManager> {
        &self.trigger_manager
    }

    pub fn pipelines(&self) -> &Arc<PipelineExecutor> {
        &self.pipeline_executor
    }
}

/// Constructor injection for tests and embedders
pub struct CoreRuntimeBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
    store: Option<Arc<dyn TaskStore>>,
}

impl CoreRuntimeBuilder {
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> CoreRuntime {
        let config = self.config;
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let metrics = self.metrics.unwrap_or_else(|| {
            if config.observability.metrics_enabled {
                Arc::new(DefaultMetricsCollector) as Arc<dyn MetricsCollector>
            } else {
                Arc::new(NoopMetricsCollector) as Arc<dyn MetricsCollector>
            }
        });
        let registry = Arc::new(HandlerRegistry::new());
        let events = EventBus::default();

        let backoff = BackoffPolicy::new(
            Duration::from_millis(config.orchestrator.retry_base_ms),
            Duration::from_millis(config.orchestrator.retry_cap_ms),
        );

        let task_manager = TaskManager::new(
            TaskManagerConfig {
                max_concurrent: config.orchestrator.max_concurrent,
                default_timeout: config.orchestrator.default_timeout(),
                backoff,
                shutdown_deadline: config.orchestrator.shutdown_deadline(),
                cancel_grace: config.orchestrator.cancel_grace(),
                execution_history_capacity: 10_000,
            },
            Arc::clone(&registry),
            Arc::clone(&clock),
            events.clone(),
            Arc::clone(&metrics),
            self.store,
        );

        let engine_config = DagEngineConfig {
            max_concurrent_tasks: config.dag.max_concurrent_tasks,
            execution_log_capacity: config.dag.execution_log_capacity,
            strict_propagation: config.dag.strict_propagation,
            backoff,
        };
        let dag_engine = Arc::new(DagEngine::new(
            engine_config.clone(),
            Arc::clone(&registry),
            Arc::clone(&clock),
            events.clone(),
            Arc::clone(&metrics),
        ));

        let trigger_manager = Arc::new(TriggerManager::new(
            task_manager.clone(),
            Arc::clone(&clock),
            events.clone(),
            Arc::clone(&metrics),
            config.trigger.tick_interval(),
        ));

        let pipeline_executor = Arc::new(PipelineExecutor::new(
            engine_config,
            Arc::clone(&registry),
            Arc::clone(&clock),
            events.clone(),
            Arc::clone(&metrics),
        ));

        CoreRuntime {
            config,
            clock,
            registry,
            events,
            metrics,
            task_manager,
            dag_engine,
            trigger_manager,
            pipeline_executor,
            handles: Mutex::new(Vec::new()),
        }
    }
}
