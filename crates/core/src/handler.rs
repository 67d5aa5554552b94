//! Handler registry and the handler invocation contract

use crate::cancel::CancelToken;
use crate::task::Task;
use async_trait::async_trait;
use dashmap::DashMap;
use finflow_common::{Error, Result, TaskId, ValueMap};
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Receives progress reports from running handlers
pub trait ProgressSink: Send + Sync {
    fn report(&self, task_id: TaskId, fraction: f64, message: &str);
}

/// Sink that discards reports; useful in tests and fire-and-forget paths
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn report(&self, _: TaskId, _: f64, _: &str) {}
}

/// Handle a handler uses to report fractional progress
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: TaskId,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    pub fn new(task_id: TaskId, sink: Arc<dyn ProgressSink>) -> Self {
        Self { task_id, sink }
    }

    pub fn null(task_id: TaskId) -> Self {
        Self::new(task_id, Arc::new(NullProgressSink))
    }

    /// Report progress; `fraction` is clamped to [0, 1] downstream
    pub fn report(&self, fraction: f64, message: impl AsRef<str>) {
        self.sink.report(self.task_id, fraction, message.as_ref());
    }
}

/// Per-invocation context handed to a handler
#[derive(Clone)]
pub struct HandlerContext {
    pub progress: ProgressReporter,
    pub cancel: CancelToken,
}

impl HandlerContext {
    pub fn new(progress: ProgressReporter, cancel: CancelToken) -> Self {
        Self { progress, cancel }
    }

    /// Natural checkpoint: fails with `Cancelled` once the token fires
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A function registered under a `task_type`, invoked to execute a task
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task, params: &ValueMap, ctx: HandlerContext)
        -> Result<ValueMap>;
}

/// Adapter so plain async closures register as handlers
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, ValueMap, HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ValueMap>> + Send,
{
    async fn execute(
        &self,
        task: &Task,
        params: &ValueMap,
        ctx: HandlerContext,
    ) -> Result<ValueMap> {
        (self.0)(task.clone(), params.clone(), ctx).await
    }
}

/// Maps task-type keys to handlers.
///
/// Registration is idempotent: re-registering a key replaces the previous
/// handler and logs a warning.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        if self.handlers.insert(task_type.clone(), handler).is_some() {
            warn!(task_type = %task_type, "replacing existing handler registration");
        }
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(Task, ValueMap, HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ValueMap>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler::new(f)));
    }

    /// Look up the handler for a task type
    pub fn resolve(&self, task_type: &str) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(task_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::UnknownTaskType(task_type.to_string()))
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
