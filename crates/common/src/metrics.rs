//! Metrics collection and reporting

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, Registry,
};

/// Global metrics registry
pub static METRICS_REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Terminal task counter
pub static TASKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finflow_tasks_total",
        "Tasks reaching a terminal state",
        &["status", "priority"]
    )
    .unwrap()
});

/// Task run duration histogram
pub static TASK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "finflow_task_duration_seconds",
        "Task run duration in seconds",
        &["task_type"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
    )
    .unwrap()
});

/// Queue depth by priority
pub static QUEUE_DEPTH: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "finflow_queue_depth",
        "Queued tasks by priority",
        &["priority"]
    )
    .unwrap()
});

/// In-flight tasks by component
pub static RUNNING_TASKS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "finflow_running_tasks",
        "In-flight tasks",
        &["component"]
    )
    .unwrap()
});

/// Retry counter
pub static RETRIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finflow_retries_total",
        "Retry attempts",
        &["task_type"]
    )
    .unwrap()
});

/// Trigger fire counter
pub static TRIGGER_FIRES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finflow_trigger_fires_total",
        "Trigger fires",
        &["trigger_type"]
    )
    .unwrap()
});

/// DAG node lifecycle event counter
pub static NODE_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finflow_dag_node_events_total",
        "DAG node lifecycle events",
        &["event"]
    )
    .unwrap()
});

/// Error counter
pub static ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "finflow_errors_total",
        "Errors by kind",
        &["kind", "severity"]
    )
    .unwrap()
});

/// Initialize all metrics
pub fn init_metrics() -> Result<()> {
    let collectors: [Box<dyn prometheus::core::Collector>; 8] = [
        Box::new(TASKS_TOTAL.clone()),
        Box::new(TASK_DURATION.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(RUNNING_TASKS.clone()),
        Box::new(RETRIES_TOTAL.clone()),
        Box::new(TRIGGER_FIRES_TOTAL.clone()),
        Box::new(NODE_EVENTS_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];
    for collector in collectors {
        METRICS_REGISTRY
            .register(collector)
            .map_err(|e| Error::Internal(format!("metrics registration failed: {e}")))?;
    }
    Ok(())
}

/// Metrics collector trait
pub trait MetricsCollector: Send + Sync {
    /// Record a terminal task outcome
    fn record_task(&self, status: &str, priority: &str, task_type: &str, duration_secs: f64);

    /// Record a retry attempt
    fn record_retry(&self, task_type: &str);

    /// Record a trigger fire
    fn record_trigger_fire(&self, trigger_type: &str);

    /// Record a DAG node lifecycle event
    fn record_node_event(&self, event: &str);

    /// Record an error
    fn record_error(&self, kind: &str, severity: &str);

    /// Update queue depth for a priority level
    fn set_queue_depth(&self, priority: &str, depth: i64);

    /// Update the in-flight gauge for a component
    fn set_running(&self, component: &str, count: i64);
}

/// Default metrics collector implementation
#[derive(Clone, Default)]
pub struct DefaultMetricsCollector;

impl MetricsCollector for DefaultMetricsCollector {
    fn record_task(&self, status: &str, priority: &str, task_type: &str, duration_secs: f64) {
        TASKS_TOTAL.with_label_values(&[status, priority]).inc();
        TASK_DURATION
            .with_label_values(&[task_type])
            .observe(duration_secs);
    }

    fn record_retry(&self, task_type: &str) {
        RETRIES_TOTAL.with_label_values(&[task_type]).inc();
    }

    fn record_trigger_fire(&self, trigger_type: &str) {
        TRIGGER_FIRES_TOTAL
            .with_label_values(&[trigger_type])
            .inc();
    }

    fn record_node_event(&self, event: &str) {
        NODE_EVENTS_TOTAL.with_label_values(&[event]).inc();
    }

    fn record_error(&self, kind: &str, severity: &str) {
        ERRORS_TOTAL.with_label_values(&[kind, severity]).inc();
    }

    fn set_queue_depth(&self, priority: &str, depth: i64) {
        QUEUE_DEPTH
            .with_label_values(&[priority])
            .set(depth as f64);
    }

    fn set_running(&self, component: &str, count: i64) {
        RUNNING_TASKS
            .with_label_values(&[component])
            .set(count as f64);
    }
}

/// No-op collector for embedders that disable metrics
#[derive(Clone, Default)]
pub struct NoopMetricsCollector;

impl MetricsCollector for NoopMetricsCollector {
    fn record_task(&self, _: &str, _: &str, _: &str, _: f64) {}
    fn record_retry(&self, _: &str) {}
    fn record_trigger_fire(&self, _: &str) {}
    fn record_node_event(&self, _: &str) {}
    fn record_error(&self, _: &str, _: &str) {}
    fn set_queue_depth(&self, _: &str, _: i64) {}
    fn set_running(&self, _: &str, _: i64) {}
}
