//! Typed lifecycle event stream for observers

use finflow_common::{DagId, NodeId, TaskId, TaskStatus, TriggerId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Lifecycle events observable by embedders
#[derive(Debug, Clone)]
pub enum CoreEvent {
    TaskStateChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskProgress {
        task_id: TaskId,
        fraction: f64,
        message: String,
    },
    DagStateChanged {
        dag_id: DagId,
        status: TaskStatus,
    },
    NodeStateChanged {
        dag_id: DagId,
        node_id: NodeId,
        status: TaskStatus,
    },
    TriggerFired {
        trigger_id: TriggerId,
        task_id: TaskId,
    },
}

/// Broadcast bus decoupling the core from its observers.
///
/// Publishing never fails and never blocks: a slow or dropped subscriber
/// loses events rather than affecting core execution.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: CoreEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as an async stream
    pub fn subscribe_stream(&self) -> BroadcastStream<CoreEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
