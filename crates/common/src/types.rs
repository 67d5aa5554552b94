//! Common types used across the orchestration core

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Task ID type
pub type TaskId = Uuid;

/// Trigger ID type
pub type TriggerId = Uuid;

/// Execution record ID type
pub type ExecutionId = Uuid;

/// Node IDs are chosen by DAG authors and unique within their DAG
pub type NodeId = String;

/// DAG ID type
pub type DagId = String;

/// Opaque string-keyed payload passed to and returned from handlers
pub type ValueMap = HashMap<String, serde_json::Value>;

/// Task and node lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// Node-only status: dependency failed in strict mode, or branch not taken
    Skipped,
}

impl TaskStatus {
    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Legal transitions of the task/node state machine.
    ///
    /// `Pending -> Running` and `Running -> Pending` exist only on the DAG
    /// engine path, where nodes bypass the work queue and retries re-enter
    /// the ready set directly.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Skipped)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Queued)
                | (Running, Pending)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Failed, Queued)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }
}

/// Task priority; lower ordinal is dispatched earlier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
    Background = 4,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// Dispatch ordinal; Critical runs first
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// DAG node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    Condition,
    Parallel,
    Sequence,
    Start,
    End,
}

impl Default for NodeType {
    fn default() -> Self {
        Self::Task
    }
}

/// Pipeline stage kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Source,
    Transform,
    Validate,
    Filter,
    Aggregate,
    Join,
    Split,
    Sink,
    Branch,
    Merge,
    Parallel,
    Loop,
}

/// Trigger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Interval,
    Cron,
    Once,
    Condition,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::Cron => "cron",
            Self::Once => "once",
            Self::Condition => "condition",
            Self::Manual => "manual",
        }
    }
}

/// Trigger administrative state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    Enabled,
    Disabled,
}

/// Fractional progress plus a free-form message, monotone within a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub fraction: f64,
    pub message: String,
}

impl Progress {
    /// Update progress; the fraction is clamped to [0, 1] and never regresses
    pub fn update(&mut self, fraction: f64, message: impl Into<String>) {
        let clamped = fraction.clamp(0.0, 1.0);
        if clamped >= self.fraction {
            self.fraction = clamped;
        }
        self.message = message.into();
    }

    /// Reset at the start of a fresh run
    pub fn reset(&mut self) {
        self.fraction = 0.0;
        self.message.clear();
    }

    pub fn complete(&mut self) {
        self.fraction = 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_exits() {
        use TaskStatus::*;
        for terminal in [Completed, Cancelled, Skipped] {
            for next in [
                Pending, Queued, Running, Paused, Completed, Failed, Cancelled, Skipped,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} -> {next:?} should be illegal"
                );
            }
        }
        // Failed is terminal for observation purposes but admits explicit retry.
        assert!(Failed.is_terminal());
        assert!(Failed.can_transition_to(Queued));
    }

    #[test]
    fn cancelled_cannot_requeue() {
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn priority_ordering_is_by_ordinal() {
        assert!(TaskPriority::Critical < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Background);
        assert_eq!(TaskPriority::Critical.ordinal(), 0);
        assert_eq!(TaskPriority::Background.ordinal(), 4);
    }

    #[test]
    fn progress_is_monotone_and_clamped() {
        let mut p = Progress::default();
        p.update(0.5, "halfway");
        p.update(0.25, "stale report");
        assert_eq!(p.fraction, 0.5);
        p.update(1.5, "overshoot");
        assert_eq!(p.fraction, 1.0);
        p.reset();
        assert_eq!(p.fraction, 0.0);
    }
}
