//! Error types for the FinFlow orchestration core

use thiserror::Error;

/// Main error type for the orchestration core
#[derive(Error, Debug)]
pub enum Error {
    /// Operation forbidden by the current lifecycle state
    #[error("Invalid state: cannot {operation} while {status}")]
    InvalidState { operation: String, status: String },

    /// Handler registry miss
    #[error("No handler registered for task type: {0}")]
    UnknownTaskType(String),

    /// A single run exceeded its wall-clock bound
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Cooperative cancellation observed
    #[error("Cancelled")]
    Cancelled,

    /// Failure returned by a task handler; content is opaque to the core
    #[error("Handler error: {0}")]
    Handler(String),

    /// A strict-mode dependency is FAILED
    #[error("Dependency failed: {0}")]
    DependencyFailed(String),

    /// DAG registration found a cycle
    #[error("Cycle detected: {0}")]
    CycleDetected(String),

    /// DAG references a node that does not exist
    #[error("Node {node} depends on missing node {missing}")]
    DanglingDependency { node: String, missing: String },

    /// Validation errors outside the DAG-specific kinds
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unknown errors
    #[error("Unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if error is retryable under the task retry policy
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Handler(_))
    }

    /// Stable label for metrics and execution records
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidState { .. } => "invalid_state",
            Error::UnknownTaskType(_) => "unknown_task_type",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::Handler(_) => "handler",
            Error::DependencyFailed(_) => "dependency_failed",
            Error::CycleDetected(_) => "cycle_detected",
            Error::DanglingDependency { .. } => "dangling_dependency",
            Error::Validation(_) => "validation",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
            Error::Unknown(_) => "unknown",
        }
    }

    /// Get error severity for metrics
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Error::Config(_) => ErrorSeverity::Critical,
            Error::CycleDetected(_) | Error::DanglingDependency { .. } => ErrorSeverity::High,
            Error::Timeout(_) | Error::Handler(_) | Error::UnknownTaskType(_) => {
                ErrorSeverity::Medium
            }
            Error::InvalidState { .. } | Error::Validation(_) | Error::Cancelled => {
                ErrorSeverity::Low
            }
            _ => ErrorSeverity::Medium,
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(Error::Timeout("t".into()).is_retryable());
        assert!(Error::Handler("boom".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::UnknownTaskType("x".into()).is_retryable());
        assert!(!Error::InvalidState {
            operation: "pause".into(),
            status: "pending".into()
        }
        .is_retryable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(
            Error::DanglingDependency {
                node: "a".into(),
                missing: "b".into()
            }
            .kind(),
            "dangling_dependency"
        );
    }
}
