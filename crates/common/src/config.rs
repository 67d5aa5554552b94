//! Configuration loading with file and environment overrides

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub dag: DagConfig,
    pub trigger: TriggerConfig,
    pub observability: ObservabilityConfig,
}

/// Task manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub default_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub shutdown_deadline_ms: u64,
    pub cancel_grace_ms: u64,
}

impl OrchestratorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

/// DAG engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DagConfig {
    pub max_concurrent_tasks: usize,
    pub execution_log_capacity: usize,
    /// Strict mode marks dependents of a failed node SKIPPED transitively
    pub strict_propagation: bool,
}

/// Trigger manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TriggerConfig {
    pub tick_interval_ms: u64,
}

impl TriggerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub log_level: String,
    pub log_format: LogFormat,
}

/// Log format
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Config {
    /// Load configuration from defaults, `config.toml`, and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder()
            .set_default("orchestrator.max_concurrent", 5)?
            .set_default("orchestrator.default_timeout_ms", 300_000)?
            .set_default("orchestrator.retry_base_ms", 1_000)?
            .set_default("orchestrator.retry_cap_ms", 60_000)?
            .set_default("orchestrator.shutdown_deadline_ms", 30_000)?
            .set_default("orchestrator.cancel_grace_ms", 5_000)?
            .set_default("dag.max_concurrent_tasks", 5)?
            .set_default("dag.execution_log_capacity", 10_000)?
            .set_default("dag.strict_propagation", false)?
            .set_default("trigger.tick_interval_ms", 1_000)?
            .set_default("observability.metrics_enabled", true)?
            .set_default("observability.log_level", "info")?
            .set_default("observability.log_format", "pretty")?;

        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        builder = builder.add_source(
            Environment::with_prefix("FINFLOW")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.orchestrator.max_concurrent == 0 {
            errors.push("orchestrator.max_concurrent must be greater than 0".to_string());
        }

        if self.orchestrator.retry_cap_ms < self.orchestrator.retry_base_ms {
            errors.push("orchestrator.retry_cap_ms must not be below retry_base_ms".to_string());
        }

        if self.dag.max_concurrent_tasks == 0 {
            errors.push("dag.max_concurrent_tasks must be greater than 0".to_string());
        }

        if self.dag.execution_log_capacity == 0 {
            errors.push("dag.execution_log_capacity must be greater than 0".to_string());
        }

        if self.trigger.tick_interval_ms == 0 {
            errors.push("trigger.tick_interval_ms must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig {
                max_concurrent: 5,
                default_timeout_ms: 300_000,
                retry_base_ms: 1_000,
                retry_cap_ms: 60_000,
                shutdown_deadline_ms: 30_000,
                cancel_grace_ms: 5_000,
            },
            dag: DagConfig {
                max_concurrent_tasks: 5,
                execution_log_capacity: 10_000,
                strict_propagation: false,
            },
            trigger: TriggerConfig {
                tick_interval_ms: 1_000,
            },
            observability: ObservabilityConfig {
                metrics_enabled: true,
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
            },
        }
    }
}
