//! Pool configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentpool_core::ResourceLimits;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Pool manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Lower bound on live workers.
    pub min_workers: usize,

    /// Upper bound on live workers.
    pub max_workers: usize,

    /// Workers launched at startup.
    pub initial_workers: usize,

    /// Utilization at or above which the pool grows.
    pub scale_up_threshold: f64,

    /// Utilization at or below which the pool shrinks.
    pub scale_down_threshold: f64,

    pub scale_up_step: usize,
    pub scale_down_step: usize,

    /// How often the autoscaler runs (ms).
    pub scale_interval_ms: u64,

    /// Quiet period after a scaling action (ms).
    pub cooldown_ms: u64,

    /// Health monitor tick (ms).
    pub health_check_interval_ms: u64,

    /// Missed health intervals before a worker counts as crashed.
    pub missed_heartbeats: u32,

    /// Timeout for tasks that carry none (ms).
    pub default_task_timeout_ms: u64,

    /// Time a new worker has to send `ready` (ms).
    pub worker_start_timeout_ms: u64,

    /// Grace between SIGTERM and SIGKILL for an aborted task (ms).
    pub abort_grace_ms: u64,

    /// Time a stopping worker has to exit before it is killed (ms).
    pub worker_stop_timeout_ms: u64,

    /// Heartbeat interval requested from workers (ms).
    pub heartbeat_interval_ms: u64,

    /// How often running tasks are checked for timeouts and abort deadlines (ms).
    pub sweep_interval_ms: u64,

    /// Capacity of the event broadcast channel.
    pub event_buffer: usize,

    /// Finished task ids remembered for dependency and cancel lookups.
    pub finished_task_history: usize,

    /// Worker executable; defaults to `agentpool-worker` next to the manager.
    pub worker_bin: Option<PathBuf>,

    /// Declared per-worker limits.
    pub limits: ResourceLimits,

    /// Replaces the workers' exact-name env allow-list when non-empty.
    pub env_allow: Vec<String>,

    /// Replaces the workers' env prefix allow-list when non-empty.
    pub env_allow_prefixes: Vec<String>,

    /// Extra deny patterns on top of the built-in ones.
    pub deny_patterns: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 10,
            initial_workers: 2,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            scale_up_step: 2,
            scale_down_step: 1,
            scale_interval_ms: 5_000,
            cooldown_ms: 30_000,
            health_check_interval_ms: 5_000,
            missed_heartbeats: 3,
            default_task_timeout_ms: 60 * 60 * 1000,
            worker_start_timeout_ms: 10_000,
            abort_grace_ms: 5_000,
            worker_stop_timeout_ms: 5_000,
            heartbeat_interval_ms: 1_000,
            sweep_interval_ms: 250,
            event_buffer: 1024,
            finished_task_history: 10_000,
            worker_bin: None,
            limits: ResourceLimits::default(),
            env_allow: Vec::new(),
            env_allow_prefixes: Vec::new(),
            deny_patterns: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(invalid("max_workers must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.initial_workers < self.min_workers || self.initial_workers > self.max_workers {
            return Err(invalid(format!(
                "initial_workers ({}) must be within [{}, {}]",
                self.initial_workers, self.min_workers, self.max_workers
            )));
        }
        for (name, value) in [
            ("scale_up_threshold", self.scale_up_threshold),
            ("scale_down_threshold", self.scale_down_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(invalid(
                "scale_down_threshold must be below scale_up_threshold",
            ));
        }
        if self.scale_up_step == 0 || self.scale_down_step == 0 {
            return Err(invalid("scale steps must be at least 1"));
        }
        if self.missed_heartbeats == 0 {
            return Err(invalid("missed_heartbeats must be at least 1"));
        }
        for (name, value) in [
            ("scale_interval_ms", self.scale_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("default_task_timeout_ms", self.default_task_timeout_ms),
            ("worker_start_timeout_ms", self.worker_start_timeout_ms),
            ("worker_stop_timeout_ms", self.worker_stop_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ] {
            if value == 0 {
                return Err(invalid(format!("{} must be greater than zero", name)));
            }
        }
        if self.event_buffer == 0 {
            return Err(invalid("event_buffer must be at least 1"));
        }
        Ok(())
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn worker_start_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_start_timeout_ms)
    }

    pub fn worker_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_stop_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// How long the manager waits for an aborted task's result.
    pub fn abort_deadline(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms + self.worker_stop_timeout_ms)
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        config.validate().unwrap();
        assert_eq!(config.abort_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let config = PoolConfig {
            min_workers: 5,
            max_workers: 2,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = PoolConfig {
            initial_workers: 20,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            min_workers: 0,
            max_workers: 0,
            initial_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_hysteresis_gap() {
        let config = PoolConfig {
            scale_up_threshold: 0.5,
            scale_down_threshold: 0.5,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("scale_down_threshold"));

        let config = PoolConfig {
            scale_up_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_intervals_and_steps() {
        let config = PoolConfig {
            sweep_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("sweep_interval_ms"));

        let config = PoolConfig {
            scale_down_step: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let path = std::env::temp_dir().join(format!("agentpool-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"min_workers": 1, "max_workers": 4, "initial_workers": 1}"#).unwrap();
        let config = PoolConfig::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.max_workers, 4);
        assert_eq!(config.scale_up_step, 2);
        config.validate().unwrap();

        assert!(matches!(
            PoolConfig::load("/nonexistent/agentpool.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
