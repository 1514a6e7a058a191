//! Worker configuration.

use std::time::Duration;

use agentpool_core::{ResourceLimits, WorkerId};

use crate::policy::EnvPolicy;

/// Worker configuration, filled from the command line by the manager.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Id assigned by the manager; only used for logging.
    pub worker_id: Option<WorkerId>,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Time a terminated subprocess gets before it is killed.
    pub abort_grace_ms: u64,

    /// Timeout for tasks that carry none.
    pub default_timeout_ms: u64,

    /// Declared resource limits (advisory).
    pub limits: ResourceLimits,

    /// Parent environment allow-list.
    pub env_policy: EnvPolicy,

    /// Deny patterns on top of the built-in ones.
    pub deny_patterns: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            heartbeat_interval_ms: 1_000,
            abort_grace_ms: 5_000,
            default_timeout_ms: 60 * 60 * 1000,
            limits: ResourceLimits::default(),
            env_policy: EnvPolicy::default(),
            deny_patterns: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Effective timeout for a task, capped by the declared limit.
    pub fn task_timeout(&self, task_timeout_ms: Option<u64>) -> Duration {
        let ms = task_timeout_ms
            .unwrap_or(self.default_timeout_ms)
            .min(self.limits.timeout_ms);
        Duration::from_millis(ms)
    }
}
