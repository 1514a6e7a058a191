//! Declared per-worker resource limits.

use serde::{Deserialize, Serialize};

/// Limits declared for every worker process at spawn time.
///
/// These are advisory: workers report usage against them and log
/// breaches, the pool does not enforce them at the OS level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// CPU ceiling in percent of one core.
    pub cpu_percent: f32,
    /// Maximum child processes.
    pub max_processes: u32,
    /// Maximum open files.
    pub max_open_files: u32,
    /// Hard cap on any single task, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_percent: 100.0,
            max_processes: 32,
            max_open_files: 1024,
            timeout_ms: 60 * 60 * 1000,
        }
    }
}

impl ResourceLimits {
    /// Whether the sampled usage exceeds a declared ceiling.
    pub fn breached_by(&self, memory_mb: f64, cpu_percent: f32) -> Option<String> {
        if memory_mb > self.memory_mb as f64 {
            return Some(format!(
                "memory {:.1} MB over limit {} MB",
                memory_mb, self.memory_mb
            ));
        }
        if cpu_percent > self.cpu_percent {
            return Some(format!(
                "cpu {:.1}% over limit {:.1}%",
                cpu_percent, self.cpu_percent
            ));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_detection() {
        let limits = ResourceLimits {
            memory_mb: 100,
            cpu_percent: 50.0,
            ..Default::default()
        };
        assert!(limits.breached_by(10.0, 10.0).is_none());
        assert!(limits.breached_by(150.0, 10.0).unwrap().contains("memory"));
        assert!(limits.breached_by(10.0, 75.0).unwrap().contains("cpu"));
    }
}
