//! Resource sampling for heartbeats.

use std::time::Instant;

use agentpool_core::ResourceLimits;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::warn;

/// Point-in-time usage of the worker and its running subprocess.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

/// Samples the worker's own process plus the current child, if any.
pub struct ResourceSampler {
    started: Instant,
    own_pid: Pid,
    system: System,
    limits: ResourceLimits,
}

impl ResourceSampler {
    pub fn new(limits: ResourceLimits) -> Self {
        let system = System::new_with_specifics(
            RefreshKind::new().with_processes(ProcessRefreshKind::new().with_cpu().with_memory()),
        );
        Self {
            started: Instant::now(),
            own_pid: Pid::from_u32(std::process::id()),
            system,
            limits,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Refresh and sum usage over the worker and `child`.
    ///
    /// CPU readings need two refreshes to be meaningful, so the first
    /// sample after a child spawned reports 0% for it.
    pub fn sample(&mut self, child: Option<u32>) -> ResourceUsage {
        let mut pids = vec![self.own_pid];
        if let Some(child) = child {
            pids.push(Pid::from_u32(child));
        }

        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        let mut usage = ResourceUsage::default();
        for pid in &pids {
            if let Some(process) = self.system.process(*pid) {
                usage.cpu_percent += process.cpu_usage();
                usage.memory_mb += process.memory() as f64 / (1024.0 * 1024.0);
            }
        }

        if let Some(breach) = self.limits.breached_by(usage.memory_mb, usage.cpu_percent) {
            warn!(
                breach = %breach,
                child_pid = ?child,
                "Declared resource limit exceeded"
            );
        }
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_own_process() {
        let mut sampler = ResourceSampler::new(ResourceLimits::default());
        let usage = sampler.sample(None);
        assert!(usage.memory_mb > 0.0);
        assert!(usage.cpu_percent >= 0.0);
    }

    #[test]
    fn test_missing_child_is_ignored() {
        let mut sampler = ResourceSampler::new(ResourceLimits::default());
        let own = sampler.sample(None);
        // pid far beyond any pid_max
        let with_ghost = sampler.sample(Some(u32::MAX - 1));
        assert!(with_ghost.memory_mb > 0.0);
        assert!(with_ghost.memory_mb < own.memory_mb * 4.0);
    }
}
