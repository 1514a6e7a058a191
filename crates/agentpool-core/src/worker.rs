//! Worker information types.

use crate::{TaskId, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource and throughput metrics for one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_duration_ms: u64,
    pub uptime_secs: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerMetrics {
    /// Fold one finished attempt into the counters.
    pub fn record_attempt(&mut self, success: bool, duration_ms: u64) {
        let finished = self.tasks_completed + self.tasks_failed;
        let total = self.avg_duration_ms.saturating_mul(finished) + duration_ms;
        if success {
            self.tasks_completed += 1;
        } else {
            self.tasks_failed += 1;
        }
        self.avg_duration_ms = total / (finished + 1);
    }
}

/// Snapshot of a worker as seen by the pool manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    /// OS process id, known once the worker sent `ready`.
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub current_task: Option<TaskId>,
    pub metrics: WorkerMetrics,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl WorkerInfo {
    /// Create a new WorkerInfo for a worker that is just starting.
    pub fn new(worker_id: WorkerId) -> Self {
        let now = Utc::now();
        Self {
            worker_id,
            pid: None,
            status: WorkerStatus::Starting,
            current_task: None,
            metrics: WorkerMetrics::default(),
            started_at: now,
            last_activity: now,
        }
    }

    /// Age of the last heartbeat (or of the start time, before the first one).
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.metrics.last_heartbeat.unwrap_or(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_attempt_running_average() {
        let mut metrics = WorkerMetrics::default();
        metrics.record_attempt(true, 100);
        metrics.record_attempt(false, 300);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.avg_duration_ms, 200);
    }

    #[test]
    fn test_heartbeat_age_falls_back_to_start() {
        let info = WorkerInfo::new(WorkerId::new(1));
        let later = info.started_at + chrono::Duration::seconds(4);
        assert_eq!(info.heartbeat_age(later).num_seconds(), 4);
    }
}
