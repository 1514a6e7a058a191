//! Pool-level metrics and status snapshots.

use crate::{TaskPriority, WorkerInfo, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub starting: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub crashed: usize,
    pub stopping: usize,
}

impl WorkerCounts {
    /// Tally a set of worker statuses.
    pub fn from_statuses(statuses: impl IntoIterator<Item = WorkerStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.add(status);
        }
        counts
    }

    pub fn add(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Starting => self.starting += 1,
            WorkerStatus::Idle => self.idle += 1,
            WorkerStatus::Busy => self.busy += 1,
            WorkerStatus::Error => self.error += 1,
            WorkerStatus::Crashed => self.crashed += 1,
            WorkerStatus::Stopping => self.stopping += 1,
        }
    }

    /// Workers that count toward capacity.
    pub fn live(&self) -> usize {
        self.starting + self.idle + self.busy + self.error
    }
}

/// Queued tasks per priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub background: usize,
}

impl QueueDepths {
    pub fn get(&self, priority: TaskPriority) -> usize {
        match priority {
            TaskPriority::High => self.high,
            TaskPriority::Medium => self.medium,
            TaskPriority::Low => self.low,
            TaskPriority::Background => self.background,
        }
    }
}

/// Derived snapshot, recomputed on every read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub workers: WorkerCounts,
    pub total_workers: usize,
    pub queue_depth: usize,
    #[serde(default)]
    pub queue_by_priority: QueueDepths,
    pub running_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub avg_task_duration_ms: u64,
    pub avg_queue_wait_ms: u64,
    /// Busy workers divided by live workers.
    pub utilization: f64,
    pub uptime_secs: u64,
}

/// Direction of an autoscaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingDirection {
    Up,
    Down,
}

/// A scaling action the pool actually took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub direction: ScalingDirection,
    /// Live workers before the action.
    pub from: usize,
    /// Live workers the action aims for.
    pub to: usize,
    /// Utilization that triggered it.
    pub utilization: f64,
    pub at: DateTime<Utc>,
}

/// Full status: metrics, every worker, and the last scaling action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub metrics: PoolMetrics,
    pub workers: Vec<WorkerInfo>,
    pub last_scaling_action: Option<ScalingAction>,
}
