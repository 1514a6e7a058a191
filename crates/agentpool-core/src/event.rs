//! Pool events streamed to subscribers.
//!
//! Events for a given task are emitted in the order the underlying state
//! changes happened.

use crate::{
    ErrorKind, OutputStream, PoolMetrics, ScalingAction, TaskId, TaskPriority, TaskResult,
    TaskStatus, WorkerId, WorkerStatus,
};
use serde::{Deserialize, Serialize};

/// An observable change in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum PoolEvent {
    #[serde(rename = "worker.started")]
    WorkerStarted { worker_id: WorkerId, pid: u32 },

    #[serde(rename = "worker.stopped")]
    WorkerStopped { worker_id: WorkerId, reason: String },

    #[serde(rename = "worker.error")]
    WorkerError { worker_id: WorkerId, message: String },

    #[serde(rename = "worker.status")]
    WorkerStatusChanged {
        worker_id: WorkerId,
        from: WorkerStatus,
        to: WorkerStatus,
    },

    #[serde(rename = "task.queued")]
    TaskQueued {
        task_id: TaskId,
        priority: TaskPriority,
        attempt: u32,
    },

    #[serde(rename = "task.assigned")]
    TaskAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
    },

    #[serde(rename = "task.started")]
    TaskStarted { task_id: TaskId, worker_id: WorkerId },

    #[serde(rename = "task.output")]
    TaskOutput {
        task_id: TaskId,
        worker_id: WorkerId,
        stream: OutputStream,
        content: String,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted { task_id: TaskId, result: TaskResult },

    /// Terminal failure (`failed` or `timeout`).
    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: TaskId,
        status: TaskStatus,
        error: Option<ErrorKind>,
        attempts: u32,
        result: Option<TaskResult>,
    },

    #[serde(rename = "task.cancelled")]
    TaskCancelled { task_id: TaskId, reason: String },

    #[serde(rename = "pool.scaled")]
    PoolScaled { action: ScalingAction },

    #[serde(rename = "pool.status")]
    PoolStatus { metrics: PoolMetrics },
}

impl PoolEvent {
    /// Dotted event name, as used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkerStarted { .. } => "worker.started",
            Self::WorkerStopped { .. } => "worker.stopped",
            Self::WorkerError { .. } => "worker.error",
            Self::WorkerStatusChanged { .. } => "worker.status",
            Self::TaskQueued { .. } => "task.queued",
            Self::TaskAssigned { .. } => "task.assigned",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskOutput { .. } => "task.output",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::PoolScaled { .. } => "pool.scaled",
            Self::PoolStatus { .. } => "pool.status",
        }
    }

    /// The task this event concerns, if any.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskQueued { task_id, .. }
            | Self::TaskAssigned { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskOutput { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id, .. } => Some(task_id),
            _ => None,
        }
    }

    /// True for the events that end a task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::TaskCompleted { .. } | Self::TaskFailed { .. } | Self::TaskCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_matches_serde_tag() {
        let event = PoolEvent::TaskQueued {
            task_id: TaskId::new("t1"),
            priority: TaskPriority::High,
            attempt: 1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["priority"], "high");
        assert_eq!(event.task_id(), Some(&TaskId::new("t1")));
    }

    #[test]
    fn test_worker_status_event() {
        let event = PoolEvent::WorkerStatusChanged {
            worker_id: WorkerId::new(2),
            from: WorkerStatus::Idle,
            to: WorkerStatus::Busy,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "worker.status");
        assert_eq!(json["worker_id"], 2);
        assert!(event.task_id().is_none());
        assert!(!event.is_terminal());
    }
}
