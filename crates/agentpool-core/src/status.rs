//! Status enums for Tasks and Workers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a Task inside the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task waiting in the queue for a free worker.
    #[default]
    Queued,
    /// Task sent to a worker, subprocess not confirmed yet.
    Assigned,
    /// Worker confirmed the subprocess is running.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed and exhausted its retry budget.
    Failed,
    /// Task was cancelled by the coordinator or by shutdown.
    Cancelled,
    /// Task exceeded its timeout on the final attempt.
    Timeout,
}

impl TaskStatus {
    /// Returns true if the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Returns true if the task is currently held by a worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Status of a Worker process.
///
/// ```text
/// starting -> idle <-> busy -> idle | error | crashed -> stopping
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Process spawned, `ready` not received yet.
    #[default]
    Starting,
    /// Ready to accept a task.
    Idle,
    /// Running exactly one task.
    Busy,
    /// Reported an unexpected failure with no active task.
    Error,
    /// Process died (or went silent) while holding a task.
    Crashed,
    /// Shutting down; never receives new work.
    Stopping,
}

impl WorkerStatus {
    /// Returns true if the worker can accept a task right now.
    pub fn can_accept_task(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true while the worker counts toward pool capacity.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Idle | Self::Busy | Self::Error)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (_, Stopping) => true,
            (Starting, Idle) | (Starting, Error) | (Starting, Crashed) => true,
            (Idle, Busy) | (Idle, Error) | (Idle, Crashed) => true,
            (Busy, Idle) | (Busy, Error) | (Busy, Crashed) => true,
            (Error, Idle) | (Error, Crashed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Error => "error",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(TaskStatus::Running.is_in_flight());
    }

    #[test]
    fn test_worker_transitions() {
        use WorkerStatus::*;
        assert!(Starting.can_transition_to(Idle));
        assert!(Idle.can_transition_to(Busy));
        assert!(Busy.can_transition_to(Idle));
        assert!(Busy.can_transition_to(Crashed));
        assert!(Error.can_transition_to(Idle));
        assert!(Crashed.can_transition_to(Stopping));

        assert!(!Starting.can_transition_to(Busy));
        assert!(!Crashed.can_transition_to(Idle));
        assert!(!Stopping.can_transition_to(Idle));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Timeout).unwrap();
        assert_eq!(json, "\"TIMEOUT\"");
        let json = serde_json::to_string(&WorkerStatus::Busy).unwrap();
        assert_eq!(json, "\"BUSY\"");
    }
}
