//! Task execution results.

use crate::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Rejected by the command deny-list; nothing was spawned.
    BlockedCommand,
    /// The subprocess could not be started.
    SpawnFailed,
    /// The subprocess exited non-zero.
    ExecutionFailed,
    /// The attempt ran past its timeout.
    Timeout,
    /// The worker process died or went silent mid-task.
    WorkerCrashed,
    /// Aborted on request.
    Cancelled,
    /// A task this one depends on did not complete.
    DependencyFailed,
    /// No worker could be started to run the task.
    WorkerStartFailed,
}

impl ErrorKind {
    /// Whether an attempt ending this way may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed | Self::ExecutionFailed | Self::Timeout | Self::WorkerCrashed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlockedCommand => "BLOCKED_COMMAND",
            Self::SpawnFailed => "SPAWN_FAILED",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::WorkerCrashed => "WORKER_CRASHED",
            Self::Cancelled => "CANCELLED",
            Self::DependencyFailed => "DEPENDENCY_FAILED",
            Self::WorkerStartFailed => "WORKER_START_FAILED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    /// Process exit code, absent when nothing ran or the process was killed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub error: Option<ErrorKind>,
}

impl TaskResult {
    /// A successful attempt.
    pub fn success(task_id: TaskId, stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            task_id,
            success: true,
            exit_code: Some(0),
            stdout,
            stderr,
            duration_ms,
            error: None,
        }
    }

    /// A failed attempt with only an error kind and message.
    pub fn failure(task_id: TaskId, error: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: 0,
            error: Some(error),
        }
    }

    /// Terminal result for a command rejected by the deny-list.
    pub fn blocked(task_id: TaskId, pattern: &str) -> Self {
        Self::failure(
            task_id,
            ErrorKind::BlockedCommand,
            format!("command blocked by policy (matched '{}')", pattern),
        )
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// What a submitter finally learns about a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    /// Always terminal.
    pub status: TaskStatus,
    /// Result of the last attempt, if any attempt produced one.
    pub result: Option<TaskResult>,
    /// Number of execution attempts made.
    pub attempts: u32,
}

impl TaskOutcome {
    /// Error kind of the final attempt, if it failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.result.as_ref().and_then(|r| r.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_result() {
        let result = TaskResult::blocked(TaskId::new("t1"), "rm -rf /");
        assert!(!result.success);
        assert_eq!(result.error, Some(ErrorKind::BlockedCommand));
        assert!(result.exit_code.is_none());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"], "BLOCKED_COMMAND");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::ExecutionFailed.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::WorkerCrashed.is_retryable());
        assert!(!ErrorKind::BlockedCommand.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::DependencyFailed.is_retryable());
    }
}
