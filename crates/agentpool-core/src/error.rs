//! Core domain errors.

use thiserror::Error;

/// Core domain errors for the agent pool.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Task failed validation at the submission boundary.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// A task with the same id is already known to the pool.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Worker not found.
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// A lifecycle timestamp was written twice or out of order.
    #[error("Timestamp '{field}' {reason}")]
    TimestampOrder { field: &'static str, reason: String },
}
