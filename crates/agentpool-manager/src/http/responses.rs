//! HTTP request and response types.

use agentpool_core::{TaskId, WorkerCounts};
use serde::Serialize;

use crate::manager::CancelOutcome;

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl ToString) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

/// Body of `/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, `degraded` (no live worker) or `shutting_down`.
    pub status: &'static str,
    pub workers: WorkerCounts,
    pub queue_depth: usize,
}

/// Response for an accepted task.
#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

/// Response for a cancel request.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub outcome: CancelOutcome,
}
