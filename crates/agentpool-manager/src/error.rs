//! Pool manager errors.

use agentpool_core::{CoreError, TaskId};
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned by the pool manager API.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The task failed boundary validation and was never queued.
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error("Unknown dependency: {0}")]
    UnknownDependency(TaskId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task already finished: {0}")]
    AlreadyTerminal(TaskId),

    #[error("Pool is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors starting a worker process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("Worker launch failed: {0}")]
    Failed(String),
}
