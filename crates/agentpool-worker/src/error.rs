//! Worker errors.

use agentpool_core::ErrorKind;
use agentpool_proto::ProtoError;
use thiserror::Error;

use crate::policy::BlockedCommand;

/// Errors that stop the worker process itself.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid deny pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

/// Errors that end a single execution attempt.
///
/// These never escape the worker: they become a failed `TaskResult`.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Blocked(#[from] BlockedCommand),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for the subprocess: {0}")]
    Wait(#[source] std::io::Error),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Blocked(_) => ErrorKind::BlockedCommand,
            Self::Spawn { .. } => ErrorKind::SpawnFailed,
            Self::Wait(_) => ErrorKind::ExecutionFailed,
        }
    }
}
