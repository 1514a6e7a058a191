//! Agent Pool Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Process management
//! - The manager/worker wire protocol
//! - Runtime specifics
//!
//! Everything the pool manager, the worker process and outside
//! collaborators exchange is defined here.

pub mod error;
pub mod event;
pub mod ids;
pub mod limits;
pub mod pool;
pub mod result;
pub mod status;
pub mod task;
pub mod worker;

// Re-export commonly used types
pub use error::CoreError;
pub use event::PoolEvent;
pub use ids::{MessageId, TaskId, WorkerId};
pub use limits::ResourceLimits;
pub use pool::{
    PoolMetrics, PoolStatus, QueueDepths, ScalingAction, ScalingDirection, WorkerCounts,
};
pub use result::{ErrorKind, OutputStream, TaskOutcome, TaskResult};
pub use status::{TaskStatus, WorkerStatus};
pub use task::{Task, TaskKind, TaskPriority, TaskTimestamps, WORKSTREAM_KEY};
pub use worker::{WorkerInfo, WorkerMetrics};
