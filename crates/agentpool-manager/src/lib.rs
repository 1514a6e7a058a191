//! Agent Pool Manager
//!
//! Owns a pool of isolated worker processes: queues tasks by priority,
//! assigns them to idle workers, retries and times them out, watches worker
//! health and grows or shrinks the pool with load.
//!
//! The [`PoolManager`] handle is the whole API. Outer surfaces (the HTTP
//! router, the `agentpool` binary) are thin layers over it.

pub mod config;
pub mod error;
pub mod health;
mod history;
pub mod http;
pub mod launcher;
pub mod manager;
pub mod metrics;
pub mod queue;
pub mod scaling;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{ConfigError, PoolConfig};
pub use error::{LaunchError, PoolError};
pub use launcher::{LaunchedWorker, ProcessControl, ProcessLauncher, WorkerLauncher};
pub use manager::{CancelOutcome, PoolManager, TaskHandle};
pub use metrics::render_prometheus;
pub use queue::TaskQueue;
pub use scaling::{Autoscaler, ScalingDecision};
