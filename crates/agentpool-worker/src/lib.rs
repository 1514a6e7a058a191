//! Agent Pool Worker
//!
//! The isolated worker process. It speaks the JSON-lines protocol on
//! stdin/stdout, runs one task at a time as a child process, and reports
//! results, live output and resource usage back to the pool manager.
//!
//! The runtime is generic over its pipes, so it can also be driven
//! in-process (the manager's tests do exactly that).

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod runtime;

pub use config::WorkerConfig;
pub use error::{ExecutorError, WorkerError};
pub use executor::{ExecutionEvent, OutputChunk, TaskExecutor};
pub use policy::{BlockedCommand, CommandGuard, EnvPolicy};
pub use runtime::WorkerRuntime;
