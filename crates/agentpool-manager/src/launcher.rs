//! Starting worker processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use agentpool_core::WorkerId;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::config::PoolConfig;
use crate::error::LaunchError;

/// Default worker executable name.
pub const WORKER_BIN: &str = "agentpool-worker";

/// Lifecycle control over a launched worker.
#[async_trait]
pub trait ProcessControl: Send {
    /// OS process id, when there is one.
    fn id(&self) -> Option<u32>;

    /// Wait up to `timeout` for the worker to exit on its own.
    async fn wait_exit(&mut self, timeout: Duration) -> bool;

    /// Forcefully terminate the worker.
    async fn kill(&mut self);
}

/// The pipes and control handle of a freshly started worker.
pub struct LaunchedWorker {
    /// Manager -> worker messages.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Worker -> manager messages.
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub control: Box<dyn ProcessControl>,
}

/// Starts workers. The manager is the only caller.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError>;
}

/// Launches `agentpool-worker` child processes.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(config: &PoolConfig) -> Self {
        let program = config.worker_bin.clone().unwrap_or_else(default_worker_bin);
        Self {
            program,
            args: worker_args(config),
        }
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError> {
        let mut child = Command::new(&self.program)
            .arg("--worker-id")
            .arg(worker_id.seq().to_string())
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        info!(worker_id = %worker_id, pid = ?child.id(), "Worker process spawned");

        Ok(LaunchedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, self.child.wait()).await,
            Ok(Ok(_))
        )
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Worker kill failed, already exited");
        }
    }
}

/// `agentpool-worker` next to the running executable, else on `PATH`.
fn default_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BIN)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_BIN))
}

/// Command-line flags carrying the pool settings a worker needs.
pub fn worker_args(config: &PoolConfig) -> Vec<String> {
    let limits = &config.limits;
    let mut args = vec![
        "--heartbeat-interval-ms".to_string(),
        config.heartbeat_interval_ms.to_string(),
        "--abort-grace-ms".to_string(),
        config.abort_grace_ms.to_string(),
        "--default-timeout-ms".to_string(),
        config.default_task_timeout_ms.to_string(),
        "--memory-mb".to_string(),
        limits.memory_mb.to_string(),
        "--cpu-percent".to_string(),
        limits.cpu_percent.to_string(),
        "--max-processes".to_string(),
        limits.max_processes.to_string(),
        "--max-open-files".to_string(),
        limits.max_open_files.to_string(),
        "--limit-timeout-ms".to_string(),
        limits.timeout_ms.to_string(),
    ];
    for name in &config.env_allow {
        args.push("--env-allow".to_string());
        args.push(name.clone());
    }
    for prefix in &config.env_allow_prefixes {
        args.push("--env-allow-prefix".to_string());
        args.push(prefix.clone());
    }
    for pattern in &config.deny_patterns {
        args.push("--deny-pattern".to_string());
        args.push(pattern.clone());
    }
    args
}
