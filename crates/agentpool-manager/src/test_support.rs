//! Launchers and helpers for manager tests.
//!
//! `InProcessLauncher` drives real `WorkerRuntime`s over in-memory pipes, so
//! tests exercise the full protocol and real subprocess execution without
//! needing the worker binary on disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentpool_core::{PoolEvent, WorkerId};
use agentpool_proto::{Message, MessageWriter};
use agentpool_worker::{EnvPolicy, WorkerConfig, WorkerRuntime};
use async_trait::async_trait;
use tokio::io::{duplex, DuplexStream};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::LaunchError;
use crate::launcher::{LaunchedWorker, ProcessControl, WorkerLauncher};
use crate::manager::PoolManager;

const PIPE_CAPACITY: usize = 256 * 1024;
const WAIT: Duration = Duration::from_secs(15);

/// Fast timers, no autoscaling or health checks unless a test opts in.
pub fn test_config(min: usize, max: usize) -> PoolConfig {
    PoolConfig {
        min_workers: min,
        max_workers: max,
        initial_workers: min,
        scale_interval_ms: 60_000,
        cooldown_ms: 0,
        health_check_interval_ms: 60_000,
        heartbeat_interval_ms: 100,
        sweep_interval_ms: 25,
        abort_grace_ms: 200,
        worker_stop_timeout_ms: 2_000,
        worker_start_timeout_ms: 5_000,
        ..Default::default()
    }
}

pub struct InProcessLauncher {
    config: WorkerConfig,
    runtimes: Mutex<HashMap<WorkerId, AbortHandle>>,
}

impl InProcessLauncher {
    pub fn new(pool: &PoolConfig) -> Arc<Self> {
        let mut env_policy = EnvPolicy::default();
        if !pool.env_allow.is_empty() {
            env_policy.exact = pool.env_allow.clone();
        }
        if !pool.env_allow_prefixes.is_empty() {
            env_policy.prefixes = pool.env_allow_prefixes.clone();
        }
        Arc::new(Self {
            config: WorkerConfig {
                worker_id: None,
                heartbeat_interval_ms: pool.heartbeat_interval_ms,
                abort_grace_ms: pool.abort_grace_ms,
                default_timeout_ms: pool.default_task_timeout_ms,
                limits: pool.limits.clone(),
                env_policy,
                deny_patterns: pool.deny_patterns.clone(),
            },
            runtimes: Mutex::new(HashMap::new()),
        })
    }

    /// Kill a worker's runtime as if its process died. Its pipes close
    /// without a goodbye.
    pub fn kill(&self, worker_id: WorkerId) -> bool {
        match self.runtimes.lock().unwrap().remove(&worker_id) {
            Some(runtime) => {
                runtime.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError> {
        let (manager_stdin, worker_stdin) = duplex(PIPE_CAPACITY);
        let (worker_stdout, manager_stdout) = duplex(PIPE_CAPACITY);

        let runtime = WorkerRuntime::new(WorkerConfig {
            worker_id: Some(worker_id),
            ..self.config.clone()
        })
        .map_err(|e| LaunchError::Failed(e.to_string()))?;

        let task = tokio::spawn(async move {
            if let Err(e) = runtime.run(worker_stdin, worker_stdout).await {
                debug!(worker_id = %worker_id, error = %e, "In-process worker ended with error");
            }
        });
        self.runtimes
            .lock()
            .unwrap()
            .insert(worker_id, task.abort_handle());

        Ok(LaunchedWorker {
            stdin: Box::new(manager_stdin),
            stdout: Box::new(manager_stdout),
            control: Box::new(TaskControl {
                task,
                finished: false,
            }),
        })
    }
}

struct TaskControl {
    task: JoinHandle<()>,
    finished: bool,
}

#[async_trait]
impl ProcessControl for TaskControl {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        if !self.finished {
            self.finished = tokio::time::timeout(timeout, &mut self.task).await.is_ok();
        }
        self.finished
    }

    async fn kill(&mut self) {
        if self.finished {
            return;
        }
        self.task.abort();
        let _ = (&mut self.task).await;
        self.finished = true;
    }
}

/// Workers that never report ready.
pub struct SilentLauncher;

#[async_trait]
impl WorkerLauncher for SilentLauncher {
    async fn launch(&self, _worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError> {
        let (manager_stdin, worker_stdin) = duplex(PIPE_CAPACITY);
        let (worker_stdout, manager_stdout) = duplex(PIPE_CAPACITY);
        Ok(LaunchedWorker {
            stdin: Box::new(manager_stdin),
            stdout: Box::new(manager_stdout),
            control: Box::new(SilentControl {
                pipes: Some((worker_stdin, worker_stdout)),
            }),
        })
    }
}

struct SilentControl {
    pipes: Option<(DuplexStream, DuplexStream)>,
}

#[async_trait]
impl ProcessControl for SilentControl {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        if self.pipes.is_none() {
            return true;
        }
        tokio::time::sleep(timeout).await;
        false
    }

    async fn kill(&mut self) {
        self.pipes = None;
    }
}

/// Workers that report ready and then never answer again.
pub struct MuteLauncher;

#[async_trait]
impl WorkerLauncher for MuteLauncher {
    async fn launch(&self, _worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError> {
        let (manager_stdin, worker_stdin) = duplex(PIPE_CAPACITY);
        let (worker_stdout, manager_stdout) = duplex(PIPE_CAPACITY);
        let task = tokio::spawn(async move {
            let _stdin = worker_stdin;
            let mut writer = MessageWriter::new(worker_stdout);
            if writer.send(&Message::ready(0)).await.is_ok() {
                std::future::pending::<()>().await;
            }
        });
        Ok(LaunchedWorker {
            stdin: Box::new(manager_stdin),
            stdout: Box::new(manager_stdout),
            control: Box::new(TaskControl {
                task,
                finished: false,
            }),
        })
    }
}

/// Every launch fails.
pub struct FailingLauncher;

#[async_trait]
impl WorkerLauncher for FailingLauncher {
    async fn launch(&self, _worker_id: WorkerId) -> Result<LaunchedWorker, LaunchError> {
        Err(LaunchError::Failed("no capacity".to_string()))
    }
}

/// Next event matching `pred`, skipping everything else.
pub async fn wait_for<F>(events: &mut broadcast::Receiver<PoolEvent>, pred: F) -> PoolEvent
where
    F: Fn(&PoolEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Every event up to and including the terminal event of `task_id`.
pub async fn collect_until_terminal(
    events: &mut broadcast::Receiver<PoolEvent>,
    task_id: &str,
) -> Vec<PoolEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = event.is_terminal()
                        && event.task_id().map(|id| id.as_str() == task_id).unwrap_or(false);
                    seen.push(event);
                    if done {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out collecting events");
    seen
        .into_iter()
        .filter(|e| e.task_id().is_some())
        .collect()
}

/// Poll until at least `count` workers are idle.
pub async fn wait_for_idle(pool: &PoolManager, count: usize) {
    tokio::time::timeout(WAIT, async {
        loop {
            if pool.metrics().await.unwrap().workers.idle >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers did not become idle");
}
