//! The worker's protocol loop.
//!
//! One loop owns all worker state and reacts to exactly three inputs:
//! inbound protocol messages, progress from the running task, and the
//! heartbeat tick. Task execution happens on a separate tokio task, so the
//! loop never blocks on the subprocess.

use std::sync::Arc;

use agentpool_core::{TaskId, TaskResult, WorkerMetrics, WorkerStatus};
use agentpool_proto::{
    ControlCommand, Heartbeat, Message, MessageReader, MessageWriter, Payload, ProtoError,
};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::executor::{ExecutionEvent, TaskExecutor};
use crate::metrics::ResourceSampler;

const OUTBOUND_BUFFER: usize = 256;
const EXECUTION_BUFFER: usize = 256;

/// Progress from the execution task, delivered in order.
enum Progress {
    Event(ExecutionEvent),
    Finished(TaskResult),
}

struct ActiveTask {
    task_id: TaskId,
    cancel: CancellationToken,
    child_pid: Option<u32>,
    spawned: bool,
}

/// Whether the loop keeps going after handling an input.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// A worker: one task at a time, driven by protocol messages.
pub struct WorkerRuntime {
    config: WorkerConfig,
    executor: Arc<TaskExecutor>,
    sampler: ResourceSampler,
    metrics: WorkerMetrics,
    status: WorkerStatus,
    current: Option<ActiveTask>,
    shutting_down: bool,
}

impl WorkerRuntime {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let executor = Arc::new(TaskExecutor::new(config.clone())?);
        let sampler = ResourceSampler::new(config.limits.clone());
        Ok(Self {
            config,
            executor,
            sampler,
            metrics: WorkerMetrics::default(),
            status: WorkerStatus::Starting,
            current: None,
            shutting_down: false,
        })
    }

    /// Serve the protocol until shutdown or until the manager goes away.
    pub async fn run<R, W>(mut self, reader: R, writer: W) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut reader = MessageReader::new(reader);

        // Writes go through a queue so live output never stalls the loop.
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(writer);
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = writer.send(&message).await {
                    warn!(error = %e, "Failed to write to manager, dropping outbound queue");
                    break;
                }
            }
        });

        let (progress_tx, mut progress_rx) = mpsc::channel::<Progress>(EXECUTION_BUFFER);

        let pid = std::process::id();
        info!(worker_id = ?self.config.worker_id, pid, "Worker ready");
        self.status = WorkerStatus::Idle;
        let _ = outbound.send(Message::ready(pid)).await;

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        let mut outcome = Ok(());

        loop {
            let flow = tokio::select! {
                inbound = reader.next_message(), if !self.shutting_down => match inbound {
                    Ok(Some(message)) => self.handle_message(message, &outbound, &progress_tx).await,
                    Ok(None) => {
                        info!("Manager closed the channel, shutting down");
                        self.begin_shutdown()
                    }
                    Err(ProtoError::Malformed(e)) => {
                        warn!(error = %e, "Malformed message from manager");
                        let task_id = self.current.as_ref().map(|t| t.task_id.clone());
                        let _ = outbound
                            .send(Message::error(format!("malformed message: {}", e), task_id))
                            .await;
                        Flow::Continue
                    }
                    Err(e) => {
                        error!(error = %e, "Manager channel failed");
                        outcome = Err(e.into());
                        self.begin_shutdown()
                    }
                },
                Some(progress) = progress_rx.recv() => self.handle_progress(progress, &outbound).await,
                _ = heartbeat.tick() => {
                    self.send_heartbeat(&outbound).await;
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        self.status = WorkerStatus::Stopping;
        drop(outbound);
        if let Err(e) = writer_task.await {
            warn!(error = %e, "Writer task failed");
        }
        info!(
            tasks_completed = self.metrics.tasks_completed,
            tasks_failed = self.metrics.tasks_failed,
            "Worker stopped"
        );
        outcome
    }

    async fn handle_message(
        &mut self,
        message: Message,
        outbound: &mpsc::Sender<Message>,
        progress: &mpsc::Sender<Progress>,
    ) -> Flow {
        match message.payload {
            Payload::Task(task) => {
                if let Some(active) = &self.current {
                    warn!(
                        task_id = %task.id,
                        active_task = %active.task_id,
                        "Rejecting task, already busy"
                    );
                    let _ = outbound
                        .send(Message::error(
                            format!("worker busy with task {}", active.task_id),
                            Some(task.id),
                        ))
                        .await;
                    return Flow::Continue;
                }

                info!(task_id = %task.id, attempt = task.attempt(), "Received task");
                let cancel = CancellationToken::new();
                self.current = Some(ActiveTask {
                    task_id: task.id.clone(),
                    cancel: cancel.clone(),
                    child_pid: None,
                    spawned: false,
                });
                self.status = WorkerStatus::Busy;

                let executor = self.executor.clone();
                let progress = progress.clone();
                tokio::spawn(async move {
                    let (events_tx, mut events_rx) = mpsc::channel(EXECUTION_BUFFER);
                    let forward = progress.clone();
                    // Keep event order: everything the executor emitted goes
                    // through before the final result.
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = events_rx.recv().await {
                            if forward.send(Progress::Event(event)).await.is_err() {
                                break;
                            }
                        }
                    });
                    let result = executor.execute(&task, events_tx, cancel).await;
                    let _ = forwarder.await;
                    let _ = progress.send(Progress::Finished(result)).await;
                });
                Flow::Continue
            }
            Payload::Control(ControlCommand::Abort { task_id }) => {
                match &self.current {
                    Some(active) if active.task_id == task_id => {
                        info!(task_id = %task_id, "Aborting task");
                        active.cancel.cancel();
                    }
                    _ => debug!(task_id = %task_id, "Abort for a task that is not running, ignoring"),
                }
                Flow::Continue
            }
            Payload::Control(ControlCommand::Shutdown) => {
                info!("Shutdown requested");
                self.begin_shutdown()
            }
            Payload::Heartbeat(heartbeat) if heartbeat.is_request() => {
                self.send_heartbeat(outbound).await;
                Flow::Continue
            }
            other => {
                debug!(kind = other.kind(), "Ignoring unexpected message");
                Flow::Continue
            }
        }
    }

    async fn handle_progress(&mut self, progress: Progress, outbound: &mpsc::Sender<Message>) -> Flow {
        match progress {
            Progress::Event(ExecutionEvent::Spawned { task_id, pid }) => {
                match self.current.as_mut() {
                    Some(active) if active.task_id == task_id => {
                        active.child_pid = pid;
                        active.spawned = true;
                    }
                    _ => return Flow::Continue,
                }
                // Lets the manager mark the task running right away.
                self.send_heartbeat(outbound).await;
                Flow::Continue
            }
            Progress::Event(ExecutionEvent::Output { task_id, chunk }) => {
                let message = Message::log(task_id, chunk.stream, chunk.content);
                if outbound.try_send(message).is_err() {
                    debug!("Log message dropped, outbound queue full");
                }
                Flow::Continue
            }
            Progress::Finished(result) => {
                info!(
                    task_id = %result.task_id,
                    success = result.success,
                    error = ?result.error,
                    duration_ms = result.duration_ms,
                    "Task finished"
                );
                self.metrics.record_attempt(result.success, result.duration_ms);
                self.current = None;
                self.status = WorkerStatus::Idle;
                let _ = outbound.send(Message::result(result)).await;

                if self.shutting_down {
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Abort any running task; stop once its result went out.
    fn begin_shutdown(&mut self) -> Flow {
        self.shutting_down = true;
        match &self.current {
            Some(active) => {
                active.cancel.cancel();
                Flow::Continue
            }
            None => Flow::Stop,
        }
    }

    async fn send_heartbeat(&mut self, outbound: &mpsc::Sender<Message>) {
        let child = self.current.as_ref().and_then(|t| t.child_pid);
        let usage = self.sampler.sample(child);

        self.metrics.cpu_percent = usage.cpu_percent;
        self.metrics.memory_mb = usage.memory_mb;
        self.metrics.uptime_secs = self.sampler.uptime_secs();
        self.metrics.last_heartbeat = Some(Utc::now());

        let heartbeat = Heartbeat {
            status: Some(self.status),
            task_id: self
                .current
                .as_ref()
                .filter(|t| t.spawned)
                .map(|t| t.task_id.clone()),
            metrics: Some(self.metrics.clone()),
        };
        let _ = outbound.send(Message::heartbeat(heartbeat)).await;
    }
}
