//! Manager-side handle for one worker process.

use std::time::Duration;

use agentpool_core::{Task, TaskId, WorkerId, WorkerInfo, WorkerMetrics, WorkerStatus};
use agentpool_proto::{ControlCommand, Heartbeat, Message, MessageReader, MessageWriter, ProtoError};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::launcher::{LaunchedWorker, ProcessControl};

const OUTBOUND_BUFFER: usize = 64;

/// Something a worker's pipe produced, tagged with the worker.
#[derive(Debug)]
pub struct WorkerInbound {
    pub worker_id: WorkerId,
    pub event: InboundEvent,
}

#[derive(Debug)]
pub enum InboundEvent {
    Message(Message),
    /// A line that did not decode.
    Malformed(String),
    /// The worker's stdout closed: the process is gone.
    Closed,
    /// A stop started by the manager finished.
    Stopped { reason: String },
}

/// Why a message could not be handed to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignError {
    NotIdle(WorkerStatus),
    ChannelClosed,
}

/// The manager's view of one worker and sole owner of its process.
pub struct WorkerHandle {
    info: WorkerInfo,
    outbound: mpsc::Sender<Message>,
    control: Box<dyn ProcessControl>,
    reader: JoinHandle<()>,
    launched_at: Instant,
}

impl WorkerHandle {
    /// Wire a launched worker's pipes into the manager.
    pub fn spawn(
        worker_id: WorkerId,
        launched: LaunchedWorker,
        inbound: mpsc::Sender<WorkerInbound>,
    ) -> Self {
        let LaunchedWorker {
            stdin,
            stdout,
            control,
        } = launched;

        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        tokio::spawn(async move {
            let mut writer = MessageWriter::new(stdin);
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = writer.send(&message).await {
                    debug!(worker_id = %worker_id, error = %e, "Worker stdin closed");
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut reader = MessageReader::new(stdout);
            loop {
                let event = match reader.next_message().await {
                    Ok(Some(message)) => InboundEvent::Message(message),
                    Ok(None) => InboundEvent::Closed,
                    Err(ProtoError::Malformed(e)) => InboundEvent::Malformed(e.to_string()),
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Worker stdout failed");
                        InboundEvent::Closed
                    }
                };
                let closed = matches!(event, InboundEvent::Closed);
                if inbound.send(WorkerInbound { worker_id, event }).await.is_err() || closed {
                    break;
                }
            }
        });

        Self {
            info: WorkerInfo::new(worker_id),
            outbound,
            control,
            reader,
            launched_at: Instant::now(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.info.worker_id
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn status(&self) -> WorkerStatus {
        self.info.status
    }

    pub fn current_task(&self) -> Option<&TaskId> {
        self.info.current_task.as_ref()
    }

    pub fn launched_at(&self) -> Instant {
        self.launched_at
    }

    /// Move to `to`; returns the previous status when something changed.
    pub fn set_status(&mut self, to: WorkerStatus) -> Option<WorkerStatus> {
        let from = self.info.status;
        if from == to {
            return None;
        }
        if !from.can_transition_to(to) {
            warn!(worker_id = %self.id(), from = %from, to = %to, "Ignoring invalid worker transition");
            return None;
        }
        self.info.status = to;
        self.info.last_activity = Utc::now();
        Some(from)
    }

    pub fn mark_ready(&mut self, pid: u32) -> Option<WorkerStatus> {
        self.info.pid = Some(pid);
        self.info.metrics.last_heartbeat = Some(Utc::now());
        self.set_status(WorkerStatus::Idle)
    }

    /// Record a heartbeat report. The manager's clock is authoritative.
    pub fn record_heartbeat(&mut self, metrics: Option<WorkerMetrics>) {
        let now = Utc::now();
        if let Some(metrics) = metrics {
            self.info.metrics = metrics;
        }
        self.info.metrics.last_heartbeat = Some(now);
        self.info.last_activity = now;
    }

    /// Hand a task to the worker. Only legal while idle; returns at once.
    pub fn assign(&mut self, task: &Task) -> Result<WorkerStatus, AssignError> {
        if !self.status().can_accept_task() {
            return Err(AssignError::NotIdle(self.status()));
        }
        self.outbound
            .try_send(Message::task(task.clone()))
            .map_err(|_| AssignError::ChannelClosed)?;
        self.info.current_task = Some(task.id.clone());
        let from = self.info.status;
        self.info.status = WorkerStatus::Busy;
        self.info.last_activity = Utc::now();
        Ok(from)
    }

    /// Clear the current task after its result arrived.
    pub fn finish_task(&mut self) -> Option<WorkerStatus> {
        self.info.current_task = None;
        if self.status() == WorkerStatus::Busy {
            self.set_status(WorkerStatus::Idle)
        } else {
            None
        }
    }

    /// Take the current task away, e.g. when the worker is lost.
    pub fn take_task(&mut self) -> Option<TaskId> {
        self.info.current_task.take()
    }

    /// Ask the worker to abort `task_id` if it is the one running.
    pub fn abort(&self, task_id: &TaskId) -> bool {
        if self.current_task() != Some(task_id) {
            return false;
        }
        self.send(Message::control(ControlCommand::Abort {
            task_id: task_id.clone(),
        }))
    }

    pub fn request_heartbeat(&self) -> bool {
        self.send(Message::heartbeat(Heartbeat::request()))
    }

    fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                debug!(worker_id = %self.id(), error = %e, "Could not queue message for worker");
                false
            }
        }
    }

    /// Graceful stop: `shutdown`, then a kill if the worker outlives `timeout`.
    pub async fn shutdown(mut self, timeout: Duration) {
        let worker_id = self.id();
        let _ = self
            .outbound
            .send(Message::control(ControlCommand::Shutdown))
            .await;
        if !self.control.wait_exit(timeout).await {
            warn!(worker_id = %worker_id, timeout_ms = timeout.as_millis() as u64, "Worker did not stop in time, killing");
            self.control.kill().await;
        }
        self.reader.abort();
    }

    /// Forceful stop.
    pub async fn kill(mut self) {
        self.control.kill().await;
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::duplex;

    struct NoopControl;

    #[async_trait]
    impl ProcessControl for NoopControl {
        fn id(&self) -> Option<u32> {
            None
        }
        async fn wait_exit(&mut self, _timeout: Duration) -> bool {
            true
        }
        async fn kill(&mut self) {}
    }

    fn handle() -> (WorkerHandle, MessageReader<tokio::io::DuplexStream>) {
        let (stdin, worker_reads) = duplex(64 * 1024);
        let (_worker_writes, stdout) = duplex(1024);
        let (inbound, _rx) = mpsc::channel(8);
        let handle = WorkerHandle::spawn(
            WorkerId::new(1),
            LaunchedWorker {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                control: Box::new(NoopControl),
            },
            inbound,
        );
        (handle, MessageReader::new(worker_reads))
    }

    #[tokio::test]
    async fn test_assign_requires_idle() {
        let (mut worker, mut wire) = handle();
        let task = Task::shell("echo hi").with_id("t1");

        assert_eq!(
            worker.assign(&task),
            Err(AssignError::NotIdle(WorkerStatus::Starting))
        );

        assert_eq!(worker.mark_ready(42), Some(WorkerStatus::Starting));
        assert_eq!(worker.assign(&task), Ok(WorkerStatus::Idle));
        assert_eq!(worker.status(), WorkerStatus::Busy);
        assert_eq!(worker.current_task(), Some(&TaskId::new("t1")));

        // Never two tasks at once.
        let other = Task::shell("echo other").with_id("t2");
        assert_eq!(
            worker.assign(&other),
            Err(AssignError::NotIdle(WorkerStatus::Busy))
        );

        let sent = wire.next_message().await.unwrap().unwrap();
        assert_eq!(sent.kind(), "task");
    }

    #[tokio::test]
    async fn test_abort_only_matching_task() {
        let (mut worker, mut wire) = handle();
        worker.mark_ready(1);
        worker.assign(&Task::shell("sleep 1").with_id("t1")).unwrap();
        let _ = wire.next_message().await.unwrap();

        assert!(!worker.abort(&TaskId::new("other")));
        assert!(worker.abort(&TaskId::new("t1")));
        let sent = wire.next_message().await.unwrap().unwrap();
        assert_eq!(
            sent.payload,
            agentpool_proto::Payload::Control(ControlCommand::Abort {
                task_id: TaskId::new("t1")
            })
        );

        assert_eq!(worker.finish_task(), Some(WorkerStatus::Busy));
        assert_eq!(worker.status(), WorkerStatus::Idle);
        assert!(worker.current_task().is_none());
    }

    #[tokio::test]
    async fn test_invalid_transition_ignored() {
        let (mut worker, _wire) = handle();
        assert!(worker.set_status(WorkerStatus::Busy).is_none());
        assert_eq!(worker.status(), WorkerStatus::Starting);
        assert_eq!(
            worker.set_status(WorkerStatus::Stopping),
            Some(WorkerStatus::Starting)
        );
    }
}
