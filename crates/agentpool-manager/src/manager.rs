//! The pool manager.
//!
//! All pool state (workers, queue, task records) is owned by a single actor
//! task. `PoolManager` is a cheap, cloneable handle that talks to it over a
//! command channel, so every mutation is serialized without locks. Worker
//! pipes feed the same actor through an inbound channel, and two timers
//! drive autoscaling and the timeout/deadline sweep.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use agentpool_core::{
    CoreError, ErrorKind, PoolEvent, PoolMetrics, PoolStatus, ScalingAction, ScalingDirection,
    Task, TaskId, TaskOutcome, TaskResult, TaskStatus, TaskTimestamps, WorkerCounts, WorkerId,
    WorkerInfo, WorkerStatus,
};
use agentpool_proto::{Message, Payload};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::health::HealthMonitor;
use crate::history::FinishedTasks;
use crate::launcher::WorkerLauncher;
use crate::queue::TaskQueue;
use crate::scaling::{Autoscaler, ScalingDecision};
use crate::worker::{InboundEvent, WorkerHandle, WorkerInbound};

const COMMAND_BUFFER: usize = 256;
const INBOUND_BUFFER: usize = 1024;

/// How a cancel request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was still queued and has been cancelled.
    Dequeued,
    /// The owning worker was asked to abort; the task ends once it confirms
    /// or the abort deadline passes.
    AbortRequested,
}

/// Returned by `submit`; resolves once the task is terminal.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub async fn wait(self) -> Result<TaskOutcome, PoolError> {
        self.outcome.await.map_err(|_| PoolError::ShuttingDown)
    }
}

enum Command {
    Submit {
        task: Task,
        reply: oneshot::Sender<Result<TaskHandle, PoolError>>,
    },
    Cancel {
        task_id: TaskId,
        reply: oneshot::Sender<Result<CancelOutcome, PoolError>>,
    },
    Status {
        reply: oneshot::Sender<PoolStatus>,
    },
    Workers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    ReportUnresponsive {
        worker_id: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    RequestHeartbeats,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running pool.
#[derive(Clone)]
pub struct PoolManager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PoolEvent>,
}

impl PoolManager {
    /// Validate the config and start the pool (actor, initial workers,
    /// health monitor). Must be called inside a tokio runtime.
    pub fn start(config: PoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Result<Self, PoolError> {
        config.validate()?;

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events, _) = broadcast::channel(config.event_buffer);
        let manager = Self {
            commands,
            events: events.clone(),
        };

        let health_cancel = CancellationToken::new();
        HealthMonitor::new(
            manager.clone(),
            config.health_check_interval(),
            config.missed_heartbeats,
        )
        .spawn(health_cancel.clone());

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let actor = PoolActor {
            autoscaler: Autoscaler::new(&config),
            finished: FinishedTasks::new(config.finished_task_history),
            config,
            launcher,
            workers: BTreeMap::new(),
            retiring: BTreeMap::new(),
            next_worker_seq: 0,
            queue: TaskQueue::new(),
            tasks: HashMap::new(),
            last_scaling_action: None,
            stats: TaskStats::default(),
            events,
            inbound_tx,
            started_at: Instant::now(),
            shutting_down: false,
            health_cancel,
        };
        tokio::spawn(actor.run(commands_rx, inbound_rx));

        Ok(manager)
    }

    /// Queue a task. Returns without waiting for it to run.
    pub async fn submit(&self, task: Task) -> Result<TaskHandle, PoolError> {
        self.request(|reply| Command::Submit { task, reply }).await?
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelOutcome, PoolError> {
        let task_id = task_id.clone();
        self.request(|reply| Command::Cancel { task_id, reply }).await?
    }

    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn metrics(&self) -> Result<PoolMetrics, PoolError> {
        Ok(self.status().await?.metrics)
    }

    /// Subscribe to pool events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Snapshot of every worker, including ones being stopped.
    pub async fn worker_snapshots(&self) -> Result<Vec<WorkerInfo>, PoolError> {
        self.request(|reply| Command::Workers { reply }).await
    }

    /// Mark a worker crashed and replace it. Returns false when the worker
    /// is unknown or already on its way out.
    pub async fn report_unresponsive(&self, worker_id: WorkerId) -> Result<bool, PoolError> {
        self.request(|reply| Command::ReportUnresponsive { worker_id, reply })
            .await
    }

    /// Ask every ready worker for a fresh heartbeat.
    pub async fn request_heartbeats(&self) -> Result<(), PoolError> {
        self.commands
            .send(Command::RequestHeartbeats)
            .await
            .map_err(|_| PoolError::ShuttingDown)
    }

    /// Cancel all tasks, stop all workers and end the manager. Later calls
    /// fail with `PoolError::ShuttingDown`.
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        rx.await.map_err(|_| PoolError::ShuttingDown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Cancelled,
    Timeout,
}

#[derive(Debug, Clone, Copy)]
struct PendingAbort {
    reason: AbortReason,
    deadline: Instant,
}

struct TaskRecord {
    task: Task,
    status: TaskStatus,
    worker: Option<WorkerId>,
    attempts: u32,
    last_result: Option<TaskResult>,
    queued_at: Instant,
    assigned_at: Option<Instant>,
    pending_abort: Option<PendingAbort>,
    waiter: Option<oneshot::Sender<TaskOutcome>>,
}

#[derive(Debug, Default)]
struct TaskStats {
    completed: u64,
    failed: u64,
    cancelled: u64,
    attempts_finished: u64,
    total_duration_ms: u64,
    assignments: u64,
    total_wait_ms: u64,
}

struct PoolActor {
    config: PoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    /// Workers being stopped, kept for status reporting.
    retiring: BTreeMap<WorkerId, WorkerInfo>,
    next_worker_seq: u64,
    queue: TaskQueue,
    /// Tasks that are not yet terminal.
    tasks: HashMap<TaskId, TaskRecord>,
    finished: FinishedTasks,
    autoscaler: Autoscaler,
    last_scaling_action: Option<ScalingAction>,
    stats: TaskStats,
    events: broadcast::Sender<PoolEvent>,
    inbound_tx: mpsc::Sender<WorkerInbound>,
    started_at: Instant,
    shutting_down: bool,
    health_cancel: CancellationToken,
}

impl PoolActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: mpsc::Receiver<WorkerInbound>,
    ) {
        info!(
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            initial_workers = self.config.initial_workers,
            "Pool manager starting"
        );
        for _ in 0..self.config.initial_workers {
            self.launch_worker().await;
        }
        self.ensure_capacity().await;

        let period = self.config.scale_interval();
        let mut scale_tick = tokio::time::interval_at(Instant::now() + period, period);
        scale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick = tokio::time::interval(self.config.sweep_interval());
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown_reply = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => break Some(reply),
                    Some(command) => self.handle_command(command).await,
                    None => break None,
                },
                Some(message) = inbound.recv() => self.handle_inbound(message).await,
                _ = scale_tick.tick() => self.evaluate_scaling().await,
                _ = sweep_tick.tick() => self.sweep().await,
            }
            self.dispatch();
        };

        self.shutdown(&mut inbound).await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        info!("Pool manager stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { task, reply } => {
                let result = self.submit(task);
                let _ = reply.send(result);
                self.ensure_capacity().await;
            }
            Command::Cancel { task_id, reply } => {
                let _ = reply.send(self.cancel(&task_id));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.worker_infos());
            }
            Command::ReportUnresponsive { worker_id, reply } => {
                let replaced = self.report_unresponsive(worker_id).await;
                let _ = reply.send(replaced);
            }
            Command::RequestHeartbeats => {
                for worker in self.workers.values() {
                    if worker.status() != WorkerStatus::Starting {
                        worker.request_heartbeat();
                    }
                }
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn submit(&mut self, mut task: Task) -> Result<TaskHandle, PoolError> {
        if self.shutting_down {
            return Err(PoolError::ShuttingDown);
        }
        if task.id.is_empty() {
            task.id = TaskId::generate();
        }
        task.validate()?;
        if self.is_known(&task.id) {
            return Err(CoreError::DuplicateTask(task.id.to_string()).into());
        }
        if let Some(dep) = task.depends_on.iter().find(|d| !self.is_known(d)) {
            return Err(PoolError::UnknownDependency(dep.clone()));
        }

        task.retry_count = 0;
        task.timestamps = TaskTimestamps::default();
        task.timestamps.mark_created(Utc::now())?;
        self.queue.enqueue(task.clone())?;

        let task_id = task.id.clone();
        let priority = task.priority;
        info!(
            task_id = %task_id,
            kind = task.kind.as_str(),
            priority = priority.as_str(),
            "Task queued"
        );

        let (tx, rx) = oneshot::channel();
        self.tasks.insert(
            task_id.clone(),
            TaskRecord {
                task,
                status: TaskStatus::Queued,
                worker: None,
                attempts: 0,
                last_result: None,
                queued_at: Instant::now(),
                assigned_at: None,
                pending_abort: None,
                waiter: Some(tx),
            },
        );
        self.emit(PoolEvent::TaskQueued {
            task_id: task_id.clone(),
            priority,
            attempt: 1,
        });

        if let Some((dep, status)) = self.failed_dependency(&task_id) {
            self.fail_dependent(&task_id, &dep, status);
        }

        Ok(TaskHandle {
            task_id,
            outcome: rx,
        })
    }

    fn is_known(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id) || self.finished.contains(task_id)
    }

    fn cancel(&mut self, task_id: &TaskId) -> Result<CancelOutcome, PoolError> {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return Err(if self.finished.contains(task_id) {
                PoolError::AlreadyTerminal(task_id.clone())
            } else {
                PoolError::TaskNotFound(task_id.clone())
            });
        };

        if record.status == TaskStatus::Queued {
            self.queue.remove(task_id);
            info!(task_id = %task_id, "Cancelled queued task");
            let result = TaskResult::failure(task_id.clone(), ErrorKind::Cancelled, "cancelled before start");
            self.finalize(task_id, TaskStatus::Cancelled, Some(result), "cancelled");
            return Ok(CancelOutcome::Dequeued);
        }

        // A cancel overrides a pending timeout abort but keeps its deadline.
        if let Some(pending) = record.pending_abort.as_mut() {
            pending.reason = AbortReason::Cancelled;
            return Ok(CancelOutcome::AbortRequested);
        }
        info!(task_id = %task_id, worker_id = ?record.worker, "Aborting running task");
        self.request_abort(task_id, AbortReason::Cancelled);
        Ok(CancelOutcome::AbortRequested)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            metrics: self.metrics(),
            workers: self.worker_infos(),
            last_scaling_action: self.last_scaling_action.clone(),
        }
    }

    fn worker_infos(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .values()
            .map(|w| w.info().clone())
            .chain(self.retiring.values().cloned())
            .collect();
        infos.sort_by_key(|info| info.worker_id);
        infos
    }

    fn worker_counts(&self) -> WorkerCounts {
        let mut counts = WorkerCounts::from_statuses(self.workers.values().map(|w| w.status()));
        for _ in self.retiring.values() {
            counts.add(WorkerStatus::Stopping);
        }
        counts
    }

    fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| w.status().is_live()).count()
    }

    fn metrics(&self) -> PoolMetrics {
        let workers = self.worker_counts();
        let running_tasks = self
            .tasks
            .values()
            .filter(|r| r.status.is_in_flight())
            .count();
        let avg = |total: u64, count: u64| if count == 0 { 0 } else { total / count };

        PoolMetrics {
            workers,
            total_workers: workers.live(),
            queue_depth: self.queue.len(),
            queue_by_priority: self.queue.depths(),
            running_tasks,
            completed_tasks: self.stats.completed,
            failed_tasks: self.stats.failed,
            cancelled_tasks: self.stats.cancelled,
            avg_task_duration_ms: avg(self.stats.total_duration_ms, self.stats.attempts_finished),
            avg_queue_wait_ms: avg(self.stats.total_wait_ms, self.stats.assignments),
            utilization: Autoscaler::utilization(workers.busy, workers.live(), self.queue.len()),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    // ------------------------------------------------------------------
    // Assignment
    // ------------------------------------------------------------------

    /// Match queued tasks to idle workers until either runs out.
    fn dispatch(&mut self) {
        if self.shutting_down {
            return;
        }
        loop {
            if self.queue.is_empty() {
                return;
            }
            // Lowest worker id first.
            let idle: Vec<WorkerId> = self
                .workers
                .values()
                .filter(|w| w.status().can_accept_task())
                .map(|w| w.id())
                .collect();
            let Some(&worker_id) = idle.first() else {
                return;
            };

            let held = self.held_workstreams();
            let (tasks, finished) = (&self.tasks, &self.finished);
            let Some(task) = self
                .queue
                .dequeue_next(idle.len(), |t| is_eligible(t, tasks, finished, &held))
            else {
                return;
            };
            self.assign(task, worker_id);
        }
    }

    /// Workstreams currently bound to a busy worker.
    fn held_workstreams(&self) -> HashSet<String> {
        self.workers
            .values()
            .filter_map(|w| w.current_task())
            .filter_map(|id| self.tasks.get(id))
            .filter_map(|r| r.task.workstream().map(str::to_string))
            .collect()
    }

    fn assign(&mut self, queued: Task, worker_id: WorkerId) {
        let task_id = queued.id;
        let (Some(record), Some(worker)) = (
            self.tasks.get_mut(&task_id),
            self.workers.get_mut(&worker_id),
        ) else {
            return;
        };

        if let Err(e) = record.task.timestamps.mark_assigned(Utc::now()) {
            debug!(task_id = %task_id, error = %e, "Assignment timestamp not recorded");
        }

        match worker.assign(&record.task) {
            Ok(from) => {
                let now = Instant::now();
                record.status = TaskStatus::Assigned;
                record.worker = Some(worker_id);
                record.attempts += 1;
                record.assigned_at = Some(now);
                let attempt = record.task.attempt();
                let waited_ms = now.saturating_duration_since(record.queued_at).as_millis() as u64;

                self.stats.assignments += 1;
                self.stats.total_wait_ms += waited_ms;
                info!(
                    task_id = %task_id,
                    worker_id = %worker_id,
                    attempt,
                    waited_ms,
                    "Assigning task to worker"
                );
                self.emit_status_change(worker_id, from, WorkerStatus::Busy);
                self.emit(PoolEvent::TaskAssigned {
                    task_id,
                    worker_id,
                    attempt,
                });
            }
            Err(e) => {
                warn!(task_id = %task_id, worker_id = %worker_id, error = ?e, "Worker refused task, requeueing");
                record.task.timestamps.clear_assignment();
                let task = record.task.clone();
                let change = worker.set_status(WorkerStatus::Error);
                if let Err(e) = self.queue.push_front(task) {
                    error!(task_id = %task_id, error = %e, "Failed to requeue task");
                }
                if let Some(from) = change {
                    self.emit_status_change(worker_id, from, WorkerStatus::Error);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Worker messages
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, inbound: WorkerInbound) {
        let WorkerInbound { worker_id, event } = inbound;
        match event {
            InboundEvent::Message(message) => self.handle_worker_message(worker_id, message),
            InboundEvent::Malformed(error) => {
                warn!(worker_id = %worker_id, error = %error, "Malformed message from worker");
            }
            InboundEvent::Closed => {
                if self.workers.contains_key(&worker_id) {
                    warn!(worker_id = %worker_id, "Worker process exited unexpectedly");
                    self.lose_worker(worker_id, "process exited");
                    self.replace_worker().await;
                }
            }
            InboundEvent::Stopped { reason } => self.worker_stopped(worker_id, reason),
        }
    }

    fn handle_worker_message(&mut self, worker_id: WorkerId, message: Message) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!(worker_id = %worker_id, kind = message.kind(), "Message from retired worker");
            return;
        };

        match message.payload {
            Payload::Ready(ready) => {
                let change = worker.mark_ready(ready.pid);
                info!(worker_id = %worker_id, pid = ready.pid, "Worker ready");
                self.emit(PoolEvent::WorkerStarted {
                    worker_id,
                    pid: ready.pid,
                });
                if let Some(from) = change {
                    self.emit_status_change(worker_id, from, WorkerStatus::Idle);
                }
            }
            Payload::Heartbeat(heartbeat) => {
                if heartbeat.is_request() {
                    return;
                }
                worker.record_heartbeat(heartbeat.metrics);
                // A worker in error recovers with its next idle report.
                let restored = if heartbeat.status == Some(WorkerStatus::Idle)
                    && worker.status() == WorkerStatus::Error
                    && worker.current_task().is_none()
                {
                    worker.set_status(WorkerStatus::Idle)
                } else {
                    None
                };
                if let Some(task_id) = heartbeat.task_id {
                    self.mark_started(&task_id, worker_id);
                }
                if let Some(from) = restored {
                    info!(worker_id = %worker_id, "Worker recovered");
                    self.emit_status_change(worker_id, from, WorkerStatus::Idle);
                }
            }
            Payload::Log(chunk) => {
                let owned = self
                    .tasks
                    .get(&chunk.task_id)
                    .map(|r| r.worker == Some(worker_id) && !r.status.is_terminal())
                    .unwrap_or(false);
                if owned {
                    self.emit(PoolEvent::TaskOutput {
                        task_id: chunk.task_id,
                        worker_id,
                        stream: chunk.stream,
                        content: chunk.content,
                    });
                }
            }
            Payload::Result(result) => self.handle_result(worker_id, result),
            Payload::Error(fault) => {
                warn!(
                    worker_id = %worker_id,
                    task_id = ?fault.task_id,
                    message = %fault.message,
                    "Worker reported an error"
                );
                let change = if worker.current_task().is_none() {
                    worker.set_status(WorkerStatus::Error)
                } else {
                    None
                };
                self.emit(PoolEvent::WorkerError {
                    worker_id,
                    message: fault.message,
                });
                if let Some(from) = change {
                    self.emit_status_change(worker_id, from, WorkerStatus::Error);
                }
            }
            other => {
                debug!(worker_id = %worker_id, kind = other.kind(), "Ignoring unexpected message from worker");
            }
        }
    }

    fn mark_started(&mut self, task_id: &TaskId, worker_id: WorkerId) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.status != TaskStatus::Assigned || record.worker != Some(worker_id) {
            return;
        }
        record.status = TaskStatus::Running;
        if let Err(e) = record.task.timestamps.mark_started(Utc::now()) {
            debug!(task_id = %task_id, error = %e, "Start timestamp not recorded");
        }
        debug!(task_id = %task_id, worker_id = %worker_id, "Task running");
        self.emit(PoolEvent::TaskStarted {
            task_id: task_id.clone(),
            worker_id,
        });
    }

    fn handle_result(&mut self, worker_id: WorkerId, result: TaskResult) {
        let task_id = result.task_id.clone();

        let mut change = None;
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if worker.current_task() == Some(&task_id) {
                change = worker.finish_task();
            }
        }
        if let Some(from) = change {
            self.emit_status_change(worker_id, from, WorkerStatus::Idle);
        }

        let Some(record) = self.tasks.get_mut(&task_id) else {
            debug!(task_id = %task_id, worker_id = %worker_id, "Result for finished or unknown task");
            return;
        };
        if record.status.is_terminal() || record.worker != Some(worker_id) {
            debug!(task_id = %task_id, worker_id = %worker_id, "Ignoring stale result");
            return;
        }
        let pending = record.pending_abort.take().map(|p| p.reason);

        self.stats.attempts_finished += 1;
        self.stats.total_duration_ms += result.duration_ms;
        self.resolve_attempt(&task_id, result, pending);
    }

    /// Apply the outcome of one attempt: complete, cancel, retry or fail.
    fn resolve_attempt(&mut self, task_id: &TaskId, mut result: TaskResult, pending: Option<AbortReason>) {
        if result.success {
            self.finalize(task_id, TaskStatus::Completed, Some(result), "completed");
            return;
        }
        match pending {
            Some(AbortReason::Cancelled) => {
                result.error = Some(ErrorKind::Cancelled);
                self.finalize(task_id, TaskStatus::Cancelled, Some(result), "cancelled");
            }
            Some(AbortReason::Timeout) => {
                result.error = Some(ErrorKind::Timeout);
                self.retry_or_fail(task_id, result);
            }
            None if result.error == Some(ErrorKind::Cancelled) => {
                self.finalize(task_id, TaskStatus::Cancelled, Some(result), "aborted by worker");
            }
            None => self.retry_or_fail(task_id, result),
        }
    }

    fn retry_or_fail(&mut self, task_id: &TaskId, result: TaskResult) {
        let kind = result.error.unwrap_or(ErrorKind::ExecutionFailed);
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };

        if kind.is_retryable() && record.task.can_retry() && !self.shutting_down {
            record.task.retry_count += 1;
            record.task.timestamps.clear_assignment();
            record.status = TaskStatus::Queued;
            record.worker = None;
            record.assigned_at = None;
            record.queued_at = Instant::now();
            record.last_result = Some(result);
            let task = record.task.clone();
            let attempt = task.attempt();
            let priority = task.priority;

            info!(task_id = %task_id, attempt, error = %kind, "Retrying task");
            if let Err(e) = self.queue.enqueue(task) {
                error!(task_id = %task_id, error = %e, "Failed to requeue task");
            }
            self.emit(PoolEvent::TaskQueued {
                task_id: task_id.clone(),
                priority,
                attempt,
            });
        } else {
            let status = if kind == ErrorKind::Timeout {
                TaskStatus::Timeout
            } else {
                TaskStatus::Failed
            };
            self.finalize(task_id, status, Some(result), kind.as_str());
        }
    }

    /// Move a task to a terminal state, notify its waiter and drop its
    /// record. Only the final status is remembered.
    fn finalize(&mut self, task_id: &TaskId, status: TaskStatus, result: Option<TaskResult>, reason: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        record.status = status;
        record.worker = None;
        record.assigned_at = None;
        record.pending_abort = None;
        if let Err(e) = record.task.timestamps.mark_completed(Utc::now()) {
            debug!(task_id = %task_id, error = %e, "Completion timestamp not recorded");
        }
        if result.is_some() {
            record.last_result = result;
        }

        let outcome = TaskOutcome {
            task_id: task_id.clone(),
            status,
            result: record.last_result.clone(),
            attempts: record.attempts,
        };
        if let Some(waiter) = record.waiter.take() {
            let _ = waiter.send(outcome.clone());
        }

        match status {
            TaskStatus::Completed => {
                self.stats.completed += 1;
                info!(task_id = %task_id, attempts = outcome.attempts, "Task completed");
                let result = outcome
                    .result
                    .unwrap_or_else(|| TaskResult::success(task_id.clone(), String::new(), String::new(), 0));
                self.emit(PoolEvent::TaskCompleted {
                    task_id: task_id.clone(),
                    result,
                });
            }
            TaskStatus::Cancelled => {
                self.stats.cancelled += 1;
                info!(task_id = %task_id, reason, "Task cancelled");
                self.emit(PoolEvent::TaskCancelled {
                    task_id: task_id.clone(),
                    reason: reason.to_string(),
                });
            }
            _ => {
                self.stats.failed += 1;
                warn!(
                    task_id = %task_id,
                    status = %status,
                    error = ?outcome.error_kind(),
                    attempts = outcome.attempts,
                    "Task failed"
                );
                self.emit(PoolEvent::TaskFailed {
                    task_id: task_id.clone(),
                    status,
                    error: outcome.error_kind(),
                    attempts: outcome.attempts,
                    result: outcome.result,
                });
            }
        }

        self.tasks.remove(task_id);
        self.finished.record(task_id.clone(), status);

        if status != TaskStatus::Completed {
            self.fail_dependents(task_id, status);
        }
    }

    /// First dependency of `task_id` that ended in anything but success.
    fn failed_dependency(&self, task_id: &TaskId) -> Option<(TaskId, TaskStatus)> {
        let record = self.tasks.get(task_id)?;
        record.task.depends_on.iter().find_map(|dep| {
            let status = self.finished.status(dep)?;
            (status != TaskStatus::Completed).then(|| (dep.clone(), status))
        })
    }

    fn fail_dependents(&mut self, dep: &TaskId, status: TaskStatus) {
        let dependents: Vec<TaskId> = self
            .queue
            .iter()
            .filter(|t| t.depends_on.contains(dep))
            .map(|t| t.id.clone())
            .collect();
        for task_id in dependents {
            self.fail_dependent(&task_id, dep, status);
        }
    }

    fn fail_dependent(&mut self, task_id: &TaskId, dep: &TaskId, status: TaskStatus) {
        self.queue.remove(task_id);
        let result = TaskResult::failure(
            task_id.clone(),
            ErrorKind::DependencyFailed,
            format!("dependency {} ended {}", dep, status),
        );
        self.finalize(task_id, TaskStatus::Failed, Some(result), "dependency failed");
    }

    // ------------------------------------------------------------------
    // Aborts, timeouts and lost workers
    // ------------------------------------------------------------------

    fn request_abort(&mut self, task_id: &TaskId, reason: AbortReason) -> bool {
        let deadline = Instant::now() + self.config.abort_deadline();
        let Some(record) = self.tasks.get_mut(task_id) else {
            return false;
        };
        let Some(worker_id) = record.worker else {
            return false;
        };
        record.pending_abort = Some(PendingAbort { reason, deadline });
        // If the abort cannot be delivered the deadline still catches it.
        self.workers
            .get(&worker_id)
            .map(|w| w.abort(task_id))
            .unwrap_or(false)
    }

    /// Periodic checks: task timeouts, abort deadlines and start timeouts.
    async fn sweep(&mut self) {
        if self.shutting_down {
            return;
        }
        let now = Instant::now();
        let default_timeout = self.config.default_task_timeout();

        let overdue: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.status.is_in_flight() && r.pending_abort.is_none())
            .filter(|r| {
                r.assigned_at
                    .map(|at| now.saturating_duration_since(at) > r.task.timeout_or(default_timeout))
                    .unwrap_or(false)
            })
            .map(|r| r.task.id.clone())
            .collect();
        for task_id in overdue {
            warn!(task_id = %task_id, "Task exceeded its timeout, aborting");
            self.request_abort(&task_id, AbortReason::Timeout);
        }

        let expired: Vec<(TaskId, WorkerId)> = self
            .tasks
            .values()
            .filter(|r| r.pending_abort.map(|p| p.deadline <= now).unwrap_or(false))
            .filter_map(|r| r.worker.map(|w| (r.task.id.clone(), w)))
            .collect();
        for (task_id, worker_id) in expired {
            warn!(task_id = %task_id, worker_id = %worker_id, "Abort not confirmed in time, killing worker");
            self.lose_worker(worker_id, "abort deadline passed");
            self.replace_worker().await;
        }

        let start_timeout = self.config.worker_start_timeout();
        let stuck: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.status() == WorkerStatus::Starting)
            .filter(|w| now.saturating_duration_since(w.launched_at()) > start_timeout)
            .map(|w| w.id())
            .collect();
        for worker_id in stuck {
            warn!(worker_id = %worker_id, "Worker did not become ready in time");
            self.emit(PoolEvent::WorkerError {
                worker_id,
                message: format!(
                    "worker did not become ready within {} ms",
                    start_timeout.as_millis()
                ),
            });
            self.lose_worker(worker_id, "start timeout");
            self.replace_worker().await;
        }
    }

    async fn report_unresponsive(&mut self, worker_id: WorkerId) -> bool {
        let live = self
            .workers
            .get(&worker_id)
            .map(|w| w.status().is_live())
            .unwrap_or(false);
        if !live || self.shutting_down {
            return false;
        }
        self.emit(PoolEvent::WorkerError {
            worker_id,
            message: "missed heartbeats".to_string(),
        });
        self.lose_worker(worker_id, "unresponsive");
        self.replace_worker().await;
        true
    }

    /// Drop a worker that died or must be killed. Its in-flight task is
    /// resolved as a crash (or per its pending abort).
    fn lose_worker(&mut self, worker_id: WorkerId, reason: &str) {
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return;
        };

        let task_id = worker.take_task();
        if task_id.is_some() {
            if let Some(from) = worker.set_status(WorkerStatus::Crashed) {
                self.emit_status_change(worker_id, from, WorkerStatus::Crashed);
            }
        }
        if let Some(task_id) = task_id {
            self.crash_task(&task_id, worker_id, reason);
        }

        info!(worker_id = %worker_id, reason, "Worker removed");
        self.emit(PoolEvent::WorkerStopped {
            worker_id,
            reason: reason.to_string(),
        });
        // Also reaps a process that already exited.
        tokio::spawn(worker.kill());
    }

    fn crash_task(&mut self, task_id: &TaskId, worker_id: WorkerId, reason: &str) {
        let Some(record) = self.tasks.get_mut(task_id) else {
            return;
        };
        if record.status.is_terminal() || record.worker != Some(worker_id) {
            return;
        }
        let pending = record.pending_abort.take().map(|p| p.reason);
        let result = TaskResult::failure(
            task_id.clone(),
            ErrorKind::WorkerCrashed,
            format!("{} lost: {}", worker_id, reason),
        );
        self.stats.attempts_finished += 1;
        self.resolve_attempt(task_id, result, pending);
    }

    // ------------------------------------------------------------------
    // Worker lifecycle and scaling
    // ------------------------------------------------------------------

    async fn launch_worker(&mut self) -> Option<WorkerId> {
        if self.shutting_down {
            return None;
        }
        self.next_worker_seq += 1;
        let worker_id = WorkerId::new(self.next_worker_seq);

        match self.launcher.launch(worker_id).await {
            Ok(launched) => {
                let handle = WorkerHandle::spawn(worker_id, launched, self.inbound_tx.clone());
                info!(worker_id = %worker_id, "Worker launched");
                self.workers.insert(worker_id, handle);
                Some(worker_id)
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Failed to launch worker");
                self.emit(PoolEvent::WorkerError {
                    worker_id,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    /// Maintenance replacement after a worker was lost.
    async fn replace_worker(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.live_workers() < self.config.max_workers {
            self.launch_worker().await;
        }
        self.ensure_capacity().await;
    }

    /// Keep at least `min_workers` live, and at least one while work is
    /// queued. With no worker obtainable, queued work cannot run.
    async fn ensure_capacity(&mut self) {
        if self.shutting_down {
            return;
        }
        let live = self.live_workers();
        for _ in live..self.config.min_workers {
            self.launch_worker().await;
        }
        if self.live_workers() > 0 || self.queue.is_empty() {
            return;
        }

        self.launch_worker().await;
        if self.live_workers() > 0 {
            return;
        }
        error!(queued = self.queue.len(), "No worker could be started, failing queued tasks");
        for task in self.queue.drain() {
            let result = TaskResult::failure(
                task.id.clone(),
                ErrorKind::WorkerStartFailed,
                "no worker could be started",
            );
            self.finalize(&task.id, TaskStatus::Failed, Some(result), "worker start failed");
        }
    }

    async fn evaluate_scaling(&mut self) {
        if self.shutting_down {
            return;
        }
        self.ensure_capacity().await;

        let counts = self.worker_counts();
        let (busy, total, depth) = (counts.busy, counts.live(), self.queue.len());
        let utilization = Autoscaler::utilization(busy, total, depth);
        let now = Instant::now();

        match self.autoscaler.evaluate(busy, total, depth, now) {
            ScalingDecision::Hold => {}
            ScalingDecision::ScaleUp(count) => {
                let mut added = 0;
                for _ in 0..count {
                    if self.launch_worker().await.is_some() {
                        added += 1;
                    }
                }
                if added > 0 {
                    self.record_scaling(ScalingDirection::Up, total, total + added, utilization, now);
                }
            }
            ScalingDecision::ScaleDown(count) => {
                // Highest ids first; never a busy worker.
                let victims: Vec<WorkerId> = self
                    .workers
                    .values()
                    .rev()
                    .filter(|w| w.status() == WorkerStatus::Idle)
                    .take(count)
                    .map(|w| w.id())
                    .collect();
                for worker_id in &victims {
                    self.stop_worker(*worker_id, "scaled down");
                }
                if !victims.is_empty() {
                    self.record_scaling(
                        ScalingDirection::Down,
                        total,
                        total - victims.len(),
                        utilization,
                        now,
                    );
                }
            }
        }

        self.emit(PoolEvent::PoolStatus {
            metrics: self.metrics(),
        });
    }

    fn record_scaling(
        &mut self,
        direction: ScalingDirection,
        from: usize,
        to: usize,
        utilization: f64,
        now: Instant,
    ) {
        self.autoscaler.record_action(now);
        let action = ScalingAction {
            direction,
            from,
            to,
            utilization,
            at: Utc::now(),
        };
        info!(direction = ?direction, from, to, utilization, "Pool scaled");
        self.last_scaling_action = Some(action.clone());
        self.emit(PoolEvent::PoolScaled { action });
    }

    /// Graceful stop, run off the actor loop. `worker.stopped` follows once
    /// the process is gone.
    fn stop_worker(&mut self, worker_id: WorkerId, reason: &str) -> Option<JoinHandle<()>> {
        let mut worker = self.workers.remove(&worker_id)?;
        let change = worker.set_status(WorkerStatus::Stopping);
        self.retiring.insert(worker_id, worker.info().clone());
        if let Some(from) = change {
            self.emit_status_change(worker_id, from, WorkerStatus::Stopping);
        }
        info!(worker_id = %worker_id, reason, "Stopping worker");

        let timeout = self.config.worker_stop_timeout();
        let inbound = self.inbound_tx.clone();
        let reason = reason.to_string();
        Some(tokio::spawn(async move {
            worker.shutdown(timeout).await;
            let _ = inbound
                .send(WorkerInbound {
                    worker_id,
                    event: InboundEvent::Stopped { reason },
                })
                .await;
        }))
    }

    fn worker_stopped(&mut self, worker_id: WorkerId, reason: String) {
        if self.retiring.remove(&worker_id).is_some() {
            info!(worker_id = %worker_id, reason = %reason, "Worker stopped");
            self.emit(PoolEvent::WorkerStopped { worker_id, reason });
        }
    }

    async fn shutdown(&mut self, inbound: &mut mpsc::Receiver<WorkerInbound>) {
        info!(
            queued = self.queue.len(),
            workers = self.workers.len(),
            finished = self.finished.len(),
            "Shutting down pool"
        );
        self.shutting_down = true;
        self.health_cancel.cancel();

        for task in self.queue.drain() {
            let result = TaskResult::failure(task.id.clone(), ErrorKind::Cancelled, "pool shut down");
            self.finalize(&task.id, TaskStatus::Cancelled, Some(result), "pool shutdown");
        }
        let in_flight: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|r| r.status.is_in_flight())
            .map(|r| r.task.id.clone())
            .collect();
        for task_id in in_flight {
            let result = TaskResult::failure(task_id.clone(), ErrorKind::Cancelled, "pool shut down");
            self.finalize(&task_id, TaskStatus::Cancelled, Some(result), "pool shutdown");
        }

        let worker_ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        let stops: Vec<JoinHandle<()>> = worker_ids
            .into_iter()
            .filter_map(|id| self.stop_worker(id, "pool shutdown"))
            .collect();
        let all_stopped = async move {
            for stop in stops {
                if let Err(e) = stop.await {
                    warn!(error = %e, "Worker stop task failed");
                }
            }
        };
        tokio::pin!(all_stopped);

        // Stop tasks report through `inbound`, and readers of still-running
        // workers keep filling it, so it must be read until every stop ends.
        loop {
            tokio::select! {
                _ = &mut all_stopped => break,
                Some(message) = inbound.recv() => self.shutdown_inbound(message),
            }
        }
        while let Ok(message) = inbound.try_recv() {
            self.shutdown_inbound(message);
        }
    }

    /// Everything but stop reports is dropped once shutdown began.
    fn shutdown_inbound(&mut self, message: WorkerInbound) {
        if let InboundEvent::Stopped { reason } = message.event {
            self.worker_stopped(message.worker_id, reason);
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_status_change(&self, worker_id: WorkerId, from: WorkerStatus, to: WorkerStatus) {
        debug!(worker_id = %worker_id, from = %from, to = %to, "Worker status changed");
        self.emit(PoolEvent::WorkerStatusChanged { worker_id, from, to });
    }
}

/// Dependencies complete and workstream free.
fn is_eligible(
    task: &Task,
    tasks: &HashMap<TaskId, TaskRecord>,
    finished: &FinishedTasks,
    held: &HashSet<String>,
) -> bool {
    let deps_done = task.depends_on.iter().all(|dep| {
        if tasks.contains_key(dep) {
            return false;
        }
        // A dependency that failed has already failed its queued dependents,
        // so one no longer remembered must have completed.
        finished
            .status(dep)
            .map(|status| status == TaskStatus::Completed)
            .unwrap_or(true)
    });
    let stream_free = task.workstream().map(|ws| !held.contains(ws)).unwrap_or(true);
    deps_done && stream_free
}
