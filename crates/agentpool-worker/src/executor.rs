//! Task execution in a child process.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentpool_core::{ErrorKind, OutputStream, Task, TaskId, TaskKind, TaskResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent;
use crate::config::WorkerConfig;
use crate::error::{ExecutorError, WorkerError};
use crate::policy::{CommandGuard, EnvPolicy};

/// How long output readers may keep draining after the child exited.
/// Grandchildren that inherited the pipes can hold them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Progress reported while a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The subprocess is running.
    Spawned { task_id: TaskId, pid: Option<u32> },
    /// One line of output.
    Output { task_id: TaskId, chunk: OutputChunk },
}

/// A line of subprocess output, rendered for live streaming.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub content: String,
}

enum Finish {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Runs tasks as isolated child processes.
pub struct TaskExecutor {
    guard: CommandGuard,
    env_policy: EnvPolicy,
    config: WorkerConfig,
}

impl TaskExecutor {
    pub fn new(config: WorkerConfig) -> Result<Self, WorkerError> {
        let guard = CommandGuard::with_defaults(&config.deny_patterns)?;
        Ok(Self {
            guard,
            env_policy: config.env_policy.clone(),
            config,
        })
    }

    /// Run one attempt of `task` to completion.
    ///
    /// Never fails: every outcome, including a blocked command or a spawn
    /// error, is reported as a `TaskResult`. Output lines are offered to
    /// `events` without blocking; the full output is kept in the result.
    pub async fn execute(
        &self,
        task: &Task,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> TaskResult {
        let started = Instant::now();
        match self.run(task, events, cancel).await {
            Ok(result) => result,
            Err(ExecutorError::Blocked(blocked)) => {
                warn!(task_id = %task.id, pattern = %blocked.pattern, "Command blocked by policy");
                TaskResult::blocked(task.id.clone(), &blocked.pattern)
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Task execution failed");
                TaskResult::failure(task.id.clone(), e.kind(), e.to_string())
                    .with_duration_ms(elapsed_ms(started))
            }
        }
    }

    async fn run(
        &self,
        task: &Task,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> Result<TaskResult, ExecutorError> {
        self.guard.check(&task.command_line())?;

        let timeout = self.config.task_timeout(task.timeout_ms);
        let started = Instant::now();
        let mut command = self.build_command(task);
        let mut child = command.spawn().map_err(|source| ExecutorError::Spawn {
            program: task.command.clone(),
            source,
        })?;

        let pid = child.id();
        info!(task_id = %task.id, pid = ?pid, kind = task.kind.as_str(), "Subprocess started");
        let _ = events
            .send(ExecutionEvent::Spawned {
                task_id: task.id.clone(),
                pid,
            })
            .await;

        let render = task.kind == TaskKind::CliAgent;
        let stdout = spawn_reader(
            child.stdout.take(),
            OutputStream::Stdout,
            render,
            task.id.clone(),
            events.clone(),
        );
        let stderr = spawn_reader(
            child.stderr.take(),
            OutputStream::Stderr,
            false,
            task.id.clone(),
            events,
        );

        let finish = tokio::select! {
            status = child.wait() => Finish::Exited(status),
            _ = cancel.cancelled() => Finish::Cancelled,
            _ = tokio::time::sleep(timeout) => Finish::TimedOut,
        };

        if !matches!(finish, Finish::Exited(_)) {
            terminate(&mut child, self.config.abort_grace()).await;
        }

        let stdout = stdout.collect().await;
        let stderr = stderr.collect().await;
        let duration_ms = elapsed_ms(started);

        let (error, exit_code, stderr) = match finish {
            Finish::Exited(Ok(status)) if status.success() => {
                debug!(task_id = %task.id, duration_ms, "Subprocess exited cleanly");
                return Ok(TaskResult::success(
                    task.id.clone(),
                    stdout,
                    stderr,
                    duration_ms,
                ));
            }
            Finish::Exited(Ok(status)) => {
                info!(task_id = %task.id, exit_code = ?status.code(), "Subprocess exited with failure");
                (ErrorKind::ExecutionFailed, status.code(), stderr)
            }
            Finish::Exited(Err(e)) => return Err(ExecutorError::Wait(e)),
            Finish::Cancelled => {
                info!(task_id = %task.id, "Task aborted");
                (ErrorKind::Cancelled, None, stderr)
            }
            Finish::TimedOut => {
                warn!(task_id = %task.id, timeout_ms = timeout.as_millis() as u64, "Task timed out");
                let note = format!("task timed out after {} ms", timeout.as_millis());
                (ErrorKind::Timeout, None, append_line(stderr, &note))
            }
        };

        Ok(TaskResult {
            task_id: task.id.clone(),
            success: false,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            error: Some(error),
        })
    }

    /// Build the child command for a task.
    ///
    /// The parent environment is cleared and only allow-listed variables are
    /// passed on; task overrides are applied on top.
    pub fn build_command(&self, task: &Task) -> Command {
        let mut command = match task.kind {
            TaskKind::Shell => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(task.command_line());
                c
            }
            TaskKind::Script => {
                let mut c = match interpreter_for(&task.command) {
                    Some(interpreter) => {
                        let mut c = Command::new(interpreter);
                        c.arg(&task.command);
                        c
                    }
                    None => Command::new(&task.command),
                };
                c.args(&task.args);
                c
            }
            TaskKind::CliAgent => {
                let mut c = Command::new(&task.command);
                c.args(agent::invocation_args(task));
                c
            }
        };

        let inherited = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
        command.env_clear();
        command.envs(self.env_policy.filter(inherited));
        command.envs(&task.env);

        if let Some(dir) = &task.working_dir {
            command.current_dir(dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches grandchildren too.
        #[cfg(unix)]
        command.process_group(0);

        command
    }
}

/// Interpreter for a script path, chosen by extension.
pub fn interpreter_for(path: &str) -> Option<&'static str> {
    match Path::new(path).extension()?.to_str()? {
        "sh" => Some("sh"),
        "py" => Some("python3"),
        "js" | "mjs" => Some("node"),
        "rb" => Some("ruby"),
        _ => None,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn append_line(mut text: String, line: &str) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}

/// Graceful signal, then a forceful kill once the grace period runs out.
async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };

    if signal_group(pid, "TERM").await {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {
                debug!(pid, "Subprocess exited after SIGTERM");
                // Stragglers in the group still hold the pipes.
                signal_group(pid, "KILL").await;
                return;
            }
            Err(_) => warn!(pid, grace_ms = grace.as_millis() as u64, "Grace period elapsed, killing"),
        }
    }

    signal_group(pid, "KILL").await;
    if let Err(e) = child.kill().await {
        debug!(pid, error = %e, "Kill failed, process already gone");
    }
}

#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) -> bool {
    Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn signal_group(_pid: u32, _signal: &str) -> bool {
    false
}

/// Background reader for one output pipe.
struct StreamReader {
    buffer: Arc<Mutex<String>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    /// Wait for the pipe to close (bounded) and return everything read.
    async fn collect(self) -> String {
        if let Some(mut handle) = self.handle {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                debug!("Output pipe still open after exit, abandoning reader");
                handle.abort();
            }
        }
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buffer)
    }
}

fn spawn_reader<R>(
    pipe: Option<R>,
    stream: OutputStream,
    render: bool,
    task_id: TaskId,
    events: mpsc::Sender<ExecutionEvent>,
) -> StreamReader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(String::new()));
    let handle = pipe.map(|pipe| {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(error = %e, "Output pipe read failed");
                        break;
                    }
                }
                let text = String::from_utf8_lossy(&raw);
                buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_str(&text);

                let line = text.trim_end_matches(['\r', '\n']);
                let content = if render {
                    agent::render_line(line)
                } else {
                    Some(line.to_string())
                };
                if let Some(content) = content {
                    let event = ExecutionEvent::Output {
                        task_id: task_id.clone(),
                        chunk: OutputChunk { stream, content },
                    };
                    // Live streaming is best effort; the buffer keeps everything.
                    if events.try_send(event).is_err() {
                        debug!("Output event dropped, channel full");
                    }
                }
            }
        })
    });
    StreamReader { buffer, handle }
}
