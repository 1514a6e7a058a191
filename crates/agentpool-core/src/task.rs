//! Task descriptor and lifecycle timestamps.

use crate::{CoreError, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Payload key binding a task to a workstream (at most one in flight per value).
pub const WORKSTREAM_KEY: &str = "workstream";

/// What kind of process a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    /// A command line run through `sh -c`.
    Shell,
    /// A script file, interpreter picked by extension.
    Script,
    /// An agent CLI invocation (e.g. `claude --print <prompt>`).
    CliAgent,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Script => "script",
            Self::CliAgent => "cli-agent",
        }
    }
}

/// Scheduling priority; `High` is served first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
    Background,
}

impl TaskPriority {
    /// All tiers, highest first.
    pub const ALL: [TaskPriority; 4] = [Self::High, Self::Medium, Self::Low, Self::Background];

    /// Position of this tier in [`TaskPriority::ALL`]; 0 is served first.
    pub fn rank(&self) -> usize {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
            Self::Background => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Background => "background",
        }
    }
}

impl Ord for TaskPriority {
    fn cmp(&self, other: &Self) -> Ordering {
        other.rank().cmp(&self.rank())
    }
}

impl PartialOrd for TaskPriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Lifecycle timestamps. Each is written at most once per attempt and
/// never earlier than the one before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimestamps {
    pub created_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskTimestamps {
    pub fn mark_created(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        if self.created_at.is_some() {
            return Err(already_set("created_at"));
        }
        self.created_at = Some(at);
        Ok(())
    }

    pub fn mark_assigned(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        let created = self.created_at.ok_or_else(|| missing("assigned_at", "created_at"))?;
        if self.assigned_at.is_some() {
            return Err(already_set("assigned_at"));
        }
        self.assigned_at = Some(at.max(created));
        Ok(())
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        let assigned = self.assigned_at.ok_or_else(|| missing("started_at", "assigned_at"))?;
        if self.started_at.is_some() {
            return Err(already_set("started_at"));
        }
        self.started_at = Some(at.max(assigned));
        Ok(())
    }

    pub fn mark_completed(&mut self, at: DateTime<Utc>) -> Result<(), CoreError> {
        if self.completed_at.is_some() {
            return Err(already_set("completed_at"));
        }
        let floor = self
            .started_at
            .or(self.assigned_at)
            .or(self.created_at)
            .unwrap_or(at);
        self.completed_at = Some(at.max(floor));
        Ok(())
    }

    /// Forget the per-attempt timestamps before a task is re-queued.
    pub fn clear_assignment(&mut self) {
        self.assigned_at = None;
        self.started_at = None;
    }
}

fn already_set(field: &'static str) -> CoreError {
    CoreError::TimestampOrder {
        field,
        reason: "was already written".to_string(),
    }
}

fn missing(field: &'static str, prerequisite: &str) -> CoreError {
    CoreError::TimestampOrder {
        field,
        reason: format!("written before {}", prerequisite),
    }
}

/// A unit of work executed by exactly one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier; generated at submit time when empty.
    #[serde(default)]
    pub id: TaskId,

    pub kind: TaskKind,

    #[serde(default)]
    pub priority: TaskPriority,

    /// Program, script path or command line, depending on `kind`.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides applied on top of the filtered parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Per-task timeout; the pool default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub max_retries: u32,

    /// Opaque extension data (`workstream`, `prompt`, `model`, ...).
    #[serde(default)]
    pub payload: HashMap<String, String>,

    /// Tasks that must complete before this one becomes eligible.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,

    #[serde(default)]
    pub timestamps: TaskTimestamps,
}

impl Task {
    /// Create a new Task of the given kind.
    pub fn new(kind: TaskKind, command: impl Into<String>) -> Self {
        Self {
            id: TaskId::generate(),
            kind,
            priority: TaskPriority::default(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_ms: None,
            retry_count: 0,
            max_retries: 0,
            payload: HashMap::new(),
            depends_on: Vec::new(),
            timestamps: TaskTimestamps::default(),
        }
    }

    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(TaskKind::Shell, command)
    }

    pub fn script(path: impl Into<String>) -> Self {
        Self::new(TaskKind::Script, path)
    }

    pub fn cli_agent(program: impl Into<String>) -> Self {
        Self::new(TaskKind::CliAgent, program)
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_workstream(self, workstream: impl Into<String>) -> Self {
        self.with_payload(WORKSTREAM_KEY, workstream)
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// The full command line the deny-list is checked against.
    pub fn command_line(&self) -> String {
        let mut line = self.command.trim().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Effective timeout given the pool default.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    /// Workstream this task is bound to, if any.
    pub fn workstream(&self) -> Option<&str> {
        self.payload
            .get(WORKSTREAM_KEY)
            .map(String::as_str)
            .filter(|w| !w.is_empty())
    }

    /// 1-based number of the current execution attempt.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Boundary validation, run once at submit time.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.command.trim().is_empty() {
            return Err(CoreError::InvalidTask("command must not be empty".into()));
        }
        if self.timeout_ms == Some(0) {
            return Err(CoreError::InvalidTask("timeout must be greater than zero".into()));
        }
        if let Some(dir) = &self.working_dir {
            if dir.as_os_str().is_empty() {
                return Err(CoreError::InvalidTask("working directory must not be empty".into()));
            }
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(CoreError::InvalidTask(format!(
                "invalid environment variable name: '{}'",
                key
            )));
        }
        if self.depends_on.iter().any(|dep| *dep == self.id) {
            return Err(CoreError::InvalidTask("task cannot depend on itself".into()));
        }
        Ok(())
    }
}
