//! Protocol message types.

use agentpool_core::{
    MessageId, OutputStream, Task, TaskId, TaskResult, WorkerMetrics, WorkerStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope carried on every line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

/// The closed set of message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// manager -> worker: run this task.
    Task(Task),
    /// worker -> manager: outcome of the current attempt.
    Result(TaskResult),
    /// Either direction: an empty heartbeat is a request, a filled one a report.
    Heartbeat(Heartbeat),
    /// worker -> manager: streaming output.
    Log(LogChunk),
    /// worker -> manager: uncaught failure inside the worker.
    Error(WorkerFault),
    /// manager -> worker: shutdown or abort.
    Control(ControlCommand),
    /// worker -> manager: sent once at startup.
    Ready(Ready),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Result(_) => "result",
            Self::Heartbeat(_) => "heartbeat",
            Self::Log(_) => "log",
            Self::Error(_) => "error",
            Self::Control(_) => "control",
            Self::Ready(_) => "ready",
        }
    }
}

/// Liveness and metrics report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: Option<WorkerStatus>,
    /// Task the worker is running, set once its subprocess spawned.
    pub task_id: Option<TaskId>,
    pub metrics: Option<WorkerMetrics>,
}

impl Heartbeat {
    /// A manager-side request for a fresh report.
    pub fn request() -> Self {
        Self::default()
    }

    pub fn is_request(&self) -> bool {
        self.status.is_none() && self.metrics.is_none()
    }
}

/// A chunk of subprocess output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogChunk {
    pub task_id: TaskId,
    pub stream: OutputStream,
    pub content: String,
}

/// An uncaught failure reported by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerFault {
    pub message: String,
    /// Task that was active when the failure happened.
    pub task_id: Option<TaskId>,
}

/// Commands the manager sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Stop after aborting any running task.
    Shutdown,
    /// Abort the running task if it matches.
    Abort { task_id: TaskId },
}

/// Startup announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ready {
    pub pid: u32,
}

impl Message {
    /// Wrap a payload in a fresh envelope.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: MessageId::generate(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn task(task: Task) -> Self {
        Self::new(Payload::Task(task))
    }

    pub fn result(result: TaskResult) -> Self {
        Self::new(Payload::Result(result))
    }

    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        Self::new(Payload::Heartbeat(heartbeat))
    }

    pub fn log(task_id: TaskId, stream: OutputStream, content: impl Into<String>) -> Self {
        Self::new(Payload::Log(LogChunk {
            task_id,
            stream,
            content: content.into(),
        }))
    }

    pub fn error(message: impl Into<String>, task_id: Option<TaskId>) -> Self {
        Self::new(Payload::Error(WorkerFault {
            message: message.into(),
            task_id,
        }))
    }

    pub fn control(command: ControlCommand) -> Self {
        Self::new(Payload::Control(command))
    }

    pub fn ready(pid: u32) -> Self {
        Self::new(Payload::Ready(Ready { pid }))
    }

    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = Message::control(ControlCommand::Abort {
            task_id: TaskId::new("t-9"),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["kind"], "control");
        assert_eq!(json["payload"]["data"]["action"], "abort");
        assert_eq!(json["payload"]["data"]["task_id"], "t-9");
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_heartbeat_request_vs_report() {
        assert!(Heartbeat::request().is_request());
        let report = Heartbeat {
            status: Some(WorkerStatus::Idle),
            task_id: None,
            metrics: Some(WorkerMetrics::default()),
        };
        assert!(!report.is_request());
    }
}
