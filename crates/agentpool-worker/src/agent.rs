//! Agent CLI invocation and stream-json output rendering.
//!
//! Agent CLIs such as Claude Code print one JSON message per line when run
//! with `--output-format=stream-json`. The worker renders the interesting
//! ones (assistant text, final result) for live log streaming; the raw
//! stdout is still captured verbatim.

use agentpool_core::Task;
use serde::Deserialize;
use serde_json::Value;

/// Payload key holding the agent prompt.
pub const PROMPT_KEY: &str = "prompt";
/// Payload key selecting a model.
pub const MODEL_KEY: &str = "model";

/// Arguments for a `cli-agent` task.
///
/// Task args come first; when the payload carries a prompt the one-shot
/// streaming flags are appended.
pub fn invocation_args(task: &Task) -> Vec<String> {
    let mut args = task.args.clone();
    if let Some(prompt) = task.payload.get(PROMPT_KEY) {
        if !args.iter().any(|a| a.starts_with("--output-format")) {
            args.push("--output-format=stream-json".to_string());
        }
        if let Some(model) = task.payload.get(MODEL_KEY) {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.push("--print".to_string());
        args.push(prompt.clone());
    }
    args
}

/// Subset of the agent's stream-json messages the worker cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    System {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },

    Assistant { message: AssistantMessage },

    Result {
        #[serde(default, alias = "isError")]
        is_error: Option<bool>,
        #[serde(default, alias = "durationMs")]
        duration_ms: Option<u64>,
        #[serde(default)]
        result: Option<Value>,
    },

    /// Anything else (tool use, user echo, stream deltas, ...).
    #[serde(untagged)]
    Unknown(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Render one stdout line of an agent for the live log.
///
/// Returns `None` for lines that carry nothing worth streaming; lines that
/// are not stream-json at all are returned unchanged.
pub fn render_line(line: &str) -> Option<String> {
    let message = match serde_json::from_str::<AgentMessage>(line) {
        Ok(message) => message,
        Err(_) => return Some(line.to_string()),
    };

    match message {
        AgentMessage::System { session_id, model } => Some(format!(
            "[session {}] model {}",
            session_id.as_deref().unwrap_or("unknown"),
            model.as_deref().unwrap_or("default")
        )),
        AgentMessage::Assistant { message } => {
            let text: Vec<String> = message
                .content
                .into_iter()
                .filter_map(|item| match item {
                    ContentItem::Text { text } => Some(text),
                    ContentItem::Other => None,
                })
                .collect();
            if text.is_empty() {
                None
            } else {
                Some(text.join("\n"))
            }
        }
        AgentMessage::Result {
            is_error,
            duration_ms,
            result,
        } => {
            let outcome = if is_error.unwrap_or(false) { "error" } else { "ok" };
            let summary = match result {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            Some(format!(
                "[result {} in {} ms] {}",
                outcome,
                duration_ms.unwrap_or(0),
                summary
            ))
        }
        AgentMessage::Unknown(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_args_with_prompt() {
        let task = Task::cli_agent("claude")
            .with_arg("--verbose")
            .with_payload(PROMPT_KEY, "Summarize README.md")
            .with_payload(MODEL_KEY, "sonnet");
        assert_eq!(
            invocation_args(&task),
            vec![
                "--verbose",
                "--output-format=stream-json",
                "--model",
                "sonnet",
                "--print",
                "Summarize README.md"
            ]
        );
    }

    #[test]
    fn test_invocation_args_without_prompt() {
        let task = Task::cli_agent("my-agent").with_arg("run");
        assert_eq!(invocation_args(&task), vec!["run"]);
    }

    #[test]
    fn test_render_assistant_text() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello"},{"type":"tool_use","id":"x","name":"Read"}]}}"#;
        assert_eq!(render_line(line), Some("Hello".to_string()));
    }

    #[test]
    fn test_render_result_and_unknown() {
        let line = r#"{"type":"result","is_error":false,"duration_ms":1200,"result":"done"}"#;
        assert_eq!(
            render_line(line),
            Some("[result ok in 1200 ms] done".to_string())
        );

        let line = r#"{"type":"stream_event","event":{}}"#;
        assert_eq!(render_line(line), None);

        assert_eq!(render_line("plain text"), Some("plain text".to_string()));
    }
}
