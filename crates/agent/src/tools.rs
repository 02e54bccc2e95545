//! Tool execution contract.
//!
//! Tool implementations live outside the core; the orchestrator only knows
//! this contract. A runner receives the decoded call and the execution
//! context and reports a structured outcome, never an Err. Failures travel
//! back to the model as `is_error` tool results.

use std::path::PathBuf;

use async_trait::async_trait;
use lynkr_llm::messages::{Message, ToolCall};
use serde_json::Value;

/// Tools the proxy executes itself even in passthrough mode.
pub const SERVER_SIDE_TOOLS: &[&str] = &["task", "web_search", "web_fetch"];

/// Whether a tool executes on the proxy regardless of execution mode.
pub fn is_server_side(name: &str) -> bool {
    let lowered = name.to_lowercase();
    SERVER_SIDE_TOOLS.iter().any(|tool| lowered == *tool)
}

/// Execution context handed to every tool call.
pub struct ToolContext {
    /// Session the call belongs to.
    pub session_id: String,
    /// Working directory for file and shell tools.
    pub cwd: PathBuf,
    /// Conversation so far, for tools that need it (subagents).
    pub request_messages: Vec<Message>,
}

/// Structured result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Correlation id copied from the call.
    pub id: String,
    /// Tool name copied from the call.
    pub name: String,
    /// Whether the execution succeeded.
    pub ok: bool,
    /// Short status marker (`ok`, `error`, `timeout`, ...).
    pub status: String,
    /// Output text handed back to the model.
    pub content: String,
    /// Structured extras for the session record.
    pub metadata: Value,
}

impl ToolOutcome {
    /// A failed outcome carrying an error message.
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            ok: false,
            status: "error".to_string(),
            content: message.into(),
            metadata: Value::Null,
        }
    }
}

/// Executes tool calls on behalf of the loop.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Execute one call. Implementations report failures through the
    /// outcome, not through a panic or an abort of the loop.
    async fn execute(&self, call: &ToolCall, context: &ToolContext) -> ToolOutcome;
}

/// Runner used when no tool backend is wired in: every call fails softly so
/// the model can recover or answer without the tool.
pub struct UnavailableToolRunner;

#[async_trait]
impl ToolRunner for UnavailableToolRunner {
    async fn execute(&self, call: &ToolCall, _context: &ToolContext) -> ToolOutcome {
        ToolOutcome::error(call, format!("tool '{}' is not available in this deployment", call.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_set_matches_case_insensitively() {
        assert!(is_server_side("task"));
        assert!(is_server_side("Task"));
        assert!(is_server_side("web_search"));
        assert!(!is_server_side("bash"));
        assert!(!is_server_side("read_file"));
    }
}
