//! Agent loop, policy and tool execution configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use indexmap::IndexMap;
use serde::Deserialize;

/// Agent loop configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Safety limits for one request's model-tool cycle.
    pub limits: LoopLimits,

    /// Where tool calls execute.
    pub tool_execution_mode: ToolExecutionMode,

    /// Tool policy: deny-lists and per-tool rate limits.
    pub policy: PolicyConfig,

    /// Directory where session transcripts are appended.
    pub session_dir: Option<String>,
}

/// Safety limits for the iterative model-tool cycle.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopLimits {
    /// Maximum model calls within one request.
    pub max_steps: u32,

    /// Wall-clock budget for one request.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_duration: Duration,

    /// Maximum tool executions within one request.
    pub max_tool_calls: u32,

    /// Identical tool-call signatures tolerated before a warning is injected.
    /// One more occurrence terminates the loop.
    pub tool_loop_warning_threshold: u32,

    /// `tool_result` blocks since the last user text message that trigger the
    /// pre-request loop guard.
    pub tool_result_guard_threshold: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: 6,
            max_duration: Duration::from_secs(120),
            max_tool_calls: 20,
            tool_loop_warning_threshold: 3,
            tool_result_guard_threshold: 3,
        }
    }
}

/// Where tool calls returned by the model are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolExecutionMode {
    /// All tools execute inside the proxy.
    #[default]
    Server,
    /// Server-side tools execute locally; all others are returned to the
    /// client with `stop_reason = "tool_use"`.
    Passthrough,
    /// Alias for `passthrough` kept for older configurations.
    Client,
}

impl ToolExecutionMode {
    /// Whether non-server-side tool calls are handed back to the client.
    pub fn splits_to_client(self) -> bool {
        matches!(self, Self::Passthrough | Self::Client)
    }
}

/// Tool policy configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Tool names that are never executed.
    pub deny: Vec<String>,

    /// Per-tool rate limits, keyed by tool name. Limits are evaluated
    /// per-tool per-session.
    pub rate_limits: IndexMap<String, ToolRateLimit>,
}

/// Rate limit for a single tool.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolRateLimit {
    /// Number of calls allowed per window.
    pub limit: u32,

    /// Window the limit applies to.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}
