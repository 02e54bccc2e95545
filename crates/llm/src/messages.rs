//! Canonical Anthropic-style message schema used throughout the pipeline.

mod canonical;
mod request;
mod response;

pub use canonical::{canonical_json, tool_call_signature};
pub use request::{
    ChatRequest, ContentBlock, Message, MessageContent, Role, SystemPrompt, ToolChoice, ToolDefinition,
    ToolResultContent,
};
pub use response::{ChatResponse, StopReason, ToolCall, Usage};
