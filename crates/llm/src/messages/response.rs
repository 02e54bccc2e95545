use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::ContentBlock;

/// Canonical chat response, matching the Anthropic messages API shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Completion identifier.
    pub id: String,

    /// Always `"message"`.
    #[serde(default = "message_type")]
    pub r#type: String,

    /// Always `"assistant"`.
    #[serde(default = "assistant_role")]
    pub role: String,

    /// Response content blocks.
    pub content: Vec<ContentBlock>,

    /// Model that produced the response.
    pub model: String,

    /// Why generation stopped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,

    /// The stop sequence that fired, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,

    /// Token accounting.
    pub usage: Usage,
}

fn message_type() -> String {
    "message".to_string()
}

fn assistant_role() -> String {
    "assistant".to_string()
}

impl ChatResponse {
    /// A synthesised assistant response carrying one text block. Used by the
    /// loop guard and forced-termination paths.
    pub fn synthetic(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            r#type: message_type(),
            role: assistant_role(),
            content: vec![ContentBlock::Text { text: text.into() }],
            model: model.into(),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Usage::default(),
        }
    }

    /// Tool calls requested by this response, in content order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the assistant turn.
    EndTurn,
    /// The model requested tool execution.
    ToolUse,
    /// The max_tokens budget was hit.
    MaxTokens,
    /// A stop sequence fired.
    StopSequence,
}

/// Token accounting attached to every response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub input_tokens: u64,

    /// Tokens generated.
    #[serde(default)]
    pub output_tokens: u64,

    /// Tokens written to the provider-side prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,

    /// Tokens read from the provider-side prompt cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

/// Internal tool call representation. Arguments stay a decoded object;
/// string encoding happens only at the final adapter hop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Correlation id from the `tool_use` block.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Decoded argument object.
    pub arguments: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_calls_extracted_in_content_order() {
        let response: ChatResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "m",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "a", "name": "WebSearch", "input": {"query": "x"}},
                {"type": "tool_use", "id": "b", "name": "Task", "input": {"prompt": "y"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();

        let calls = response.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[1].name, "Task");
        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));
    }

    #[test]
    fn synthetic_responses_end_the_turn() {
        let response = ChatResponse::synthetic("m", "done");

        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.text(), "done");
        assert!(response.id.starts_with("msg_"));
    }
}
