//! OpenAI chat completions wire format → canonical response.

use serde::Deserialize;
use serde_json::Value;

use crate::messages::{ChatResponse, ContentBlock, StopReason, Usage};

/// OpenAI chat completions response body.
#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponse {
    pub id: String,
    pub model: String,
    pub choices: Vec<OpenAiChoice>,
    #[serde(default)]
    pub usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiChoice {
    pub message: OpenAiResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<OpenAiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponseToolCall {
    pub id: String,
    pub function: OpenAiResponseFunction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OpenAiResponseFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct OpenAiUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// Decode an arguments string to an object. Upstreams occasionally emit
/// invalid JSON fragments mid-tool-call; those surface as a string-wrapped
/// value rather than dropping the call.
pub(crate) fn decode_arguments(arguments: &str) -> Value {
    let trimmed = arguments.trim();

    if trimmed.is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

pub(crate) fn finish_reason_to_stop(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

impl From<OpenAiResponse> for ChatResponse {
    fn from(response: OpenAiResponse) -> Self {
        let mut content = Vec::new();
        let mut stop_reason = StopReason::EndTurn;

        if let Some(choice) = response.choices.into_iter().next() {
            stop_reason = finish_reason_to_stop(choice.finish_reason.as_deref());

            if let Some(text) = choice.message.content
                && !text.is_empty()
            {
                content.push(ContentBlock::Text { text });
            }

            for call in choice.message.tool_calls.unwrap_or_default() {
                content.push(ContentBlock::ToolUse {
                    id: call.id,
                    name: call.function.name,
                    input: decode_arguments(&call.function.arguments),
                });
            }
        }

        let usage = response.usage.unwrap_or_default();

        Self {
            id: response.id,
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: response.model,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage: Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        }
    }
}
