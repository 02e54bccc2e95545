//! Canonical request → OpenAI chat completions wire format.

use serde::Serialize;
use serde_json::Value;

use crate::messages::{
    ChatRequest, ContentBlock, MessageContent, Role, ToolChoice, ToolDefinition, canonical_json,
};

/// OpenAI chat completions request body.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiRequest {
    pub model: String,
    pub messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub stream: bool,
}

/// One OpenAI wire message.
#[derive(Debug, Serialize)]
pub(crate) struct OpenAiMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiToolCall {
    pub id: String,
    pub r#type: &'static str,
    pub function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionCall {
    pub name: String,
    /// Arguments as a JSON string; the string encoding happens here, at the
    /// last hop before the wire.
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiTool {
    pub r#type: &'static str,
    pub function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAiFunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

impl From<ToolDefinition> for OpenAiTool {
    fn from(tool: ToolDefinition) -> Self {
        Self {
            r#type: "function",
            function: OpenAiFunctionDef {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            },
        }
    }
}

impl From<ChatRequest> for OpenAiRequest {
    fn from(request: ChatRequest) -> Self {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system",
                content: Some(system.flatten()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for message in &request.messages {
            convert_message(message.role, &message.content, &mut messages);
        }

        let tools = request
            .tools
            .map(|tools| tools.into_iter().map(OpenAiTool::from).collect::<Vec<_>>())
            .filter(|tools: &Vec<_>| !tools.is_empty());

        let tool_choice = request.tool_choice.map(|choice| match choice {
            ToolChoice::Auto => Value::String("auto".to_string()),
            ToolChoice::None => Value::String("none".to_string()),
            ToolChoice::Any => Value::String("required".to_string()),
            ToolChoice::Tool { name } => serde_json::json!({
                "type": "function",
                "function": {"name": name}
            }),
        });

        Self {
            model: request.model,
            messages,
            tools,
            tool_choice,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream: request.stream.unwrap_or(false),
        }
    }
}

/// Split one canonical turn into OpenAI wire messages. Tool results become
/// their own `role = "tool"` messages; everything else folds into one
/// message per turn.
fn convert_message(role: Role, content: &MessageContent, out: &mut Vec<OpenAiMessage>) {
    let wire_role = match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    match content {
        MessageContent::Text(text) => out.push(OpenAiMessage {
            role: wire_role,
            content: Some(text.clone()),
            tool_calls: None,
            tool_call_id: None,
        }),
        MessageContent::Blocks(blocks) => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } | ContentBlock::InputText { text } => {
                        text_parts.push(text.clone());
                    }
                    ContentBlock::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                        id: id.clone(),
                        r#type: "function",
                        function: OpenAiFunctionCall {
                            name: name.clone(),
                            arguments: canonical_json(input),
                        },
                    }),
                    ContentBlock::ToolResult {
                        tool_use_id, content, ..
                    } => out.push(OpenAiMessage {
                        role: "tool",
                        content: Some(content.flatten_text()),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id.clone()),
                    }),
                }
            }

            if !text_parts.is_empty() || !tool_calls.is_empty() {
                out.push(OpenAiMessage {
                    role: wire_role,
                    content: (!text_parts.is_empty()).then(|| text_parts.join("\n")),
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
        }
    }
}
