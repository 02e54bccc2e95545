//! Ollama chat adapter.
//!
//! Local runtimes are strict about role alternation, so consecutive
//! same-role turns are merged before dispatch. Models known not to support
//! tools get their tool traffic flattened to plain text.

use async_trait::async_trait;
use lynkr_config::{OllamaProviderConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{
        ChatRequest, ChatResponse, ContentBlock, Message, MessageContent, Role, StopReason, Usage,
    },
    provider::{Capabilities, Provider, error_for_status, merge_consecutive_roles, parse_upstream},
    request::RequestContext,
    transport::{self, StreamingResponse},
};

/// Model-name prefixes without tool support. Tool blocks are flattened to
/// text for these before dispatch.
const NON_TOOL_MODEL_PREFIXES: &[&str] = &[
    "gemma",
    "phi",
    "llava",
    "codellama",
    "deepseek-r1",
    "starcoder",
    "vicuna",
    "orca",
];

/// Whether a local model understands tool declarations.
pub(crate) fn model_supports_tools(model: &str) -> bool {
    let lowered = model.to_lowercase();
    !NON_TOOL_MODEL_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<super::openai::input::OpenAiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaToolCall {
    function: OllamaFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaFunctionCall {
    name: String,
    /// Ollama keeps arguments as a decoded object on the wire.
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: OllamaResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<OllamaToolCall>>,
}

/// Flatten tool traffic to plain text for models without tool support.
/// `tool_use` becomes a sentence describing the call, `tool_result` becomes
/// its text content.
fn flatten_tool_blocks(request: &mut ChatRequest) {
    request.tools = None;
    request.tool_choice = None;

    for message in &mut request.messages {
        if let MessageContent::Blocks(blocks) = &message.content {
            let mut parts = Vec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } | ContentBlock::InputText { text } => parts.push(text.clone()),
                    ContentBlock::ToolUse { name, input, .. } => {
                        parts.push(format!("[called {name} with {input}]"));
                    }
                    ContentBlock::ToolResult { content, .. } => parts.push(content.flatten_text()),
                }
            }

            message.content = MessageContent::Text(parts.join("\n"));
        }
    }

    let messages = std::mem::take(&mut request.messages);
    request.messages = messages
        .into_iter()
        .filter_map(|message| {
            let role = match message.role {
                Role::Tool => Role::User,
                other => other,
            };

            let text = message.content.flatten_text();
            (!text.trim().is_empty()).then(|| Message::text(role, text))
        })
        .collect();
}

fn convert_messages(request: &ChatRequest) -> Vec<OllamaMessage> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(OllamaMessage {
            role: "system",
            content: system.flatten(),
            tool_calls: None,
        });
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };

        match &message.content {
            MessageContent::Text(text) => messages.push(OllamaMessage {
                role,
                content: text.clone(),
                tool_calls: None,
            }),
            MessageContent::Blocks(blocks) => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } | ContentBlock::InputText { text } => {
                            text_parts.push(text.clone());
                        }
                        ContentBlock::ToolUse { name, input, .. } => tool_calls.push(OllamaToolCall {
                            function: OllamaFunctionCall {
                                name: name.clone(),
                                arguments: input.clone(),
                            },
                        }),
                        ContentBlock::ToolResult { content, .. } => messages.push(OllamaMessage {
                            role: "tool",
                            content: content.flatten_text(),
                            tool_calls: None,
                        }),
                    }
                }

                if !text_parts.is_empty() || !tool_calls.is_empty() {
                    messages.push(OllamaMessage {
                        role,
                        content: text_parts.join("\n"),
                        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    });
                }
            }
        }
    }

    messages
}

/// Ollama local runtime.
pub(crate) struct OllamaProvider {
    client: reqwest::Client,
    name: String,
    config: OllamaProviderConfig,
    retry: RetryConfig,
}

impl OllamaProvider {
    pub fn new(name: String, config: OllamaProviderConfig) -> Self {
        Self {
            client: http_client(),
            name,
            config,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn wire(&self, mut request: ChatRequest, stream: bool) -> OllamaChatRequest {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        if !model_supports_tools(&request.model) {
            flatten_tool_blocks(&mut request);
        }

        merge_consecutive_roles(&mut request);

        let options = (request.temperature.is_some() || request.top_p.is_some() || request.max_tokens.is_some())
            .then(|| OllamaOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens,
            });

        let tools = request
            .tools
            .take()
            .map(|tools| {
                tools
                    .into_iter()
                    .map(super::openai::input::OpenAiTool::from)
                    .collect::<Vec<_>>()
            })
            .filter(|tools| !tools.is_empty());

        OllamaChatRequest {
            messages: convert_messages(&request),
            model: request.model,
            tools,
            stream,
            options,
        }
    }

    fn builder(&self, wire: &OllamaChatRequest) -> crate::Result<reqwest::RequestBuilder> {
        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize Ollama request: {e}");
            LlmError::Internal(None)
        })?;

        Ok(self
            .client
            .post(format!("{}/api/chat", self.config.base_url))
            .timeout(self.config.timeout)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body))
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    async fn chat(&self, request: ChatRequest, _context: &RequestContext) -> crate::Result<ChatResponse> {
        let wire = self.wire(request, false);

        let response = transport::send_with_retry(self.builder(&wire)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read Ollama response body: {e}");
            LlmError::Internal(None)
        })?;

        let wire_response: OllamaChatResponse = parse_upstream(&body, &self.name)?;

        let mut content = Vec::new();

        if !wire_response.message.content.is_empty() {
            content.push(ContentBlock::Text {
                text: wire_response.message.content,
            });
        }

        let tool_calls = wire_response.message.tool_calls.unwrap_or_default();
        let saw_tool_call = !tool_calls.is_empty();

        for call in tool_calls {
            // Ollama does not assign call ids; mint one for the round-trip.
            content.push(ContentBlock::ToolUse {
                id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                name: call.function.name,
                input: call.function.arguments,
            });
        }

        let stop_reason = if saw_tool_call {
            StopReason::ToolUse
        } else {
            match wire_response.done_reason.as_deref() {
                Some("length") => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            }
        };

        Ok(ChatResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: wire_response.model,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage: Usage {
                input_tokens: wire_response.prompt_eval_count.unwrap_or(0),
                output_tokens: wire_response.eval_count.unwrap_or(0),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        })
    }

    async fn chat_stream(&self, request: ChatRequest, _context: &RequestContext) -> crate::Result<StreamingResponse> {
        let wire = self.wire(request, true);

        transport::send_streaming(self.builder(&wire)?, &self.name).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: self
                .config
                .model
                .as_deref()
                .map(model_supports_tools)
                .unwrap_or(true),
            supports_streaming: true,
            natively_anthropic: false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_support_is_a_prefix_match() {
        assert!(model_supports_tools("qwen2.5:7b"));
        assert!(model_supports_tools("llama3.1:8b"));
        assert!(!model_supports_tools("gemma2:9b"));
        assert!(!model_supports_tools("Phi-3-mini"));
        assert!(!model_supports_tools("deepseek-r1:14b"));
    }

    fn request_with_tools(model: &str) -> ChatRequest {
        ChatRequest {
            model: model.into(),
            system: None,
            messages: vec![
                Message::text(Role::User, "search x"),
                Message::blocks(
                    Role::Assistant,
                    vec![ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "WebSearch".into(),
                        input: json!({"query": "x"}),
                    }],
                ),
                Message::blocks(
                    Role::User,
                    vec![ContentBlock::ToolResult {
                        tool_use_id: "t1".into(),
                        content: crate::messages::ToolResultContent::Text("found".into()),
                        is_error: None,
                    }],
                ),
            ],
            tools: Some(vec![crate::messages::ToolDefinition {
                name: "WebSearch".into(),
                description: None,
                input_schema: json!({"type": "object"}),
            }]),
            tool_choice: None,
            max_tokens: None,
            temperature: Some(0.2),
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn tool_capable_models_keep_tool_traffic() {
        let provider = OllamaProvider::new("ollama".into(), OllamaProviderConfig::default());
        let wire = provider.wire(request_with_tools("qwen2.5:7b"), false);

        assert!(wire.tools.is_some());
        assert!(wire.messages.iter().any(|m| m.tool_calls.is_some()));
        assert!(wire.messages.iter().any(|m| m.role == "tool"));
        assert!(wire.options.is_some());
    }

    #[test]
    fn non_tool_models_get_flattened_text_only() {
        let provider = OllamaProvider::new("ollama".into(), OllamaProviderConfig::default());
        let wire = provider.wire(request_with_tools("gemma2:9b"), false);

        assert!(wire.tools.is_none());
        assert!(wire.messages.iter().all(|m| m.tool_calls.is_none()));
        assert!(wire.messages.iter().all(|m| m.role != "tool"));

        // The tool call and its result both survive as plain text.
        let all_text: String = wire.messages.iter().map(|m| m.content.clone()).collect();
        assert!(all_text.contains("WebSearch"));
        assert!(all_text.contains("found"));
    }

    #[test]
    fn consecutive_roles_are_merged_for_the_runtime() {
        let provider = OllamaProvider::new("ollama".into(), OllamaProviderConfig::default());

        let mut request = request_with_tools("gemma2:9b");
        request.messages.push(Message::text(Role::User, "and another thing"));

        let wire = provider.wire(request, false);

        for window in wire.messages.windows(2) {
            assert_ne!(window[0].role, window[1].role);
        }
    }
}
