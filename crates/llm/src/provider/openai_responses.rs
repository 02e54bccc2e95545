//! OpenAI "responses" dialect.
//!
//! The message history is rearranged into a flat `input[]` of typed items
//! (`message`, `function_call`, `function_call_output`). A FIFO of in-flight
//! call ids pairs outputs with their calls when the client omits the id.

use std::collections::VecDeque;

use async_trait::async_trait;
use lynkr_config::{ApiProviderConfig, RetryConfig};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse, ContentBlock, MessageContent, Role, StopReason, Usage, canonical_json},
    provider::{
        Capabilities, Provider, error_for_status,
        openai::output::decode_arguments,
        parse_upstream, resolve_key,
    },
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<InputItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ResponsesTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
}

/// Flat input item. Unlike chat completions, tool traffic is not nested in
/// messages; each call and output is its own top-level item.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputItem {
    Message {
        role: String,
        content: String,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

/// The responses dialect flattens the function envelope.
#[derive(Debug, Serialize)]
struct ResponsesTool {
    r#type: &'static str,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    id: String,
    model: String,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<OutputContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputContent {
    OutputText {
        text: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize, Default)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn build_input(request: &ChatRequest) -> Vec<InputItem> {
    let mut items = Vec::new();
    let mut in_flight: VecDeque<String> = VecDeque::new();

    if let Some(system) = &request.system {
        items.push(InputItem::Message {
            role: "system".to_string(),
            content: system.flatten(),
        });
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "assistant",
        };

        match &message.content {
            MessageContent::Text(text) => items.push(InputItem::Message {
                role: role.to_string(),
                content: text.clone(),
            }),
            MessageContent::Blocks(blocks) => {
                let mut text_parts = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } | ContentBlock::InputText { text } => {
                            text_parts.push(text.clone());
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            in_flight.push_back(id.clone());
                            items.push(InputItem::FunctionCall {
                                call_id: id.clone(),
                                name: name.clone(),
                                arguments: canonical_json(input),
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id, content, ..
                        } => {
                            // Pair with the oldest unanswered call when the
                            // id doesn't match anything in flight.
                            let call_id = if let Some(position) = in_flight.iter().position(|id| id == tool_use_id) {
                                in_flight.remove(position);
                                tool_use_id.clone()
                            } else {
                                in_flight.pop_front().unwrap_or_else(|| tool_use_id.clone())
                            };

                            items.push(InputItem::FunctionCallOutput {
                                call_id,
                                output: content.flatten_text(),
                            });
                        }
                    }
                }

                if !text_parts.is_empty() {
                    items.push(InputItem::Message {
                        role: role.to_string(),
                        content: text_parts.join("\n"),
                    });
                }
            }
        }
    }

    items
}

impl From<ResponsesResponse> for ChatResponse {
    fn from(response: ResponsesResponse) -> Self {
        let mut content = Vec::new();
        let mut saw_tool_call = false;

        for item in response.output {
            match item {
                OutputItem::Message { content: parts } => {
                    for part in parts {
                        if let OutputContent::OutputText { text } = part {
                            content.push(ContentBlock::Text { text });
                        }
                    }
                }
                OutputItem::FunctionCall {
                    call_id,
                    name,
                    arguments,
                } => {
                    saw_tool_call = true;
                    content.push(ContentBlock::ToolUse {
                        id: call_id,
                        name,
                        input: decode_arguments(&arguments),
                    });
                }
                OutputItem::Unknown => {}
            }
        }

        let usage = response.usage.unwrap_or_default();

        Self {
            id: response.id,
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: response.model,
            stop_reason: Some(if saw_tool_call {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            }),
            stop_sequence: None,
            usage: Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        }
    }
}

/// OpenAI responses-dialect upstream.
pub(crate) struct OpenAiResponsesProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ApiProviderConfig,
    retry: RetryConfig,
}

impl OpenAiResponsesProvider {
    pub fn new(name: String, config: ApiProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_string());

        Self {
            client: http_client(),
            base_url,
            name,
            config,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn builder(&self, wire: &ResponsesRequest, context: &RequestContext) -> crate::Result<reqwest::RequestBuilder> {
        let api_key = resolve_key(&self.config.api_key, context, &self.name)?;

        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize responses request: {e}");
            LlmError::Internal(None)
        })?;

        Ok(self
            .client
            .post(format!("{}/responses", self.base_url))
            .timeout(self.config.timeout)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            )
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body))
    }

    fn wire(&self, mut request: ChatRequest, stream: bool) -> ResponsesRequest {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        let tools = request.tools.take().map(|tools| {
            tools
                .into_iter()
                .map(|tool| ResponsesTool {
                    r#type: "function",
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                })
                .collect()
        });

        ResponsesRequest {
            input: build_input(&request),
            model: request.model,
            tools,
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            stream,
        }
    }
}

#[async_trait]
impl Provider for OpenAiResponsesProvider {
    async fn chat(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        let requested_model = request.model.clone();
        let wire = self.wire(request, false);

        let response = transport::send_with_retry(self.builder(&wire, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read responses body: {e}");
            LlmError::Internal(None)
        })?;

        let wire_response: ResponsesResponse = parse_upstream(&body, &self.name)?;

        let mut response = ChatResponse::from(wire_response);
        if !requested_model.is_empty() {
            response.model = requested_model;
        }

        Ok(response)
    }

    async fn chat_stream(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<StreamingResponse> {
        let wire = self.wire(request, true);

        transport::send_streaming(self.builder(&wire, context)?, &self.name).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_streaming: true,
            natively_anthropic: false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
