//! AWS Bedrock adapter using the unified Converse API.
//!
//! Converse handles all Bedrock model families behind one interface, so the
//! adapter only translates between the canonical schema and the SDK types.
//! Credentials come from the standard AWS chain; only region and model are
//! configured here.

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_bedrockruntime::{
    Client as BedrockRuntimeClient,
    error::ProvideErrorMetadata,
    types::{
        AnyToolChoice, AutoToolChoice, ContentBlock as BedrockContentBlock, ConversationRole,
        InferenceConfiguration, Message as BedrockMessage, SpecificToolChoice, StopReason as BedrockStopReason,
        SystemContentBlock, Tool as BedrockTool, ToolChoice as BedrockToolChoice, ToolConfiguration,
        ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolSpecification, ToolUseBlock,
    },
};
use aws_smithy_types::Document;
use lynkr_config::BedrockProviderConfig;
use serde_json::Value;

use crate::{
    error::LlmError,
    messages::{
        ChatRequest, ChatResponse, ContentBlock, MessageContent, Role, StopReason, ToolChoice, Usage,
    },
    provider::{Capabilities, Provider},
    request::RequestContext,
    transport::StreamingResponse,
};

pub(crate) struct BedrockProvider {
    client: BedrockRuntimeClient,
    name: String,
    config: BedrockProviderConfig,
}

impl BedrockProvider {
    pub async fn new(name: String, config: BedrockProviderConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }

        let sdk_config = loader.load().await;

        Self {
            client: BedrockRuntimeClient::new(&sdk_config),
            name,
            config,
        }
    }
}

fn json_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Document::Number(aws_smithy_types::Number::PosInt(u))
            } else if let Some(i) = n.as_i64() {
                Document::Number(aws_smithy_types::Number::NegInt(i))
            } else {
                Document::Number(aws_smithy_types::Number::Float(n.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_document(value)))
                .collect(),
        ),
    }
}

fn document_to_json(document: &Document) -> Value {
    match document {
        Document::Null => Value::Null,
        Document::Bool(b) => Value::Bool(*b),
        Document::Number(n) => match n {
            aws_smithy_types::Number::PosInt(u) => Value::from(*u),
            aws_smithy_types::Number::NegInt(i) => Value::from(*i),
            aws_smithy_types::Number::Float(f) => {
                serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
            }
        },
        Document::String(s) => Value::String(s.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), document_to_json(value)))
                .collect(),
        ),
    }
}

/// Convert canonical messages to Bedrock form. Consecutive same-role turns
/// are batched into one message with multiple content blocks, which Converse
/// requires.
fn convert_messages(request: &ChatRequest) -> Result<Vec<BedrockMessage>, LlmError> {
    let mut messages: Vec<(ConversationRole, Vec<BedrockContentBlock>)> = Vec::new();

    for message in &request.messages {
        let role = match message.role {
            Role::Assistant => ConversationRole::Assistant,
            Role::User | Role::Tool => ConversationRole::User,
        };

        let mut blocks = Vec::new();

        match &message.content {
            MessageContent::Text(text) => blocks.push(BedrockContentBlock::Text(text.clone())),
            MessageContent::Blocks(content_blocks) => {
                for block in content_blocks {
                    match block {
                        ContentBlock::Text { text } | ContentBlock::InputText { text } => {
                            blocks.push(BedrockContentBlock::Text(text.clone()));
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let tool_use = ToolUseBlock::builder()
                                .tool_use_id(id)
                                .name(name)
                                .input(json_to_document(input))
                                .build()
                                .map_err(|e| LlmError::SchemaError(format!("bedrock tool_use: {e}")))?;

                            blocks.push(BedrockContentBlock::ToolUse(tool_use));
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            let mut builder = ToolResultBlock::builder()
                                .tool_use_id(tool_use_id)
                                .content(ToolResultContentBlock::Text(content.flatten_text()));

                            if is_error.unwrap_or(false) {
                                builder = builder.status(aws_sdk_bedrockruntime::types::ToolResultStatus::Error);
                            }

                            let result = builder
                                .build()
                                .map_err(|e| LlmError::SchemaError(format!("bedrock tool_result: {e}")))?;

                            blocks.push(BedrockContentBlock::ToolResult(result));
                        }
                    }
                }
            }
        }

        if blocks.is_empty() {
            continue;
        }

        match messages.last_mut() {
            Some((previous_role, previous_blocks)) if *previous_role == role => {
                previous_blocks.extend(blocks);
            }
            _ => messages.push((role, blocks)),
        }
    }

    messages
        .into_iter()
        .map(|(role, blocks)| {
            BedrockMessage::builder()
                .role(role)
                .set_content(Some(blocks))
                .build()
                .map_err(|e| LlmError::SchemaError(format!("bedrock message: {e}")))
        })
        .collect()
}

fn convert_tool_config(request: &ChatRequest) -> Result<Option<ToolConfiguration>, LlmError> {
    let Some(tools) = &request.tools else {
        return Ok(None);
    };

    if tools.is_empty() {
        return Ok(None);
    }

    let mut builder = ToolConfiguration::builder();

    for tool in tools {
        let specification = ToolSpecification::builder()
            .name(&tool.name)
            .set_description(tool.description.clone())
            .input_schema(ToolInputSchema::Json(json_to_document(&tool.input_schema)))
            .build()
            .map_err(|e| LlmError::SchemaError(format!("bedrock tool spec: {e}")))?;

        builder = builder.tools(BedrockTool::ToolSpec(specification));
    }

    let tool_choice = request.tool_choice.as_ref().and_then(|choice| match choice {
        ToolChoice::Auto => Some(BedrockToolChoice::Auto(AutoToolChoice::builder().build())),
        ToolChoice::Any => Some(BedrockToolChoice::Any(AnyToolChoice::builder().build())),
        ToolChoice::Tool { name } => SpecificToolChoice::builder()
            .name(name)
            .build()
            .ok()
            .map(BedrockToolChoice::Tool),
        ToolChoice::None => None,
    });

    builder = builder.set_tool_choice(tool_choice);

    builder
        .build()
        .map(Some)
        .map_err(|e| LlmError::SchemaError(format!("bedrock tool config: {e}")))
}

#[async_trait]
impl Provider for BedrockProvider {
    async fn chat(&self, mut request: ChatRequest, _context: &RequestContext) -> crate::Result<ChatResponse> {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        let system = request.system.as_ref().map(|system| {
            vec![SystemContentBlock::Text(system.flatten())]
        });

        let inference_config = InferenceConfiguration::builder()
            .set_max_tokens(request.max_tokens.map(|v| v as i32))
            .set_temperature(request.temperature)
            .set_top_p(request.top_p)
            .build();

        let messages = convert_messages(&request)?;
        let tool_config = convert_tool_config(&request)?;

        let output = self
            .client
            .converse()
            .model_id(&request.model)
            .set_messages(Some(messages))
            .set_system(system)
            .inference_config(inference_config)
            .set_tool_config(tool_config)
            .send()
            .await
            .map_err(|e| {
                let message = e.message().map(str::to_string);
                log::error!("Failed to invoke Converse API: {e:?}");

                match message {
                    Some(body) => LlmError::HttpError { status: 502, body },
                    None => LlmError::TransportError(format!("bedrock: {e}")),
                }
            })?;

        let mut content = Vec::new();

        if let Some(message) = output.output().and_then(|o| o.as_message().ok()) {
            for block in message.content() {
                match block {
                    BedrockContentBlock::Text(text) => content.push(ContentBlock::Text { text: text.clone() }),
                    BedrockContentBlock::ToolUse(tool_use) => content.push(ContentBlock::ToolUse {
                        id: tool_use.tool_use_id().to_string(),
                        name: tool_use.name().to_string(),
                        input: document_to_json(tool_use.input()),
                    }),
                    _ => {}
                }
            }
        }

        let stop_reason = match output.stop_reason() {
            BedrockStopReason::ToolUse => StopReason::ToolUse,
            BedrockStopReason::MaxTokens => StopReason::MaxTokens,
            BedrockStopReason::StopSequence => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        };

        let usage = output.usage();

        Ok(ChatResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: request.model,
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage: Usage {
                input_tokens: usage.map(|u| u.input_tokens().max(0) as u64).unwrap_or(0),
                output_tokens: usage.map(|u| u.output_tokens().max(0) as u64).unwrap_or(0),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        })
    }

    async fn chat_stream(&self, _request: ChatRequest, _context: &RequestContext) -> crate::Result<StreamingResponse> {
        // Converse streaming is an SDK event stream, not a byte stream; the
        // dispatcher downgrades streaming requests for this provider instead.
        Err(LlmError::Internal(Some(
            "Bedrock does not support streaming pass-through".to_string(),
        )))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_streaming: false,
            natively_anthropic: false,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
