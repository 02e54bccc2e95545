//! Google Gemini generateContent adapter.
//!
//! Gemini has no dedicated system channel in this dialect; the system
//! instruction is prepended as a user turn with a canned model
//! acknowledgement. Tool schemas must be stripped of JSON Schema fields the
//! API rejects before dispatch.

use std::collections::HashMap;

use async_trait::async_trait;
use lynkr_config::{ApiProviderConfig, RetryConfig};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse, ContentBlock, MessageContent, Role, StopReason, Usage},
    provider::{Capabilities, Provider, error_for_status, parse_upstream, resolve_key},
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_GOOGLE_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const SYSTEM_ACK: &str = "Understood. I will follow these instructions.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleGenerateRequest {
    contents: Vec<GoogleContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GoogleGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GoogleTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GoogleContent {
    role: String,
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Serialize, Deserialize)]
enum GooglePart {
    #[serde(rename = "text")]
    Text(String),
    #[serde(rename = "functionCall")]
    FunctionCall {
        name: String,
        args: Value,
    },
    #[serde(rename = "functionResponse")]
    FunctionResponse {
        name: String,
        response: Value,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTool {
    function_declarations: Vec<GoogleFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GoogleFunctionDeclaration {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleGenerateResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    usage_metadata: Option<GoogleUsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GoogleUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Strip JSON Schema fields Gemini rejects, recursing structurally through
/// `properties`, `items` and the combinators rather than walking the value
/// as a generic dictionary.
fn sanitize_schema(mut schema: Value) -> Value {
    fn walk(node: &mut Value) {
        let Some(object) = node.as_object_mut() else {
            return;
        };

        object.remove("additionalProperties");
        object.remove("$schema");
        object.remove("$ref");
        object.remove("definitions");

        if let Some(properties) = object.get_mut("properties").and_then(Value::as_object_mut) {
            for child in properties.values_mut() {
                walk(child);
            }
        }

        if let Some(items) = object.get_mut("items") {
            walk(items);
        }

        for combinator in ["anyOf", "oneOf", "allOf"] {
            if let Some(variants) = object.get_mut(combinator).and_then(Value::as_array_mut) {
                for variant in variants {
                    walk(variant);
                }
            }
        }
    }

    walk(&mut schema);
    schema
}

/// Build the contents array. Returns the contents together with the
/// tool-use id → name map needed to label function responses.
fn build_contents(request: &ChatRequest) -> Vec<GoogleContent> {
    let mut contents = Vec::with_capacity(request.messages.len() + 2);
    let mut call_names: HashMap<String, String> = HashMap::new();

    if let Some(system) = &request.system {
        contents.push(GoogleContent {
            role: "user".to_string(),
            parts: vec![GooglePart::Text(system.flatten())],
        });
        contents.push(GoogleContent {
            role: "model".to_string(),
            parts: vec![GooglePart::Text(SYSTEM_ACK.to_string())],
        });
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User | Role::Tool => "user",
            Role::Assistant => "model",
        };

        let parts = match &message.content {
            MessageContent::Text(text) => vec![GooglePart::Text(text.clone())],
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } | ContentBlock::InputText { text } => GooglePart::Text(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        call_names.insert(id.clone(), name.clone());
                        GooglePart::FunctionCall {
                            name: name.clone(),
                            args: input.clone(),
                        }
                    }
                    ContentBlock::ToolResult {
                        tool_use_id, content, ..
                    } => GooglePart::FunctionResponse {
                        name: call_names.get(tool_use_id).cloned().unwrap_or_else(|| "tool".to_string()),
                        response: serde_json::json!({"result": content.flatten_text()}),
                    },
                })
                .collect(),
        };

        if !parts.is_empty() {
            contents.push(GoogleContent {
                role: role.to_string(),
                parts,
            });
        }
    }

    contents
}

/// Google Gemini upstream.
pub(crate) struct GoogleProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ApiProviderConfig,
    retry: RetryConfig,
}

impl GoogleProvider {
    pub fn new(name: String, config: ApiProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_GOOGLE_API_URL.to_string());

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

    fn wire(&self, mut request: ChatRequest) -> (String, GoogleGenerateRequest) {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        let tools = request.tools.take().map(|tools| {
            vec![GoogleTool {
                function_declarations: tools
                    .into_iter()
                    .map(|tool| GoogleFunctionDeclaration {
                        name: tool.name,
                        description: tool.description,
                        parameters: Some(sanitize_schema(tool.input_schema)),
                    })
                    .collect(),
            }]
        });

        let generation_config = (request.max_tokens.is_some()
            || request.temperature.is_some()
            || request.top_p.is_some())
        .then(|| GoogleGenerationConfig {
            max_output_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
        });

        let wire = GoogleGenerateRequest {
            contents: build_contents(&request),
            generation_config,
            tools,
        };

        (request.model, wire)
    }

    fn builder(
        &self,
        model: &str,
        wire: &GoogleGenerateRequest,
        context: &RequestContext,
    ) -> crate::Result<reqwest::RequestBuilder> {
        let api_key = resolve_key(&self.config.api_key, context, &self.name)?;

        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize Gemini request: {e}");
            LlmError::Internal(None)
        })?;

        Ok(self
            .client
            .post(format!("{}/models/{model}:generateContent", self.base_url))
            .timeout(self.config.timeout)
            .header("x-goog-api-key", api_key.expose_secret())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body))
    }
}

#[async_trait]
impl Provider for GoogleProvider {
    async fn chat(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        let (model, wire) = self.wire(request);

        let response = transport::send_with_retry(self.builder(&model, &wire, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read Gemini response body: {e}");
            LlmError::Internal(None)
        })?;

        let wire_response: GoogleGenerateResponse = parse_upstream(&body, &self.name)?;

        let mut content = Vec::new();
        let mut saw_tool_call = false;
        let mut finish_reason = None;

        if let Some(candidate) = wire_response.candidates.into_iter().next() {
            finish_reason = candidate.finish_reason;

            for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                match part {
                    GooglePart::Text(text) => content.push(ContentBlock::Text { text }),
                    GooglePart::FunctionCall { name, args } => {
                        saw_tool_call = true;
                        content.push(ContentBlock::ToolUse {
                            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
                            name,
                            input: args,
                        });
                    }
                    GooglePart::FunctionResponse { .. } => {}
                }
            }
        }

        let stop_reason = if saw_tool_call {
            StopReason::ToolUse
        } else {
            match finish_reason.as_deref() {
                Some("MAX_TOKENS") => StopReason::MaxTokens,
                _ => StopReason::EndTurn,
            }
        };

        let usage = wire_response.usage_metadata.unwrap_or_default();

        Ok(ChatResponse {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            r#type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: wire_response.model_version.unwrap_or(model),
            stop_reason: Some(stop_reason),
            stop_sequence: None,
            usage: Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        })
    }

    async fn chat_stream(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<StreamingResponse> {
        let (model, wire) = self.wire(request);

        let api_key = resolve_key(&self.config.api_key, context, &self.name)?;

        let body = sonic_rs::to_vec(&wire).map_err(|e| {
            log::error!("Failed to serialize Gemini streaming request: {e}");
            LlmError::Internal(None)
        })?;

        let builder = self
            .client
            .post(format!("{}/models/{model}:streamGenerateContent?alt=sse", self.base_url))
            .timeout(self.config.timeout)
            .header("x-goog-api-key", api_key.expose_secret())
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);

        transport::send_streaming(builder, &self.name).await
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::{Message, SystemPrompt, ToolResultContent};

    #[test]
    fn unsupported_schema_fields_are_stripped_recursively() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "definitions": {"unused": {}},
            "properties": {
                "nested": {
                    "type": "object",
                    "additionalProperties": true,
                    "properties": {"inner": {"$ref": "#/definitions/unused"}}
                },
                "list": {
                    "type": "array",
                    "items": {"type": "object", "additionalProperties": false}
                },
                "choice": {
                    "anyOf": [
                        {"type": "string", "$schema": "x"},
                        {"type": "object", "additionalProperties": false}
                    ]
                }
            }
        });

        let cleaned = sanitize_schema(schema);

        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned.get("definitions").is_none());
        assert!(cleaned["properties"]["nested"].get("additionalProperties").is_none());
        assert!(cleaned["properties"]["nested"]["properties"]["inner"].get("$ref").is_none());
        assert!(cleaned["properties"]["list"]["items"].get("additionalProperties").is_none());
        assert!(cleaned["properties"]["choice"]["anyOf"][0].get("$schema").is_none());
        assert!(cleaned["properties"]["choice"]["anyOf"][1].get("additionalProperties").is_none());

        // Everything else survives.
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["properties"]["list"]["type"], "array");
    }

    #[test]
    fn system_becomes_prepended_turn_with_ack() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".into(),
            system: Some(SystemPrompt::Text("Be brief.".into())),
            messages: vec![Message::text(Role::User, "hi")],
            tools: None,
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        };

        let contents = build_contents(&request);

        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0].role, "user");
        assert!(matches!(&contents[0].parts[0], GooglePart::Text(t) if t == "Be brief."));
        assert_eq!(contents[1].role, "model");
        assert!(matches!(&contents[1].parts[0], GooglePart::Text(t) if t == SYSTEM_ACK));
    }

    #[test]
    fn function_responses_are_labelled_from_the_matching_call() {
        let request = ChatRequest {
            model: "gemini-2.0-flash".into(),
            system: None,
            messages: vec![
                Message::text(Role::User, "search"),
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
                        content: ToolResultContent::Text("found".into()),
                        is_error: None,
                    }],
                ),
            ],
            tools: None,
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        };

        let contents = build_contents(&request);

        let GooglePart::FunctionResponse { name, response } = &contents[2].parts[0] else {
            unreachable!("expected functionResponse part");
        };
        assert_eq!(name, "WebSearch");
        assert_eq!(response["result"], "found");
    }
}
