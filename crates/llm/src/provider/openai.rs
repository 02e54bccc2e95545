pub(crate) mod input;
pub(crate) mod output;

use async_trait::async_trait;
use lynkr_config::{ApiProviderConfig, RetryConfig};
use secrecy::ExposeSecret;

use self::{input::OpenAiRequest, output::OpenAiResponse};

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse},
    provider::{Capabilities, Provider, error_for_status, parse_upstream, resolve_key},
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com/v1";

/// OpenAI-style chat completions upstream.
pub(crate) struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ApiProviderConfig,
    retry: RetryConfig,
}

impl OpenAiProvider {
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

    fn builder(&self, wire: &OpenAiRequest, context: &RequestContext) -> crate::Result<reqwest::RequestBuilder> {
        let api_key = resolve_key(&self.config.api_key, context, &self.name)?;

        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize OpenAI request: {e}");
            LlmError::Internal(None)
        })?;

        Ok(self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.config.timeout)
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", api_key.expose_secret()),
            )
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(&self, mut request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        let requested_model = request.model.clone();
        let mut wire = OpenAiRequest::from(request);
        wire.stream = false;

        let response = transport::send_with_retry(self.builder(&wire, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read OpenAI response body: {e}");
            LlmError::Internal(None)
        })?;

        let wire_response: OpenAiResponse = parse_upstream(&body, &self.name)?;

        let mut response = ChatResponse::from(wire_response);
        response.model = requested_model;

        Ok(response)
    }

    async fn chat_stream(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<StreamingResponse> {
        let mut wire = OpenAiRequest::from(request);
        wire.stream = true;

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

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, response::IntoResponse, routing::post};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::{ContentBlock, Message, Role, StopReason, ToolDefinition, ToolResultContent};

    #[derive(Clone)]
    struct CaptureState {
        captured: Arc<Mutex<Option<Value>>>,
        reply: Value,
    }

    async fn handle(State(state): State<CaptureState>, Json(body): Json<Value>) -> impl IntoResponse {
        *state.captured.lock().unwrap() = Some(body);
        Json(state.reply.clone())
    }

    async fn spawn_upstream(state: CaptureState) -> String {
        let app = Router::new()
            .route("/v1/chat/completions", post(handle))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{address}/v1")
    }

    fn provider(base_url: String) -> OpenAiProvider {
        OpenAiProvider::new(
            "openai".to_string(),
            ApiProviderConfig {
                api_key: Some(SecretString::from("sk-test".to_string())),
                base_url: Some(base_url),
                ..Default::default()
            },
        )
    }

    fn tool_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o".into(),
            system: Some(crate::messages::SystemPrompt::Text("Be terse.".into())),
            messages: vec![
                Message::text(Role::User, "Search for x"),
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
                        content: ToolResultContent::Text("found it".into()),
                        is_error: None,
                    }],
                ),
            ],
            tools: Some(vec![ToolDefinition {
                name: "WebSearch".into(),
                description: Some("Search the web".into()),
                input_schema: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
            }]),
            tool_choice: None,
            max_tokens: Some(256),
            temperature: None,
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn translates_tool_history_to_openai_wire() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
            reply: json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Done."},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 20, "completion_tokens": 3, "total_tokens": 23}
            }),
        };
        let base_url = spawn_upstream(state.clone()).await;

        let response = provider(base_url)
            .chat(tool_request(), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.text(), "Done.");
        assert_eq!(response.usage.input_tokens, 20);

        let body = state.captured.lock().unwrap().clone().expect("captured request");

        // system lands as the first message
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "Be terse.");

        // tool_use becomes assistant tool_calls with stringified arguments
        let tool_call = &body["messages"][2]["tool_calls"][0];
        assert_eq!(tool_call["id"], "t1");
        assert_eq!(tool_call["function"]["name"], "WebSearch");
        let arguments: Value = serde_json::from_str(tool_call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments, json!({"query": "x"}));

        // tool_result becomes a role=tool message
        assert_eq!(body["messages"][3]["role"], "tool");
        assert_eq!(body["messages"][3]["tool_call_id"], "t1");
        assert_eq!(body["messages"][3]["content"], "found it");

        // tool schema is wrapped in the function envelope
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "WebSearch");
    }

    #[tokio::test]
    async fn decodes_tool_calls_back_to_canonical_blocks() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
            reply: json!({
                "id": "chatcmpl-2",
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "WebSearch", "arguments": "{\"query\":\"rust\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }],
                "usage": {"prompt_tokens": 15, "completion_tokens": 8, "total_tokens": 23}
            }),
        };
        let base_url = spawn_upstream(state.clone()).await;

        let response = provider(base_url)
            .chat(tool_request(), &RequestContext::default())
            .await
            .unwrap();

        assert_eq!(response.stop_reason, Some(StopReason::ToolUse));

        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_9");
        assert_eq!(calls[0].name, "WebSearch");
        // Arguments are decoded to an object on ingress, never kept as a string.
        assert_eq!(calls[0].arguments, json!({"query": "rust"}));
    }
}
