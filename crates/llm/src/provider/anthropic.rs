use async_trait::async_trait;
use lynkr_config::{ApiProviderConfig, RetryConfig};
use secrecy::ExposeSecret;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse},
    provider::{Capabilities, Provider, error_for_status, parse_upstream, resolve_key},
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic-style upstream. The canonical schema is this dialect, so the
/// adapter serialises the request as-is and parses the response directly.
pub(crate) struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ApiProviderConfig,
    retry: RetryConfig,
}

impl AnthropicProvider {
    pub fn new(name: String, config: ApiProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string());

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

    fn builder(&self, request: &ChatRequest, context: &RequestContext) -> crate::Result<reqwest::RequestBuilder> {
        let api_key = resolve_key(&self.config.api_key, context, &self.name)?;

        let body = sonic_rs::to_vec(request).map_err(|e| {
            log::error!("Failed to serialize Anthropic request: {e}");
            LlmError::Internal(None)
        })?;

        Ok(self
            .client
            .post(format!("{}/messages", self.base_url))
            .timeout(self.config.timeout)
            .header("x-api-key", api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(&self, mut request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }
        request.stream = Some(false);

        let response = transport::send_with_retry(self.builder(&request, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read Anthropic response body: {e}");
            LlmError::Internal(None)
        })?;

        parse_upstream(&body, &self.name)
    }

    async fn chat_stream(&self, mut request: ChatRequest, context: &RequestContext) -> crate::Result<StreamingResponse> {
        request.stream = Some(true);

        transport::send_streaming(self.builder(&request, context)?, &self.name).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_tools: true,
            supports_streaming: true,
            natively_anthropic: true,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, extract::State, http::HeaderMap, response::IntoResponse, routing::post};
    use secrecy::SecretString;
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::{Message, Role, StopReason};

    #[derive(Clone)]
    struct CaptureState {
        captured: Arc<Mutex<Option<(HeaderMap, Value)>>>,
    }

    async fn handle_messages(
        State(state): State<CaptureState>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> impl IntoResponse {
        *state.captured.lock().unwrap() = Some((headers.clone(), body.clone()));

        Json(json!({
            "id": "msg_test",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet",
            "content": [{"type": "text", "text": "Hello!"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 4}
        }))
    }

    async fn spawn_upstream(state: CaptureState) -> String {
        let app = Router::new()
            .route("/v1/messages", post(handle_messages))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        format!("http://{address}/v1")
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet".into(),
            system: None,
            messages: vec![Message::text(Role::User, "Say hi")],
            tools: None,
            tool_choice: None,
            max_tokens: Some(128),
            temperature: None,
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn passes_canonical_request_through_unchanged() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };
        let base_url = spawn_upstream(state.clone()).await;

        let provider = AnthropicProvider::new(
            "anthropic".to_string(),
            ApiProviderConfig {
                api_key: Some(SecretString::from("test-key".to_string())),
                base_url: Some(base_url),
                ..Default::default()
            },
        );

        let response = provider.chat(request(), &RequestContext::default()).await.unwrap();

        assert_eq!(response.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(response.text(), "Hello!");
        assert_eq!(response.usage.input_tokens, 12);

        let (headers, body) = state.captured.lock().unwrap().clone().expect("captured request");
        assert_eq!(headers.get("x-api-key").unwrap(), "test-key");
        assert_eq!(headers.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(body["model"], "claude-3-5-sonnet");
        assert_eq!(body["stream"], Value::Bool(false));
        assert_eq!(body["messages"][0]["content"], "Say hi");
    }

    #[tokio::test]
    async fn byok_header_overrides_configured_key() {
        let state = CaptureState {
            captured: Arc::new(Mutex::new(None)),
        };
        let base_url = spawn_upstream(state.clone()).await;

        let provider = AnthropicProvider::new(
            "anthropic".to_string(),
            ApiProviderConfig {
                api_key: Some(SecretString::from("configured".to_string())),
                base_url: Some(base_url),
                ..Default::default()
            },
        );

        let context = RequestContext {
            api_key: Some(SecretString::from("byok".to_string())),
            ..Default::default()
        };

        provider.chat(request(), &context).await.unwrap();

        let (headers, _) = state.captured.lock().unwrap().clone().expect("captured request");
        assert_eq!(headers.get("x-api-key").unwrap(), "byok");
    }

    #[tokio::test]
    async fn missing_key_fails_as_provider_unavailable() {
        let provider = AnthropicProvider::new("anthropic".to_string(), ApiProviderConfig::default());

        let error = provider.chat(request(), &RequestContext::default()).await.unwrap_err();
        assert!(matches!(error, LlmError::ProviderUnavailable(_)));
    }
}
