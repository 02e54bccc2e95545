//! llama.cpp server adapter. Speaks the OpenAI chat completions wire with
//! the same role-alternation constraint as Ollama.

use async_trait::async_trait;
use lynkr_config::{ApiProviderConfig, RetryConfig};
use secrecy::ExposeSecret;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse},
    provider::{
        Capabilities, Provider, error_for_status, merge_consecutive_roles,
        openai::{input::OpenAiRequest, output::OpenAiResponse},
        parse_upstream,
    },
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_LLAMACPP_API_URL: &str = "http://localhost:8080/v1";

pub(crate) struct LlamaCppProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ApiProviderConfig,
    retry: RetryConfig,
}

impl LlamaCppProvider {
    pub fn new(name: String, config: ApiProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_LLAMACPP_API_URL.to_string());

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

    fn wire(&self, mut request: ChatRequest, stream: bool) -> OpenAiRequest {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        merge_consecutive_roles(&mut request);

        let mut wire = OpenAiRequest::from(request);
        wire.stream = stream;
        wire
    }

    fn builder(&self, wire: &OpenAiRequest, context: &RequestContext) -> crate::Result<reqwest::RequestBuilder> {
        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize llama.cpp request: {e}");
            LlmError::Internal(None)
        })?;

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.config.timeout)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body);

        // llama.cpp usually runs unauthenticated; send a key only when
        // one is configured or provided by the caller.
        if let Some(key) = context.api_key.as_ref().or(self.config.api_key.as_ref()) {
            builder = builder.header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", key.expose_secret()),
            );
        }

        Ok(builder)
    }
}

#[async_trait]
impl Provider for LlamaCppProvider {
    async fn chat(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        let requested_model = request.model.clone();
        let wire = self.wire(request, false);

        let response = transport::send_with_retry(self.builder(&wire, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read llama.cpp response body: {e}");
            LlmError::Internal(None)
        })?;

        let wire_response: OpenAiResponse = parse_upstream(&body, &self.name)?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Message, Role};

    #[test]
    fn consecutive_roles_are_merged_before_dispatch() {
        let provider = LlamaCppProvider::new("llamacpp".into(), ApiProviderConfig::default());

        let request = ChatRequest {
            model: "local".into(),
            system: None,
            messages: vec![
                Message::text(Role::User, "first"),
                Message::text(Role::User, "second"),
                Message::text(Role::Assistant, "reply"),
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

        let wire = provider.wire(request, false);

        assert_eq!(wire.messages.len(), 2);
        assert_eq!(wire.messages[0].role, "user");
        assert_eq!(wire.messages[0].content.as_deref(), Some("first\nsecond"));
    }
}
