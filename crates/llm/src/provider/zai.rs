//! Z.AI-style adapter: OpenAI-compatible wire behind a provider-scoped
//! concurrency semaphore. The upstream rate-limits aggressively, so calls
//! queue FIFO behind a small number of permits instead of failing.

use std::sync::Arc;

use async_trait::async_trait;
use lynkr_config::{RetryConfig, ZaiProviderConfig};
use secrecy::ExposeSecret;
use tokio::sync::Semaphore;

use crate::{
    error::LlmError,
    http_client::http_client,
    messages::{ChatRequest, ChatResponse},
    provider::{
        Capabilities, Provider, error_for_status,
        openai::{input::OpenAiRequest, output::OpenAiResponse},
        parse_upstream,
    },
    request::RequestContext,
    transport::{self, StreamingResponse},
};

const DEFAULT_ZAI_API_URL: &str = "https://api.z.ai/api/paas/v4";

pub(crate) struct ZaiProvider {
    client: reqwest::Client,
    base_url: String,
    name: String,
    config: ZaiProviderConfig,
    semaphore: Arc<Semaphore>,
    retry: RetryConfig,
}

impl ZaiProvider {
    pub fn new(name: String, config: ZaiProviderConfig) -> Self {
        let base_url = config.base_url.clone().unwrap_or_else(|| DEFAULT_ZAI_API_URL.to_string());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            client: http_client(),
            base_url,
            name,
            config,
            semaphore,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn builder(&self, wire: &OpenAiRequest, context: &RequestContext) -> crate::Result<reqwest::RequestBuilder> {
        let api_key = context
            .api_key
            .clone()
            .or_else(|| self.config.api_key.clone())
            .ok_or_else(|| LlmError::ProviderUnavailable(format!("{}: no API key configured", self.name)))?;

        let body = sonic_rs::to_vec(wire).map_err(|e| {
            log::error!("Failed to serialize Z.AI request: {e}");
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
impl Provider for ZaiProvider {
    async fn chat(&self, mut request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse> {
        if request.model.is_empty()
            && let Some(model) = &self.config.model
        {
            request.model = model.clone();
        }

        let requested_model = request.model.clone();
        let mut wire = OpenAiRequest::from(request);
        wire.stream = false;

        // Tokio semaphores queue waiters FIFO, which keeps ordering fair
        // under contention.
        let _permit = self.semaphore.acquire().await.map_err(|_| LlmError::Shutdown)?;

        let response = transport::send_with_retry(self.builder(&wire, context)?, &self.name, &self.retry).await?;

        if !response.status().is_success() {
            return Err(error_for_status(response, &self.name).await);
        }

        let body = response.text().await.map_err(|e| {
            log::error!("Failed to read Z.AI response body: {e}");
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

        let _permit = self.semaphore.acquire().await.map_err(|_| LlmError::Shutdown)?;

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
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };
    use std::time::Duration;

    use axum::{Json, Router, extract::State, response::IntoResponse, routing::post};
    use secrecy::SecretString;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;
    use crate::messages::{Message, Role};

    #[derive(Clone)]
    struct GaugeState {
        in_flight: Arc<AtomicU32>,
        peak: Arc<AtomicU32>,
    }

    async fn slow_handler(State(state): State<GaugeState>) -> impl IntoResponse {
        let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(50)).await;
        state.in_flight.fetch_sub(1, Ordering::SeqCst);

        Json(json!({
            "id": "chatcmpl-1",
            "model": "glm-4.7",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "ok"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
        }))
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_the_semaphore() {
        let state = GaugeState {
            in_flight: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
        };

        let app = Router::new()
            .route("/chat/completions", post(slow_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = Arc::new(ZaiProvider::new(
            "zai".to_string(),
            ZaiProviderConfig {
                api_key: Some(SecretString::from("key".to_string())),
                base_url: Some(format!("http://{address}")),
                max_concurrent: 2,
                ..Default::default()
            },
        ));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                let request = ChatRequest {
                    model: "glm-4.7".into(),
                    system: None,
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

                provider.chat(request, &RequestContext::default()).await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(state.peak.load(Ordering::SeqCst) <= 2);
    }
}
