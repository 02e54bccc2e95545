//! The dispatcher: routing, circuit breaking and fallback around one
//! provider invocation.

use std::sync::Arc;

use indexmap::IndexMap;
use lynkr_config::LlmConfig;

use crate::{
    breaker::CircuitBreakerRegistry,
    error::LlmError,
    health::HealthTracker,
    messages::{ChatRequest, ChatResponse},
    provider::Provider,
    request::RequestContext,
    routing::{self, RoutingDecision, RoutingMethod},
    transport::StreamingResponse,
};

/// How a primary failure is classified before the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureCategory {
    /// The breaker rejected the call outright.
    CircuitBreaker,
    /// The upstream call timed out.
    Timeout,
    /// The upstream answered 503.
    ServiceUnavailable,
    /// The upstream rejected the tool payload.
    ToolIncompatible,
    /// The upstream answered 429.
    RateLimited,
    /// Anything else.
    Error,
}

impl FailureCategory {
    fn classify(error: &LlmError) -> Self {
        match error {
            LlmError::CircuitOpen { .. } => Self::CircuitBreaker,
            LlmError::TransportError(message) if message.contains("timed out") || message.contains("timeout") => {
                Self::Timeout
            }
            LlmError::HttpError { status: 503, .. } => Self::ServiceUnavailable,
            LlmError::HttpError { status: 429, .. } => Self::RateLimited,
            LlmError::HttpError { status: 400, body } if body.contains("tool") => Self::ToolIncompatible,
            _ => Self::Error,
        }
    }
}

/// Either a complete response or a raw streaming body.
#[derive(Debug)]
pub enum Reply {
    /// Parsed canonical response.
    Message(Box<ChatResponse>),
    /// Raw streaming pass-through.
    Stream(StreamingResponse),
}

/// Dispatch result plus the metadata the orchestrator attaches to headers.
#[derive(Debug)]
pub struct Dispatched {
    /// The upstream reply.
    pub reply: Reply,
    /// Provider that actually served the request (fallback included).
    pub actual_provider: String,
    /// How routing picked the primary.
    pub decision: RoutingDecision,
}

/// Routes a sanitised request to a provider, guards the call with the
/// upstream's circuit breaker, and optionally retries through the fallback
/// provider when a local primary fails.
pub struct Dispatcher {
    providers: IndexMap<String, Box<dyn Provider>>,
    breakers: Arc<CircuitBreakerRegistry>,
    health: Arc<HealthTracker>,
    config: LlmConfig,
}

impl Dispatcher {
    /// Assemble a dispatcher from its lifecycle objects.
    pub fn new(
        providers: IndexMap<String, Box<dyn Provider>>,
        breakers: Arc<CircuitBreakerRegistry>,
        health: Arc<HealthTracker>,
        config: LlmConfig,
    ) -> Self {
        Self {
            providers,
            breakers,
            health,
            config,
        }
    }

    /// Breaker registry, for the status surface.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Health tracker, for the status surface.
    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Dispatch one request: route, call through the breaker, fall back when
    /// allowed, and report which provider actually answered.
    pub async fn dispatch(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<Dispatched> {
        let mut decision = routing::determine_provider(&request, &self.config)?;
        let primary = decision.provider.clone();

        match self.call_guarded(&primary, request.clone(), context).await {
            Ok(reply) => Ok(Dispatched {
                reply,
                actual_provider: primary,
                decision,
            }),
            Err(error) => {
                let category = FailureCategory::classify(&error);
                log::warn!("provider '{primary}' failed ({category}): {error}");

                let primary_is_local = self
                    .config
                    .providers
                    .get(&primary)
                    .is_some_and(|provider| provider.is_local());

                let fallback = self
                    .config
                    .fallback
                    .provider
                    .clone()
                    .filter(|name| *name != primary);

                if !primary_is_local || !self.config.fallback.enabled || fallback.is_none() {
                    return Err(error);
                }

                if context.fallback_disabled {
                    decision.method = RoutingMethod::FallbackDisabled;
                    decision.reason = format!("fallback disabled by caller after {category}");
                    return Err(error);
                }

                let fallback = fallback.unwrap_or_default();
                log::info!("falling back from '{primary}' to '{fallback}' after {category}");

                // The fallback runs through its own breaker; its outcome never
                // touches the primary's counters.
                let reply = self.call_guarded(&fallback, request, context).await?;

                decision.method = RoutingMethod::Fallback;
                decision.reason = format!("fell back from {primary} after {category}");

                Ok(Dispatched {
                    reply,
                    actual_provider: fallback,
                    decision,
                })
            }
        }
    }

    /// One provider invocation inside its circuit breaker, honouring the
    /// shutdown token. A cancelled call counts neither success nor failure.
    async fn call_guarded(&self, name: &str, request: ChatRequest, context: &RequestContext) -> crate::Result<Reply> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| LlmError::ProviderUnavailable(name.to_string()))?;

        let breaker = self.breakers.get(name);

        breaker.try_acquire().map_err(|retry_after| LlmError::CircuitOpen {
            provider: name.to_string(),
            retry_after,
        })?;

        let wants_stream = request.stream.unwrap_or(false) && provider.capabilities().supports_streaming;

        let outcome = if wants_stream {
            let call = provider.chat_stream(request, context);

            tokio::select! {
                biased;
                _ = context.shutdown.cancelled() => {
                    breaker.record_cancelled();
                    return Err(LlmError::Shutdown);
                }
                result = call => result.map(Reply::Stream),
            }
        } else {
            let call = provider.chat(request, context);

            tokio::select! {
                biased;
                _ = context.shutdown.cancelled() => {
                    breaker.record_cancelled();
                    return Err(LlmError::Shutdown);
                }
                result = call => result.map(|response| Reply::Message(Box::new(response))),
            }
        };

        match &outcome {
            Ok(_) => {
                breaker.record_success();
                self.health.record_success(name);
            }
            Err(error) => {
                breaker.record_failure();
                self.health.record_failure(name, &error.to_string());
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use lynkr_config::Config;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;
    use crate::messages::{Message, Role};
    use crate::provider::Capabilities;

    struct ScriptedProvider {
        name: String,
        calls: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(&self, request: ChatRequest, _: &RequestContext) -> crate::Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                Err(LlmError::HttpError {
                    status: 503,
                    body: "down".to_string(),
                })
            } else {
                Ok(ChatResponse::synthetic(request.model, format!("from {}", self.name)))
            }
        }

        async fn chat_stream(&self, _: ChatRequest, _: &RequestContext) -> crate::Result<StreamingResponse> {
            Err(LlmError::Internal(None))
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

    fn fixture(fail_primary: bool) -> (Dispatcher, Arc<AtomicU32>, Arc<AtomicU32>) {
        let config: Config = toml::from_str(indoc::indoc! {r#"
            [llm]
            default_provider = "ollama"

            [llm.fallback]
            enabled = true
            provider = "anthropic"

            [llm.providers.ollama]
            type = "ollama"

            [llm.providers.anthropic]
            type = "anthropic"
        "#})
        .unwrap();

        let primary_calls = Arc::new(AtomicU32::new(0));
        let fallback_calls = Arc::new(AtomicU32::new(0));

        let mut providers: IndexMap<String, Box<dyn Provider>> = IndexMap::new();
        providers.insert(
            "ollama".to_string(),
            Box::new(ScriptedProvider {
                name: "ollama".to_string(),
                calls: primary_calls.clone(),
                fail: fail_primary,
            }),
        );
        providers.insert(
            "anthropic".to_string(),
            Box::new(ScriptedProvider {
                name: "anthropic".to_string(),
                calls: fallback_calls.clone(),
                fail: false,
            }),
        );

        let dispatcher = Dispatcher::new(
            providers,
            Arc::new(CircuitBreakerRegistry::new(config.llm.circuit_breaker)),
            HealthTracker::new(),
            config.llm,
        );

        (dispatcher, primary_calls, fallback_calls)
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
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
        }
    }

    #[tokio::test]
    async fn healthy_primary_serves_the_request() {
        let (dispatcher, primary_calls, fallback_calls) = fixture(false);

        let dispatched = dispatcher.dispatch(request(), &RequestContext::default()).await.unwrap();

        assert_eq!(dispatched.actual_provider, "ollama");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn local_failure_falls_back_to_cloud() {
        let (dispatcher, primary_calls, fallback_calls) = fixture(true);

        let dispatched = dispatcher.dispatch(request(), &RequestContext::default()).await.unwrap();

        assert_eq!(dispatched.actual_provider, "anthropic");
        assert_eq!(dispatched.decision.method, RoutingMethod::Fallback);
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);

        let Reply::Message(response) = dispatched.reply else {
            unreachable!("expected message reply");
        };
        assert_eq!(response.text(), "from anthropic");
    }

    #[tokio::test]
    async fn caller_can_pin_the_primary() {
        let (dispatcher, _, fallback_calls) = fixture(true);

        let context = RequestContext {
            fallback_disabled: true,
            ..Default::default()
        };

        let error = dispatcher.dispatch(request(), &context).await.unwrap_err();

        assert!(matches!(error, LlmError::HttpError { status: 503, .. }));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_breaker_rejects_without_calling_upstream() {
        let (dispatcher, primary_calls, fallback_calls) = fixture(true);

        // Trip the primary's breaker.
        for _ in 0..5 {
            let _ = dispatcher.dispatch(request(), &RequestContext::default()).await;
        }
        assert_eq!(primary_calls.load(Ordering::SeqCst), 5);

        // The next dispatch never reaches the primary; fallback still answers.
        let dispatched = dispatcher.dispatch(request(), &RequestContext::default()).await.unwrap();

        assert_eq!(primary_calls.load(Ordering::SeqCst), 5);
        assert_eq!(dispatched.actual_provider, "anthropic");
        assert!(fallback_calls.load(Ordering::SeqCst) >= 1);

        // Primary breaker counters are untouched by fallback successes.
        let snapshots = dispatcher.breakers().snapshots();
        let (_, primary_snapshot) = snapshots.iter().find(|(name, _)| name == "ollama").unwrap();
        assert_eq!(primary_snapshot.state, "open");
    }

    #[tokio::test]
    async fn cloud_primary_does_not_fall_back() {
        let config: Config = toml::from_str(indoc::indoc! {r#"
            [llm]
            default_provider = "openai"

            [llm.fallback]
            enabled = true
            provider = "anthropic"

            [llm.providers.openai]
            type = "openai"

            [llm.providers.anthropic]
            type = "anthropic"
        "#})
        .unwrap();

        let mut providers: IndexMap<String, Box<dyn Provider>> = IndexMap::new();
        providers.insert(
            "openai".to_string(),
            Box::new(ScriptedProvider {
                name: "openai".to_string(),
                calls: Arc::new(AtomicU32::new(0)),
                fail: true,
            }),
        );
        providers.insert(
            "anthropic".to_string(),
            Box::new(ScriptedProvider {
                name: "anthropic".to_string(),
                calls: Arc::new(AtomicU32::new(0)),
                fail: false,
            }),
        );

        let dispatcher = Dispatcher::new(
            providers,
            Arc::new(CircuitBreakerRegistry::new(config.llm.circuit_breaker)),
            HealthTracker::new(),
            config.llm,
        );

        let error = dispatcher.dispatch(request(), &RequestContext::default()).await.unwrap_err();
        assert!(matches!(error, LlmError::HttpError { status: 503, .. }));
    }
}
