//! Per-upstream adapters between the canonical schema and each wire dialect.
//!
//! Adapters are stateless: they build the upstream payload, invoke the
//! transport, and convert the response back. Resilience (retry, breaker,
//! fallback) lives in the dispatcher, not here.

pub(crate) mod anthropic;
pub(crate) mod bedrock;
pub(crate) mod google;
pub(crate) mod llamacpp;
pub(crate) mod ollama;
pub(crate) mod openai;
pub(crate) mod openai_responses;
pub(crate) mod zai;

use async_trait::async_trait;
use lynkr_config::{LlmConfig, LlmProviderConfig};
use secrecy::SecretString;

use crate::{
    error::LlmError,
    messages::{ChatRequest, ChatResponse},
    request::RequestContext,
    transport::StreamingResponse,
};

/// What an upstream dialect can do.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// The dialect understands tool declarations and tool_use turns.
    pub supports_tools: bool,
    /// The dialect can stream.
    pub supports_streaming: bool,
    /// The dialect speaks the canonical schema natively.
    pub natively_anthropic: bool,
}

/// A stateless upstream adapter.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute one non-streaming model call.
    async fn chat(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<ChatResponse>;

    /// Execute one streaming model call, returning the raw upstream body.
    async fn chat_stream(&self, request: ChatRequest, context: &RequestContext) -> crate::Result<StreamingResponse>;

    /// Capability flags for this upstream.
    fn capabilities(&self) -> Capabilities;

    /// Configured provider name.
    fn name(&self) -> &str;
}

/// Build every configured provider.
pub async fn build_providers(
    config: &LlmConfig,
) -> crate::Result<indexmap::IndexMap<String, Box<dyn Provider>>> {
    let mut providers: indexmap::IndexMap<String, Box<dyn Provider>> = indexmap::IndexMap::new();

    let retry = config.retry;

    for (name, provider_config) in &config.providers {
        log::debug!("Initializing provider: {name}");

        let provider: Box<dyn Provider> = match provider_config.clone() {
            LlmProviderConfig::Anthropic(api) => {
                Box::new(anthropic::AnthropicProvider::new(name.clone(), api).with_retry(retry))
            }
            LlmProviderConfig::Openai(api) => {
                Box::new(openai::OpenAiProvider::new(name.clone(), api).with_retry(retry))
            }
            LlmProviderConfig::OpenaiResponses(api) => {
                Box::new(openai_responses::OpenAiResponsesProvider::new(name.clone(), api).with_retry(retry))
            }
            LlmProviderConfig::Ollama(ollama) => {
                Box::new(ollama::OllamaProvider::new(name.clone(), ollama).with_retry(retry))
            }
            LlmProviderConfig::Llamacpp(api) => {
                Box::new(llamacpp::LlamaCppProvider::new(name.clone(), api).with_retry(retry))
            }
            LlmProviderConfig::Bedrock(bedrock) => {
                Box::new(bedrock::BedrockProvider::new(name.clone(), bedrock).await)
            }
            LlmProviderConfig::Google(api) => {
                Box::new(google::GoogleProvider::new(name.clone(), api).with_retry(retry))
            }
            LlmProviderConfig::Zai(zai) => Box::new(zai::ZaiProvider::new(name.clone(), zai).with_retry(retry)),
        };

        providers.insert(name.clone(), provider);
    }

    if providers.is_empty() {
        return Err(LlmError::Internal(Some(
            "Failed to initialize any LLM providers.".to_string(),
        )));
    }

    log::debug!("initialized {} active provider(s)", providers.len());

    Ok(providers)
}

/// Resolve the API key for a call: a BYOK header overrides the configured key.
pub(crate) fn resolve_key(
    configured: &Option<SecretString>,
    context: &RequestContext,
    provider: &str,
) -> Result<SecretString, LlmError> {
    context
        .api_key
        .clone()
        .or_else(|| configured.clone())
        .ok_or_else(|| LlmError::ProviderUnavailable(format!("{provider}: no API key configured")))
}

/// Map a non-2xx upstream response to the error taxonomy, consuming the body.
pub(crate) async fn error_for_status(response: reqwest::Response, provider: &str) -> LlmError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

    log::error!("{provider} API error ({status}): {body}");

    LlmError::HttpError { status, body }
}

/// Parse a JSON upstream body, distinguishing non-JSON from wrong-shape.
pub(crate) fn parse_upstream<T: serde::de::DeserializeOwned>(body: &str, provider: &str) -> Result<T, LlmError> {
    let value: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        log::error!("{provider} returned a non-JSON body: {e}");
        LlmError::MalformedResponse(format!("{provider}: {e}"))
    })?;

    serde_json::from_value(value).map_err(|e| {
        log::error!("{provider} returned an unrecognised shape: {e}");
        LlmError::SchemaError(format!("{provider}: {e}"))
    })
}

/// Merge consecutive same-role messages into one turn. Local runtimes
/// (Ollama, llama.cpp) reject alternation violations outright.
pub(crate) fn merge_consecutive_roles(request: &mut ChatRequest) {
    use crate::messages::{Message, MessageContent};

    let messages = std::mem::take(&mut request.messages);
    let mut merged: Vec<Message> = Vec::with_capacity(messages.len());

    for message in messages {
        match merged.last_mut() {
            Some(previous) if previous.role == message.role => {
                let mut blocks = previous.content.to_blocks();
                blocks.extend(message.content.to_blocks());
                previous.content = MessageContent::Blocks(blocks);
            }
            _ => merged.push(message),
        }
    }

    request.messages = merged;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::messages::{ContentBlock, Message, MessageContent, Role};

    #[test]
    fn consecutive_same_role_turns_are_merged() {
        let mut request = ChatRequest {
            model: "m".into(),
            system: None,
            messages: vec![
                Message::text(Role::User, "one"),
                Message::text(Role::User, "two"),
                Message::text(Role::Assistant, "three"),
                Message::blocks(
                    Role::Assistant,
                    vec![ContentBlock::ToolUse {
                        id: "t1".into(),
                        name: "WebSearch".into(),
                        input: json!({}),
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

        merge_consecutive_roles(&mut request);

        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::User);
        assert!(matches!(&request.messages[0].content, MessageContent::Blocks(blocks) if blocks.len() == 2));
        assert!(request.messages[1].content.has_tool_use());
    }
}
