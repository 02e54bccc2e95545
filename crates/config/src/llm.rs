//! Upstream provider, routing and transport resilience configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use indexmap::IndexMap;
use regex::{Regex, RegexBuilder};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

/// Top-level LLM configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct LlmConfig {
    /// Configured upstream providers, keyed by name.
    pub providers: IndexMap<String, LlmProviderConfig>,

    /// Name of the provider used when routing makes no other decision.
    /// Overridden by `MODEL_PROVIDER`.
    pub default_provider: Option<String>,

    /// Routing policy between local and cloud providers.
    pub routing: RoutingConfig,

    /// Fallback policy when the primary provider fails.
    pub fallback: FallbackConfig,

    /// Per-upstream circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Transport retry policy for non-streaming requests.
    pub retry: RetryConfig,

    /// When false, adapters never inject the standard tool set into
    /// requests that carry no tool declarations.
    pub inject_standard_tools: bool,
}

impl LlmConfig {
    /// Whether at least one provider is configured.
    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }
}

/// Configuration for a single upstream provider, tagged by dialect.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmProviderConfig {
    /// Anthropic-style messages API.
    Anthropic(ApiProviderConfig),
    /// OpenAI-style chat completions API.
    Openai(ApiProviderConfig),
    /// OpenAI-style "responses" API with flat typed input items.
    OpenaiResponses(ApiProviderConfig),
    /// Ollama local runtime chat API.
    Ollama(OllamaProviderConfig),
    /// llama.cpp server with an OpenAI-compatible surface.
    Llamacpp(ApiProviderConfig),
    /// AWS Bedrock Converse API.
    Bedrock(BedrockProviderConfig),
    /// Google Gemini generateContent API.
    Google(ApiProviderConfig),
    /// Z.AI-style endpoint, OpenAI-compatible behind a concurrency bound.
    Zai(ZaiProviderConfig),
}

impl LlmProviderConfig {
    /// The dialect this provider speaks.
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Anthropic(_) => ProviderKind::Anthropic,
            Self::Openai(_) => ProviderKind::Openai,
            Self::OpenaiResponses(_) => ProviderKind::OpenaiResponses,
            Self::Ollama(_) => ProviderKind::Ollama,
            Self::Llamacpp(_) => ProviderKind::Llamacpp,
            Self::Bedrock(_) => ProviderKind::Bedrock,
            Self::Google(_) => ProviderKind::Google,
            Self::Zai(_) => ProviderKind::Zai,
        }
    }

    /// Whether the provider runs on the local machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Ollama(_) | Self::Llamacpp(_))
    }
}

/// Upstream dialect discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Anthropic messages dialect.
    Anthropic,
    /// OpenAI chat completions dialect.
    Openai,
    /// OpenAI responses dialect.
    OpenaiResponses,
    /// Ollama chat dialect.
    Ollama,
    /// llama.cpp OpenAI-compatible dialect.
    Llamacpp,
    /// Bedrock Converse dialect.
    Bedrock,
    /// Google Gemini dialect.
    Google,
    /// Z.AI dialect.
    Zai,
}

impl ProviderKind {
    /// Whether this dialect runs on the local machine.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Ollama | Self::Llamacpp)
    }
}

/// Configuration shared by API-key based HTTP providers.
///
/// Endpoint, key and model can also be set per provider through the
/// `<PROVIDER>_ENDPOINT`, `<PROVIDER>_API_KEY` and `<PROVIDER>_MODEL`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiProviderConfig {
    /// API key used to authenticate with the upstream.
    pub api_key: Option<SecretString>,

    /// Custom base URL. Falls back to the dialect default.
    pub base_url: Option<String>,

    /// Model sent upstream when the client request carries none.
    pub model: Option<String>,

    /// Hard timeout for a single upstream call.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl ApiProviderConfig {
    /// Default upstream call timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
}

impl Default for ApiProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Ollama provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OllamaProviderConfig {
    /// Base URL of the Ollama server.
    pub base_url: String,

    /// Model to run.
    pub model: Option<String>,

    /// Hard timeout for a single upstream call.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: None,
            timeout: ApiProviderConfig::DEFAULT_TIMEOUT,
        }
    }
}

/// Bedrock provider configuration. Credentials come from the standard AWS
/// credential chain; only region and model are configured here.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BedrockProviderConfig {
    /// AWS region hosting the models.
    pub region: Option<String>,

    /// Model identifier sent to Converse.
    pub model: Option<String>,
}

/// Z.AI-style provider configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ZaiProviderConfig {
    /// API key used to authenticate with the upstream.
    pub api_key: Option<SecretString>,

    /// Custom base URL.
    pub base_url: Option<String>,

    /// Model sent upstream when the client request carries none.
    pub model: Option<String>,

    /// Maximum concurrent in-flight requests to this upstream.
    /// Overridden by `ZAI_MAX_CONCURRENT`.
    pub max_concurrent: usize,

    /// Hard timeout for a single upstream call.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for ZaiProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            model: None,
            max_concurrent: 2,
            timeout: ApiProviderConfig::DEFAULT_TIMEOUT,
        }
    }
}

/// Routing policy between a local and a cloud provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Route to the local provider when heuristics allow it.
    /// Overridden by `PREFER_OLLAMA`.
    pub prefer_local: bool,

    /// Name of the local provider used when `prefer_local` is on.
    pub local_provider: Option<String>,

    /// Name of the cloud provider used when heuristics route away from local.
    pub cloud_provider: Option<String>,

    /// Requests with more tools than this never route to the local provider.
    /// Overridden by `OLLAMA_MAX_TOOLS_FOR_ROUTING`.
    pub ollama_max_tools: usize,

    /// Complexity score at or above which requests route to the cloud.
    pub complexity_threshold: f64,

    /// Message patterns that force a routing decision before any other heuristic.
    pub force: ForcePatterns,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            prefer_local: false,
            local_provider: None,
            cloud_provider: None,
            ollama_max_tools: 4,
            complexity_threshold: 0.55,
            force: ForcePatterns::default(),
        }
    }
}

/// Regex patterns forcing a request to the local or cloud provider.
#[derive(Debug, Clone, Default)]
pub struct ForcePatterns {
    /// Patterns that force local routing.
    pub local: Vec<Regex>,
    /// Patterns that force cloud routing.
    pub cloud: Vec<Regex>,
}

impl<'de> Deserialize<'de> for ForcePatterns {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize, Default)]
        #[serde(default, deny_unknown_fields)]
        struct Raw {
            local: Vec<String>,
            cloud: Vec<String>,
        }

        fn compile<E: serde::de::Error>(patterns: Vec<String>) -> Result<Vec<Regex>, E> {
            patterns
                .into_iter()
                .map(|p| {
                    RegexBuilder::new(&p)
                        .case_insensitive(true)
                        .build()
                        .map_err(|e| E::custom(format!("invalid force pattern {p:?}: {e}")))
                })
                .collect()
        }

        let raw = Raw::deserialize(deserializer)?;

        Ok(Self {
            local: compile(raw.local)?,
            cloud: compile(raw.cloud)?,
        })
    }
}

/// Fallback policy applied when a local primary fails.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// Whether fallback is enabled. Overridden by `FALLBACK_ENABLED`.
    pub enabled: bool,

    /// Name of the fallback provider. Overridden by `FALLBACK_PROVIDER`.
    pub provider: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: None,
        }
    }
}

/// Per-upstream circuit breaker thresholds.
///
/// Overridden by `CIRCUIT_BREAKER_FAILURE_THRESHOLD`,
/// `CIRCUIT_BREAKER_SUCCESS_THRESHOLD` and `CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Consecutive half-open successes before the breaker closes.
    pub success_threshold: u32,

    /// Time an open breaker rejects before allowing a probe.
    #[serde(deserialize_with = "deserialize_duration")]
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Transport retry policy. Applies only to non-streaming requests and only
/// to transient failure classes.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial request.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(deserialize_with = "deserialize_duration")]
    pub initial_delay: Duration,

    /// Upper bound on the backoff delay.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}
