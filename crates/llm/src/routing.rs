//! Provider selection heuristics.
//!
//! Routing is static unless "prefer local" is on. With it on, force patterns
//! win, then tool-count thresholds, then a numeric complexity score compared
//! against a configured threshold.

use std::sync::OnceLock;

use lynkr_config::LlmConfig;
use tiktoken_rs::CoreBPE;

use crate::{
    error::LlmError,
    messages::ChatRequest,
    provider::ollama::model_supports_tools,
};

/// How the dispatcher arrived at a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RoutingMethod {
    /// The configured default provider, no heuristics involved.
    Static,
    /// A force pattern matched the last user message.
    Force,
    /// The tool count decided local vs cloud.
    ToolThreshold,
    /// The complexity score decided local vs cloud.
    Complexity,
    /// The caller disabled fallback, pinning the primary.
    FallbackDisabled,
    /// The response came from the fallback provider.
    Fallback,
}

/// The routing decision recorded for metrics and exposed via headers.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Selected provider name.
    pub provider: String,
    /// Heuristic that made the choice.
    pub method: RoutingMethod,
    /// Complexity score, when the complexity path ran.
    pub score: Option<f64>,
    /// Complexity threshold, when the complexity path ran.
    pub threshold: Option<f64>,
    /// Human-readable explanation.
    pub reason: String,
}

impl RoutingDecision {
    fn fixed(provider: String, reason: impl Into<String>) -> Self {
        Self {
            provider,
            method: RoutingMethod::Static,
            score: None,
            threshold: None,
            reason: reason.into(),
        }
    }
}

/// Pick the primary provider for a sanitised request.
pub(crate) fn determine_provider(request: &ChatRequest, config: &LlmConfig) -> Result<RoutingDecision, LlmError> {
    let default = config
        .default_provider
        .clone()
        .or_else(|| config.providers.keys().next().cloned())
        .ok_or_else(|| LlmError::ProviderUnavailable("none configured".to_string()))?;

    if !config.routing.prefer_local {
        return Ok(RoutingDecision::fixed(default, "static provider selection"));
    }

    let local = config
        .routing
        .local_provider
        .clone()
        .unwrap_or_else(|| default.clone());

    let cloud = config
        .routing
        .cloud_provider
        .clone()
        .or_else(|| config.fallback.provider.clone())
        .unwrap_or_else(|| default.clone());

    let last_user = request.last_user_text().unwrap_or_default();

    for pattern in &config.routing.force.local {
        if pattern.is_match(&last_user) {
            return Ok(RoutingDecision {
                provider: local,
                method: RoutingMethod::Force,
                score: None,
                threshold: None,
                reason: format!("force pattern {:?} matched", pattern.as_str()),
            });
        }
    }

    for pattern in &config.routing.force.cloud {
        if pattern.is_match(&last_user) {
            return Ok(RoutingDecision {
                provider: cloud,
                method: RoutingMethod::Force,
                score: None,
                threshold: None,
                reason: format!("force pattern {:?} matched", pattern.as_str()),
            });
        }
    }

    let tool_count = request.tool_count();

    if tool_count > 0 {
        let local_model = config
            .providers
            .get(&local)
            .and_then(|provider| match provider {
                lynkr_config::LlmProviderConfig::Ollama(ollama) => ollama.model.clone(),
                _ => None,
            })
            .unwrap_or_default();

        if tool_count <= config.routing.ollama_max_tools && model_supports_tools(&local_model) {
            return Ok(RoutingDecision {
                provider: local,
                method: RoutingMethod::ToolThreshold,
                score: None,
                threshold: None,
                reason: format!("{tool_count} tools within local limit"),
            });
        }

        return Ok(RoutingDecision {
            provider: cloud,
            method: RoutingMethod::ToolThreshold,
            score: None,
            threshold: None,
            reason: format!(
                "{tool_count} tools exceed local limit of {}",
                config.routing.ollama_max_tools
            ),
        });
    }

    let score = complexity_score(request);
    let threshold = config.routing.complexity_threshold;

    let (provider, reason) = if score >= threshold {
        (cloud, format!("complexity {score:.2} at or above threshold {threshold:.2}"))
    } else {
        (local, format!("complexity {score:.2} below threshold {threshold:.2}"))
    };

    Ok(RoutingDecision {
        provider,
        method: RoutingMethod::Complexity,
        score: Some(score),
        threshold: Some(threshold),
        reason,
    })
}

fn bpe() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base vocabulary is embedded"))
}

/// Numeric complexity of a request in [0, 1].
///
/// Signals: prompt length in tokens, conversation depth, code fences, and
/// analysis keywords. Crude, but it only has to separate "short chat" from
/// "long technical work".
pub fn complexity_score(request: &ChatRequest) -> f64 {
    let last_user = request.last_user_text().unwrap_or_default();

    let token_count = bpe().encode_ordinary(&last_user).len() as f64;
    let token_signal = (token_count / 600.0).min(1.0);

    let depth_signal = (request.messages.len() as f64 / 20.0).min(1.0);

    let code_signal = if last_user.contains("```") { 1.0 } else { 0.0 };

    const KEYWORDS: &[&str] = &[
        "refactor",
        "architecture",
        "analyze",
        "analyse",
        "debug",
        "implement",
        "optimize",
        "stack trace",
    ];
    let lowered = last_user.to_lowercase();
    let keyword_hits = KEYWORDS.iter().filter(|k| lowered.contains(**k)).count() as f64;
    let keyword_signal = (keyword_hits / 3.0).min(1.0);

    0.4 * token_signal + 0.2 * depth_signal + 0.2 * code_signal + 0.2 * keyword_signal
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::messages::{Message, Role};

    fn request_with(text: &str, tools: usize) -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            system: None,
            messages: vec![Message::text(Role::User, text)],
            tools: (tools > 0).then(|| {
                (0..tools)
                    .map(|i| crate::messages::ToolDefinition {
                        name: format!("tool_{i}"),
                        description: None,
                        input_schema: serde_json::json!({"type": "object"}),
                    })
                    .collect()
            }),
            tool_choice: None,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stream: None,
            metadata: None,
            extra: serde_json::Map::new(),
        }
    }

    fn config(toml: &str) -> LlmConfig {
        let config: lynkr_config::Config = toml::from_str(toml).unwrap();
        config.llm
    }

    const PREFER_LOCAL: &str = indoc! {r#"
        [llm]
        default_provider = "ollama"

        [llm.providers.ollama]
        type = "ollama"
        model = "qwen2.5:7b"

        [llm.providers.anthropic]
        type = "anthropic"

        [llm.routing]
        prefer_local = true
        local_provider = "ollama"
        cloud_provider = "anthropic"
        ollama_max_tools = 4

        [llm.routing.force]
        cloud = ["deep analysis"]
    "#};

    #[test]
    fn static_routing_without_prefer_local() {
        let config = config(indoc! {r#"
            [llm]
            default_provider = "anthropic"

            [llm.providers.anthropic]
            type = "anthropic"
        "#});

        let decision = determine_provider(&request_with("hi", 0), &config).unwrap();
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.method, RoutingMethod::Static);
    }

    #[test]
    fn force_pattern_wins_over_everything() {
        let config = config(PREFER_LOCAL);

        let decision = determine_provider(&request_with("please run a deep analysis of this", 3), &config).unwrap();
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.method, RoutingMethod::Force);
    }

    #[test]
    fn small_tool_count_routes_local() {
        let config = config(PREFER_LOCAL);

        let decision = determine_provider(&request_with("look this up", 3), &config).unwrap();
        assert_eq!(decision.provider, "ollama");
        assert_eq!(decision.method, RoutingMethod::ToolThreshold);
    }

    #[test]
    fn large_tool_count_routes_cloud() {
        let config = config(PREFER_LOCAL);

        let decision = determine_provider(&request_with("look this up", 9), &config).unwrap();
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.method, RoutingMethod::ToolThreshold);
    }

    #[test]
    fn non_tool_local_model_routes_tools_to_cloud() {
        let mut config = config(PREFER_LOCAL);
        if let Some(lynkr_config::LlmProviderConfig::Ollama(ollama)) = config.providers.get_mut("ollama") {
            ollama.model = Some("gemma2:9b".to_string());
        }

        let decision = determine_provider(&request_with("look this up", 2), &config).unwrap();
        assert_eq!(decision.provider, "anthropic");
    }

    #[test]
    fn no_tools_runs_the_complexity_analyser() {
        let config = config(PREFER_LOCAL);

        let simple = determine_provider(&request_with("hi there", 0), &config).unwrap();
        assert_eq!(simple.method, RoutingMethod::Complexity);
        assert_eq!(simple.provider, "ollama");
        assert!(simple.score.is_some());
        assert!(simple.threshold.is_some());

        let hard_prompt = format!(
            "Refactor this architecture and debug the stack trace:\n```rust\n{}\n```",
            "fn main() {}\n".repeat(400)
        );
        let hard = determine_provider(&request_with(&hard_prompt, 0), &config).unwrap();
        assert_eq!(hard.provider, "anthropic");
    }
}
