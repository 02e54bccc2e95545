use std::{path::Path, time::Duration};

use anyhow::{Context, bail};
use indoc::indoc;
use secrecy::SecretString;

use crate::{Config, LlmProviderConfig};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)?;

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.llm.has_providers() {
        bail!(indoc! {r#"
            No upstream providers configured. Lynkr requires at least one LLM provider to function.

            Example configuration:

              [llm.providers.anthropic]
              type = "anthropic"
              api_key = "sk-ant-..."

              [llm.providers.ollama]
              type = "ollama"
              base_url = "http://localhost:11434"
        "#});
    }

    if let Some(name) = &config.llm.default_provider
        && !config.llm.providers.contains_key(name)
    {
        bail!("default provider '{name}' is not configured under [llm.providers]");
    }

    if let Some(name) = &config.llm.fallback.provider
        && !config.llm.providers.contains_key(name)
    {
        bail!("fallback provider '{name}' is not configured under [llm.providers]");
    }

    if config.llm.routing.prefer_local {
        let local = config
            .llm
            .routing
            .local_provider
            .as_ref()
            .or(config.llm.default_provider.as_ref());

        match local {
            Some(name) => {
                let provider = config
                    .llm
                    .providers
                    .get(name)
                    .with_context(|| format!("local provider '{name}' is not configured under [llm.providers]"))?;

                if !provider.is_local() {
                    log::warn!("prefer_local is set but provider '{name}' is not a local runtime");
                }
            }
            None => bail!("prefer_local requires llm.routing.local_provider or llm.default_provider"),
        }
    }

    Ok(())
}

/// Apply the environment variable contract on top of file values.
pub(crate) fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Some(value) = env_var("MODEL_PROVIDER") {
        config.llm.default_provider = Some(value);
    }

    if let Some(value) = env_var("FALLBACK_ENABLED") {
        config.llm.fallback.enabled = parse_bool("FALLBACK_ENABLED", &value)?;
    }

    if let Some(value) = env_var("FALLBACK_PROVIDER") {
        config.llm.fallback.provider = Some(value);
    }

    if let Some(value) = env_var("PREFER_OLLAMA") {
        config.llm.routing.prefer_local = parse_bool("PREFER_OLLAMA", &value)?;
    }

    if let Some(value) = env_var("OLLAMA_MAX_TOOLS_FOR_ROUTING") {
        config.llm.routing.ollama_max_tools = parse_number("OLLAMA_MAX_TOOLS_FOR_ROUTING", &value)?;
    }

    if let Some(value) = env_var("CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
        config.llm.circuit_breaker.failure_threshold = parse_number("CIRCUIT_BREAKER_FAILURE_THRESHOLD", &value)?;
    }

    if let Some(value) = env_var("CIRCUIT_BREAKER_SUCCESS_THRESHOLD") {
        config.llm.circuit_breaker.success_threshold = parse_number("CIRCUIT_BREAKER_SUCCESS_THRESHOLD", &value)?;
    }

    if let Some(value) = env_var("CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS") {
        let secs: u64 = parse_number("CIRCUIT_BREAKER_OPEN_TIMEOUT_SECS", &value)?;
        config.llm.circuit_breaker.open_timeout = Duration::from_secs(secs);
    }

    if let Some(value) = env_var("LOAD_SHEDDING_ENABLED") {
        config.server.load_shedding.enabled = parse_bool("LOAD_SHEDDING_ENABLED", &value)?;
    }

    if let Some(value) = env_var("LOAD_SHEDDING_MAX_RSS_MB") {
        config.server.load_shedding.max_rss_mb = parse_number("LOAD_SHEDDING_MAX_RSS_MB", &value)?;
    }

    if let Some(value) = env_var("AUDIT_LOG_PATH") {
        config.audit.log_path = value;
    }

    if let Some(value) = env_var("AUDIT_DICTIONARY_PATH") {
        config.audit.dictionary_path = value;
    }

    if let Some(value) = env_var("LYNKR_LISTEN") {
        config.server.listen_address = Some(value.parse().context("parsing LYNKR_LISTEN")?);
    }

    apply_provider_env_overrides(config)?;

    Ok(())
}

/// Per-provider `<NAME>_ENDPOINT` / `<NAME>_API_KEY` / `<NAME>_MODEL` triples,
/// where `<NAME>` is the uppercased provider name from the configuration.
fn apply_provider_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    for (name, provider) in config.llm.providers.iter_mut() {
        let prefix = name.to_uppercase().replace(['-', '.'], "_");

        let endpoint = env_var(&format!("{prefix}_ENDPOINT"));
        let api_key = env_var(&format!("{prefix}_API_KEY"));
        let model = env_var(&format!("{prefix}_MODEL"));

        match provider {
            LlmProviderConfig::Anthropic(api)
            | LlmProviderConfig::Openai(api)
            | LlmProviderConfig::OpenaiResponses(api)
            | LlmProviderConfig::Llamacpp(api)
            | LlmProviderConfig::Google(api) => {
                if endpoint.is_some() {
                    api.base_url = endpoint;
                }
                if let Some(key) = api_key {
                    api.api_key = Some(SecretString::from(key));
                }
                if model.is_some() {
                    api.model = model;
                }
            }
            LlmProviderConfig::Ollama(ollama) => {
                if let Some(url) = endpoint {
                    ollama.base_url = url;
                }
                if model.is_some() {
                    ollama.model = model;
                }
            }
            LlmProviderConfig::Bedrock(bedrock) => {
                if let Some(region) = env_var(&format!("{prefix}_REGION")) {
                    bedrock.region = Some(region);
                }
                if model.is_some() {
                    bedrock.model = model;
                }
            }
            LlmProviderConfig::Zai(zai) => {
                if endpoint.is_some() {
                    zai.base_url = endpoint;
                }
                if let Some(key) = api_key {
                    zai.api_key = Some(SecretString::from(key));
                }
                if model.is_some() {
                    zai.model = model;
                }
                if let Some(value) = env_var("ZAI_MAX_CONCURRENT") {
                    zai.max_concurrent = parse_number("ZAI_MAX_CONCURRENT", &value)?;
                }
            }
        }
    }

    Ok(())
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{name} must be a boolean, got {other:?}"),
    }
}

fn parse_number<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().with_context(|| format!("parsing {name}"))
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use crate::{Config, LlmProviderConfig, ProviderKind};

    fn parse(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn provider_table_parses_all_dialects() {
        let config = parse(indoc! {r#"
            [llm.providers.anthropic]
            type = "anthropic"
            api_key = "sk-ant-test"

            [llm.providers.openai]
            type = "openai"
            api_key = "sk-test"

            [llm.providers.responses]
            type = "openai_responses"
            base_url = "https://api.openai.com/v1"

            [llm.providers.ollama]
            type = "ollama"
            base_url = "http://localhost:11434"
            model = "qwen2.5:7b"

            [llm.providers.llamacpp]
            type = "llamacpp"
            base_url = "http://localhost:8080/v1"

            [llm.providers.bedrock]
            type = "bedrock"
            region = "us-east-1"
            model = "anthropic.claude-3-sonnet-20240229-v1:0"

            [llm.providers.google]
            type = "google"
            api_key = "AIza-test"

            [llm.providers.zai]
            type = "zai"
            api_key = "zai-test"
            max_concurrent = 3
        "#});

        assert_eq!(config.llm.providers.len(), 8);
        assert_eq!(config.llm.providers["anthropic"].kind(), ProviderKind::Anthropic);
        assert!(config.llm.providers["ollama"].is_local());
        assert!(config.llm.providers["llamacpp"].is_local());
        assert!(!config.llm.providers["zai"].is_local());

        let LlmProviderConfig::Zai(zai) = &config.llm.providers["zai"] else {
            unreachable!("expected zai provider");
        };
        assert_eq!(zai.max_concurrent, 3);
    }

    #[test]
    fn routing_defaults() {
        let config = parse("");

        assert_eq!(config.llm.routing.ollama_max_tools, 4);
        assert!(config.llm.routing.force.local.is_empty());
    }

    #[test]
    fn force_patterns_compile_case_insensitive() {
        let config = parse(indoc! {r#"
            [llm.routing.force]
            local = ["(?:^|\\s)use local(?:$|\\s)"]
            cloud = ["deep analysis"]
        "#});

        assert!(config.llm.routing.force.local[0].is_match("please USE LOCAL model"));
        assert!(config.llm.routing.force.cloud[0].is_match("Deep Analysis of this"));
    }

    #[test]
    fn durations_parse_from_strings() {
        let config = parse(indoc! {r#"
            [llm.circuit_breaker]
            failure_threshold = 3
            open_timeout = "30s"

            [agent.limits]
            max_duration = "2m"
        "#});

        assert_eq!(config.llm.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.llm.circuit_breaker.open_timeout.as_secs(), 30);
        assert_eq!(config.agent.limits.max_duration.as_secs(), 120);
    }

    #[test]
    fn validate_rejects_unknown_default_provider() {
        let config = parse(indoc! {r#"
            [llm]
            default_provider = "missing"

            [llm.providers.anthropic]
            type = "anthropic"
        "#});

        let error = super::validate(&config).unwrap_err();
        assert!(error.to_string().contains("missing"));
    }

    #[test]
    fn validate_requires_providers() {
        let config = parse("");
        assert!(super::validate(&config).is_err());
    }

    #[test]
    fn policy_rate_limits_parse() {
        let config = parse(indoc! {r#"
            [agent.policy]
            deny = ["Bash"]

            [agent.policy.rate_limits.web_search]
            limit = 10
            interval = "1m"
        "#});

        assert_eq!(config.agent.policy.deny, vec!["Bash"]);
        assert_eq!(config.agent.policy.rate_limits["web_search"].limit, 10);
        assert_eq!(config.agent.policy.rate_limits["web_search"].interval.as_secs(), 60);
    }
}
