//! Lynkr configuration structures mapping the lynkr.toml configuration.
//!
//! Values from the TOML file can be overridden by the environment variables
//! documented on each field; `loader::load` applies both layers.

#![deny(missing_docs)]

mod agent;
mod audit;
mod cache;
mod llm;
mod loader;
mod server;

use std::path::Path;

pub use agent::{AgentConfig, LoopLimits, PolicyConfig, ToolExecutionMode, ToolRateLimit};
pub use audit::AuditConfig;
pub use cache::{CacheConfig, ExactCacheConfig, SemanticCacheConfig};
pub use llm::{
    ApiProviderConfig, BedrockProviderConfig, CircuitBreakerConfig, FallbackConfig, ForcePatterns, LlmConfig,
    LlmProviderConfig, OllamaProviderConfig, ProviderKind, RetryConfig, RoutingConfig, ZaiProviderConfig,
};
use serde::Deserialize;
pub use server::{LoadSheddingConfig, ServerConfig};

/// Main configuration structure for the Lynkr application.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Upstream provider, routing and resilience settings.
    pub llm: LlmConfig,
    /// Agent loop limits, policy and tool execution settings.
    pub agent: AgentConfig,
    /// Audit log and content dictionary settings.
    pub audit: AuditConfig,
    /// Prompt cache settings.
    pub cache: CacheConfig,
}

impl Config {
    /// Load configuration from a file path, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> anyhow::Result<Config> {
        let mut config = Config::default();
        loader::apply_env_overrides(&mut config)?;
        loader::validate(&config)?;
        Ok(config)
    }
}
