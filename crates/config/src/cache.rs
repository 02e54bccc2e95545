//! Prompt cache configuration.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

/// Prompt cache configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Exact-match response cache.
    pub exact: ExactCacheConfig,

    /// Embedding-based semantic cache.
    pub semantic: SemanticCacheConfig,
}

/// Exact-match response cache keyed by a canonical request hash.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExactCacheConfig {
    /// Whether the exact cache is active.
    pub enabled: bool,

    /// Maximum cached responses.
    pub capacity: u64,

    /// Entry time to live.
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
}

impl Default for ExactCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 256,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Embedding-based semantic cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SemanticCacheConfig {
    /// Whether the semantic cache is active.
    pub enabled: bool,

    /// Embeddings endpoint, Ollama-compatible (`/api/embeddings`).
    pub embeddings_url: Option<String>,

    /// Embedding model name.
    pub embeddings_model: Option<String>,

    /// Cosine similarity at or above which an entry is a hit.
    pub similarity_threshold: f32,

    /// Maximum cached entries.
    pub capacity: u64,

    /// Entry time to live.
    #[serde(deserialize_with = "deserialize_duration")]
    pub ttl: Duration,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            embeddings_url: None,
            embeddings_model: None,
            similarity_threshold: 0.92,
            capacity: 256,
            ttl: Duration::from_secs(600),
        }
    }
}
