use lynkr_config::ExactCacheConfig;
use lynkr_llm::messages::{ChatRequest, ChatResponse, canonical_json};
use mini_moka::sync::Cache;
use serde_json::json;
use sha2::{Digest, Sha256};

/// Exact-match response cache.
///
/// The key hashes every field that affects the completion; two requests with
/// the same key are interchangeable upstream calls.
pub struct ExactCache {
    enabled: bool,
    entries: Cache<String, ChatResponse>,
}

impl ExactCache {
    /// Build from configuration.
    pub fn new(config: &ExactCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            entries: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build(),
        }
    }

    /// Canonical cache key for a request.
    pub fn key(request: &ChatRequest) -> String {
        let fingerprint = json!({
            "model": request.model,
            "system": request.system,
            "messages": request.messages,
            "tools": request.tools,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "max_tokens": request.max_tokens,
        });

        let digest = Sha256::digest(canonical_json(&fingerprint).as_bytes());

        let mut hex = String::with_capacity(32);
        for byte in digest.iter().take(16) {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    /// Stored response for a key, with the cache read marked in usage.
    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }

        let mut response = self.entries.get(&key.to_string())?;
        response.usage.cache_read_input_tokens = Some(response.usage.input_tokens);

        log::debug!("exact cache hit");
        Some(response)
    }

    /// Store a successful response. Tool-use responses are never cached;
    /// replaying them would skip their side effects.
    pub fn store(&self, key: String, response: &ChatResponse) {
        if !self.enabled {
            return;
        }

        if response.stop_reason == Some(lynkr_llm::messages::StopReason::ToolUse) {
            return;
        }

        self.entries.insert(key, response.clone());
    }
}
