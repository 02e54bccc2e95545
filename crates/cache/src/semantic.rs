use std::sync::Arc;

use lynkr_config::SemanticCacheConfig;
use lynkr_llm::messages::{ChatRequest, ChatResponse, StopReason};
use mini_moka::sync::Cache;
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingClient;

/// Key for one semantic lookup: the conversation-state hash plus the
/// embedding of the last user message. A hit requires the hash to match
/// exactly and the embeddings to be close; similar phrasing over a different
/// conversation must never hit.
#[derive(Debug, Clone)]
pub struct SemanticKey {
    /// `sha256(system + conversation-state)`.
    pub state_hash: String,
    /// Embedding of the last user text.
    pub embedding: Vec<f32>,
}

#[derive(Clone)]
struct StoredEntry {
    embedding: Vec<f32>,
    response: ChatResponse,
}

/// Embedding-based response cache.
pub struct SemanticCache {
    enabled: bool,
    threshold: f32,
    entries: Cache<String, Arc<Vec<StoredEntry>>>,
    embeddings: Option<Arc<dyn EmbeddingClient>>,
}

impl SemanticCache {
    /// Build from configuration and an optional embedding source. Without
    /// an embedding source the cache is inert.
    pub fn new(config: &SemanticCacheConfig, embeddings: Option<Arc<dyn EmbeddingClient>>) -> Self {
        Self {
            enabled: config.enabled && embeddings.is_some(),
            threshold: config.similarity_threshold,
            entries: Cache::builder()
                .max_capacity(config.capacity)
                .time_to_live(config.ttl)
                .build(),
            embeddings,
        }
    }

    /// Compute the lookup key for a request: hash the system prompt and
    /// conversation state, embed the last user text. Returns None when the
    /// cache is disabled, the request has no user text, or embedding fails;
    /// the caller then simply skips the cache.
    pub async fn prepare(&self, request: &ChatRequest) -> Option<SemanticKey> {
        if !self.enabled {
            return None;
        }

        let last_user = request.last_user_text()?;
        let embeddings = self.embeddings.as_ref()?;

        let embedding = match embeddings.embed(&last_user).await {
            Ok(embedding) => embedding,
            Err(e) => {
                log::debug!("embedding failed, skipping semantic cache: {e}");
                return None;
            }
        };

        Some(SemanticKey {
            state_hash: state_hash(request),
            embedding,
        })
    }

    /// Closest stored response for the key, if similarity clears the
    /// threshold.
    pub fn lookup(&self, key: &SemanticKey) -> Option<ChatResponse> {
        if !self.enabled {
            return None;
        }

        let bucket = self.entries.get(&key.state_hash)?;

        let (best_similarity, best) = bucket
            .iter()
            .map(|entry| (cosine_similarity(&key.embedding, &entry.embedding), entry))
            .max_by(|(a, _), (b, _)| a.total_cmp(b))?;

        if best_similarity < self.threshold {
            return None;
        }

        log::debug!("semantic cache hit at similarity {best_similarity:.3}");

        let mut response = best.response.clone();
        response.usage.cache_read_input_tokens = Some(response.usage.input_tokens);
        Some(response)
    }

    /// Store a response under the key. Only successful, non-tool-use
    /// responses are stored.
    pub fn store(&self, key: SemanticKey, response: &ChatResponse) {
        if !self.enabled {
            return;
        }

        if response.stop_reason == Some(StopReason::ToolUse) {
            return;
        }

        let mut bucket = self
            .entries
            .get(&key.state_hash)
            .map(|entries| entries.as_ref().clone())
            .unwrap_or_default();

        bucket.push(StoredEntry {
            embedding: key.embedding,
            response: response.clone(),
        });

        self.entries.insert(key.state_hash, Arc::new(bucket));
    }
}

/// Hash the system prompt plus every turn except the last user message.
fn state_hash(request: &ChatRequest) -> String {
    let mut hasher = Sha256::new();

    if let Some(system) = &request.system {
        hasher.update(system.flatten().as_bytes());
    }

    let last_user_index = request
        .messages
        .iter()
        .rposition(|message| message.role == lynkr_llm::messages::Role::User);

    for (index, message) in request.messages.iter().enumerate() {
        if Some(index) == last_user_index {
            continue;
        }

        hasher.update([match message.role {
            lynkr_llm::messages::Role::User => 0u8,
            lynkr_llm::messages::Role::Assistant => 1,
            lynkr_llm::messages::Role::Tool => 2,
        }]);
        hasher.update(message.content.flatten_text().as_bytes());
    }

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}
