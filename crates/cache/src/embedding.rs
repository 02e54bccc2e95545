use async_trait::async_trait;
use lynkr_config::SemanticCacheConfig;
use serde::Deserialize;

/// Source of text embeddings. Crossing a process boundary is expected; a
/// failed embedding just disables the semantic cache for that request.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed one text.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Ollama-compatible HTTP embeddings endpoint (`POST /api/embeddings`).
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl HttpEmbeddingClient {
    /// Build from the semantic cache configuration, when an endpoint is set.
    pub fn from_config(config: &SemanticCacheConfig) -> Option<Self> {
        let url = config.embeddings_url.clone()?;

        Some(Self {
            client: reqwest::Client::new(),
            url,
            model: config
                .embeddings_model
                .clone()
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": text,
            }))
            .send()
            .await?
            .error_for_status()?;

        let parsed: EmbeddingsResponse = response.json().await?;
        Ok(parsed.embedding)
    }
}
