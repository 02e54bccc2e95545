//! Prompt caches.
//!
//! Both caches are invisible to the agent loop's correctness: a hit
//! short-circuits the upstream call, a miss changes nothing. The exact cache
//! keys on a canonical request hash; the semantic cache keys on a
//! conversation-state hash plus an embedding of the last user message.

#![deny(missing_docs)]

mod embedding;
mod exact;
mod semantic;

pub use embedding::{EmbeddingClient, HttpEmbeddingClient};
pub use exact::ExactCache;
pub use semantic::{SemanticCache, SemanticKey};
