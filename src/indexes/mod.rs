//! Index collaborator traits consumed by the hybrid search engine.
//!
//! Chunk storage, indexing, and embedding generation belong to the
//! ingestion pipeline; this crate only queries them. The traits here are
//! the seam: production wires them to a real vector store and full-text
//! index, tests and embedded callers use the [`memory`] implementations.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

/// A hit returned by either index, rank-ordered by the source itself.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub chunk_id: String,
    pub document_id: String,
    pub content: String,
    /// Vector index: cosine similarity in `[0, 1]`. Lexical index: the
    /// source's own relevance value, higher is better.
    pub score: f64,
    pub metadata: serde_json::Value,
}

/// Nearest-neighbor similarity search over owner-scoped embedded chunks.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Top-`k` chunks for `owner_id`, descending by similarity.
    async fn query(&self, owner_id: &str, query_vector: &[f32], k: usize)
        -> Result<Vec<IndexHit>>;
}

/// Tokenized full-text search over the same chunks.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    /// Top-`k` chunks for `owner_id`, descending by relevance.
    async fn query(&self, owner_id: &str, query_text: &str, k: usize) -> Result<Vec<IndexHit>>;
}

/// Produces the query-side embedding for the vector leg.
#[async_trait]
pub trait QueryEmbedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// A no-op embedder that always returns an error; used when embeddings are
/// not configured. The search engine degrades to lexical-only retrieval.
pub struct DisabledEmbedder;

#[async_trait]
impl QueryEmbedder for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("query embedder is disabled")
    }
}
