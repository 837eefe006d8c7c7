//! In-memory index implementations for tests and embedded use.
//!
//! Chunks live in a `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine similarity over all stored embeddings; lexical
//! search scores by query-token overlap. Both are owner-scoped like their
//! production counterparts.

use std::collections::HashSet;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ContentChunk;

use super::{IndexHit, LexicalIndex, VectorIndex};

/// A single store backing both index traits.
pub struct MemoryIndex {
    chunks: RwLock<Vec<ContentChunk>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    pub fn add_chunk(&self, chunk: ContentChunk) {
        self.chunks.write().expect("index lock").push(chunk);
    }

    pub fn len(&self) -> usize {
        self.chunks.read().expect("index lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        (dot / (mag_a * mag_b)) as f64
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn hit_from(chunk: &ContentChunk, score: f64) -> IndexHit {
    IndexHit {
        chunk_id: chunk.id.clone(),
        document_id: chunk.document_id.clone(),
        content: chunk.text.clone(),
        score,
        metadata: chunk.metadata.clone(),
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn query(
        &self,
        owner_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<Vec<IndexHit>> {
        let chunks = self.chunks.read().expect("index lock");
        let mut hits: Vec<IndexHit> = chunks
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .filter_map(|c| {
                c.embedding
                    .as_ref()
                    .map(|e| hit_from(c, cosine_sim(query_vector, e)))
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

#[async_trait]
impl LexicalIndex for MemoryIndex {
    async fn query(&self, owner_id: &str, query_text: &str, k: usize) -> Result<Vec<IndexHit>> {
        let query_tokens: HashSet<String> = tokenize(query_text).into_iter().collect();
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().expect("index lock");
        let mut hits: Vec<IndexHit> = chunks
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .filter_map(|c| {
                let tokens: HashSet<String> = tokenize(&c.text).into_iter().collect();
                let overlap = query_tokens.intersection(&tokens).count();
                if overlap == 0 {
                    None
                } else {
                    Some(hit_from(c, overlap as f64 / query_tokens.len() as f64))
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, owner: &str, text: &str, embedding: Option<Vec<f32>>) -> ContentChunk {
        ContentChunk {
            id: id.to_string(),
            owner_id: owner.to_string(),
            document_id: format!("doc-{}", id),
            text: text.to_string(),
            embedding,
            ordinal: 0,
            page_ref: None,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_vector_query_is_owner_scoped_and_ranked() {
        let index = MemoryIndex::new();
        index.add_chunk(chunk("a", "o1", "alpha", Some(vec![1.0, 0.0])));
        index.add_chunk(chunk("b", "o1", "beta", Some(vec![0.6, 0.8])));
        index.add_chunk(chunk("c", "o2", "other owner", Some(vec![1.0, 0.0])));

        let hits = VectorIndex::query(&index, "o1", &[1.0, 0.0], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_vector_query_skips_unembedded_chunks() {
        let index = MemoryIndex::new();
        index.add_chunk(chunk("a", "o1", "no vector yet", None));
        let hits = VectorIndex::query(&index, "o1", &[1.0], 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_query_scores_overlap() {
        let index = MemoryIndex::new();
        index.add_chunk(chunk("a", "o1", "rust borrow checker rules", None));
        index.add_chunk(chunk("b", "o1", "python packaging", None));

        let hits = LexicalIndex::query(&index, "o1", "borrow checker", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "a");
        assert!((hits[0].score - 1.0).abs() < 1e-9);
    }
}
