//! Hybrid search: concurrent vector + lexical retrieval fused by RRF,
//! optionally reranked by a cross-encoder.
//!
//! # Algorithm
//!
//! 1. Issue the vector query (cosine similarity, owner-scoped) and the
//!    lexical query concurrently, each under its own timeout, each
//!    pre-filtered by its source threshold.
//! 2. Fuse by Reciprocal Rank Fusion: a candidate at 1-based rank `r` in a
//!    source list contributes `1/(k+r)`; absence contributes 0.
//! 3. Sort descending by fused score and keep the reranking window.
//! 4. If reranking is enabled and available, replace each surviving
//!    candidate's score with the reranker's 0–1 relevance and drop
//!    candidates the reranker does not return.
//! 5. Filter by the minimum relevance for the active score scale, truncate
//!    to `top_k`.
//!
//! RRF sums (≈0–0.03) and reranker scores (0–1) are different scales;
//! [`SearchOptions`] carries one threshold per scale and they are never
//! interchanged.
//!
//! Either source failing alone is non-fatal: the engine logs it and
//! continues with the other. Both failing yields an empty, degraded
//! outcome rather than an error.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::RetrievalConfig;
use crate::indexes::{IndexHit, LexicalIndex, QueryEmbedder, VectorIndex};
use crate::models::SearchCandidate;
use crate::rerank::SemanticReranker;

/// Per-call knobs for one search invocation.
///
/// `min_relevance_rrf` applies when results carry RRF scores,
/// `min_relevance_rerank` when the reranker replaced them. The two are on
/// incompatible scales and must stay separate.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub top_k: usize,
    pub vector_threshold: f64,
    pub text_threshold: f64,
    pub min_relevance_rrf: f64,
    pub min_relevance_rerank: f64,
    pub rerank: bool,
}

impl SearchOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            vector_threshold: config.vector_threshold,
            text_threshold: config.text_threshold,
            min_relevance_rrf: config.min_relevance_rrf,
            min_relevance_rerank: config.min_relevance_rerank,
            rerank: config.rerank,
        }
    }
}

/// Result of one hybrid search.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Sorted descending by `fused_score`; length ≤ `top_k`.
    pub candidates: Vec<SearchCandidate>,
    /// True when at least one retrieval leg failed or timed out.
    pub degraded: bool,
}

/// The hybrid search engine. Holds only collaborator handles and
/// configuration; safe to share and call concurrently.
pub struct HybridSearchEngine {
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<dyn LexicalIndex>,
    embedder: Arc<dyn QueryEmbedder>,
    reranker: Option<Arc<dyn SemanticReranker>>,
    config: RetrievalConfig,
}

struct FusedCandidate {
    hit: IndexHit,
    vector_rank: Option<usize>,
    lexical_rank: Option<usize>,
    vector_score: Option<f64>,
    text_score: Option<f64>,
    fused_score: f64,
    order: usize,
}

impl HybridSearchEngine {
    pub fn new(
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<dyn LexicalIndex>,
        embedder: Arc<dyn QueryEmbedder>,
        reranker: Option<Arc<dyn SemanticReranker>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            vector,
            lexical,
            embedder,
            reranker,
            config,
        }
    }

    /// The options this engine's configuration implies.
    pub fn default_options(&self) -> SearchOptions {
        SearchOptions::from_config(&self.config)
    }

    /// Run a hybrid search for `owner_id`.
    pub async fn search(
        &self,
        query: &str,
        owner_id: &str,
        options: &SearchOptions,
    ) -> SearchOutcome {
        if query.trim().is_empty() || options.top_k == 0 {
            return SearchOutcome {
                candidates: Vec::new(),
                degraded: false,
            };
        }

        let source_timeout = Duration::from_millis(self.config.source_timeout_ms);
        let candidate_k = self.config.candidate_k;

        let vector_leg = async {
            let embedded = self.embedder.embed(query).await?;
            self.vector.query(owner_id, &embedded, candidate_k).await
        };
        let lexical_leg = self.lexical.query(owner_id, query, candidate_k);

        let (vector_res, lexical_res) = tokio::join!(
            flatten_timeout(source_timeout, vector_leg),
            flatten_timeout(source_timeout, lexical_leg),
        );

        let mut degraded = false;
        let vector_hits = match vector_res {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(owner_id, error = %e, "vector retrieval failed, continuing lexical-only");
                degraded = true;
                Vec::new()
            }
        };
        let lexical_hits = match lexical_res {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(owner_id, error = %e, "lexical retrieval failed, continuing vector-only");
                degraded = true;
                Vec::new()
            }
        };

        let vector_hits: Vec<IndexHit> = vector_hits
            .into_iter()
            .filter(|h| h.score >= options.vector_threshold)
            .collect();
        let lexical_hits: Vec<IndexHit> = lexical_hits
            .into_iter()
            .filter(|h| h.score >= options.text_threshold)
            .collect();

        let mut fused = fuse_rrf(vector_hits, lexical_hits, self.config.rrf_k);

        let window = self.config.rerank_window.max(options.top_k);
        fused.truncate(window);

        let candidates = if options.rerank {
            match &self.reranker {
                Some(reranker) => match self.apply_rerank(query, &fused, reranker, options).await {
                    Ok(reranked) => reranked,
                    Err(e) => {
                        tracing::warn!(owner_id, error = %e, "reranker unavailable, falling back to RRF ordering");
                        finalize_rrf(fused, options)
                    }
                },
                None => finalize_rrf(fused, options),
            }
        } else {
            finalize_rrf(fused, options)
        };

        if candidates.is_empty() && degraded {
            tracing::warn!(owner_id, "retrieval degraded: no source produced candidates");
        }

        SearchOutcome {
            candidates,
            degraded,
        }
    }

    async fn apply_rerank(
        &self,
        query: &str,
        fused: &[FusedCandidate],
        reranker: &Arc<dyn SemanticReranker>,
        options: &SearchOptions,
    ) -> Result<Vec<SearchCandidate>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }
        let documents: Vec<String> = fused.iter().map(|f| f.hit.content.clone()).collect();
        let hits = reranker.rerank(query, &documents, options.top_k).await?;

        let mut reranked: Vec<SearchCandidate> = hits
            .iter()
            .filter(|h| h.index < fused.len())
            .map(|h| {
                let f = &fused[h.index];
                let mut candidate = to_candidate(f);
                candidate.rerank_score = Some(h.relevance_score);
                candidate.fused_score = h.relevance_score;
                candidate
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(Ordering::Equal)
        });
        reranked.retain(|c| c.fused_score >= options.min_relevance_rerank);
        reranked.truncate(options.top_k);
        Ok(reranked)
    }
}

async fn flatten_timeout<F>(limit: Duration, fut: F) -> Result<Vec<IndexHit>>
where
    F: std::future::Future<Output = Result<Vec<IndexHit>>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("source timed out after {:?}", limit),
    }
}

/// Fuse two rank-ordered hit lists by Reciprocal Rank Fusion.
///
/// Returns candidates sorted descending by fused score; ties break by
/// vector rank, then lexical rank, then insertion order, so output is
/// deterministic.
fn fuse_rrf(vector_hits: Vec<IndexHit>, lexical_hits: Vec<IndexHit>, k: f64) -> Vec<FusedCandidate> {
    let mut by_chunk: HashMap<String, usize> = HashMap::new();
    let mut fused: Vec<FusedCandidate> = Vec::new();

    for (i, hit) in vector_hits.into_iter().enumerate() {
        let rank = i + 1;
        let order = fused.len();
        let entry = FusedCandidate {
            vector_rank: Some(rank),
            lexical_rank: None,
            vector_score: Some(hit.score),
            text_score: None,
            fused_score: 1.0 / (k + rank as f64),
            order,
            hit,
        };
        by_chunk.insert(entry.hit.chunk_id.clone(), order);
        fused.push(entry);
    }

    for (i, hit) in lexical_hits.into_iter().enumerate() {
        let rank = i + 1;
        match by_chunk.get(&hit.chunk_id) {
            Some(&idx) => {
                let entry = &mut fused[idx];
                entry.lexical_rank = Some(rank);
                entry.text_score = Some(hit.score);
                entry.fused_score += 1.0 / (k + rank as f64);
            }
            None => {
                let order = fused.len();
                let entry = FusedCandidate {
                    vector_rank: None,
                    lexical_rank: Some(rank),
                    vector_score: None,
                    text_score: Some(hit.score),
                    fused_score: 1.0 / (k + rank as f64),
                    order,
                    hit,
                };
                by_chunk.insert(entry.hit.chunk_id.clone(), order);
                fused.push(entry);
            }
        }
    }

    fused.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank_order(a.vector_rank, b.vector_rank))
            .then_with(|| rank_order(a.lexical_rank, b.lexical_rank))
            .then_with(|| a.order.cmp(&b.order))
    });
    fused
}

fn rank_order(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn finalize_rrf(fused: Vec<FusedCandidate>, options: &SearchOptions) -> Vec<SearchCandidate> {
    fused
        .iter()
        .filter(|f| f.fused_score >= options.min_relevance_rrf)
        .take(options.top_k)
        .map(to_candidate)
        .collect()
}

fn to_candidate(f: &FusedCandidate) -> SearchCandidate {
    SearchCandidate {
        chunk_id: f.hit.chunk_id.clone(),
        text: f.hit.content.clone(),
        vector_score: f.vector_score,
        text_score: f.text_score,
        fused_score: f.fused_score,
        rerank_score: None,
        source_document: f.hit.document_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rerank::RerankHit;
    use async_trait::async_trait;

    fn hit(chunk_id: &str, score: f64) -> IndexHit {
        IndexHit {
            chunk_id: chunk_id.to_string(),
            document_id: format!("doc-{}", chunk_id),
            content: format!("text of {}", chunk_id),
            score,
            metadata: serde_json::json!({}),
        }
    }

    struct StaticVector(Vec<IndexHit>);
    #[async_trait]
    impl VectorIndex for StaticVector {
        async fn query(&self, _: &str, _: &[f32], _: usize) -> Result<Vec<IndexHit>> {
            Ok(self.0.clone())
        }
    }

    struct FailingVector;
    #[async_trait]
    impl VectorIndex for FailingVector {
        async fn query(&self, _: &str, _: &[f32], _: usize) -> Result<Vec<IndexHit>> {
            anyhow::bail!("vector index down")
        }
    }

    struct StaticLexical(Vec<IndexHit>);
    #[async_trait]
    impl LexicalIndex for StaticLexical {
        async fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<IndexHit>> {
            Ok(self.0.clone())
        }
    }

    struct FailingLexical;
    #[async_trait]
    impl LexicalIndex for FailingLexical {
        async fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<IndexHit>> {
            anyhow::bail!("lexical index down")
        }
    }

    struct StaticEmbedder;
    #[async_trait]
    impl QueryEmbedder for StaticEmbedder {
        async fn embed(&self, _: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    struct StubReranker(Vec<RerankHit>);
    #[async_trait]
    impl SemanticReranker for StubReranker {
        async fn rerank(&self, _: &str, _: &[String], _: usize) -> Result<Vec<RerankHit>> {
            Ok(self.0.clone())
        }
    }

    struct FailingReranker;
    #[async_trait]
    impl SemanticReranker for FailingReranker {
        async fn rerank(&self, _: &str, _: &[String], _: usize) -> Result<Vec<RerankHit>> {
            anyhow::bail!("reranker down")
        }
    }

    fn options() -> SearchOptions {
        SearchOptions {
            top_k: 5,
            vector_threshold: 0.0,
            text_threshold: 0.0,
            min_relevance_rrf: 0.0,
            min_relevance_rerank: 0.0,
            rerank: false,
        }
    }

    fn engine(
        vector: impl VectorIndex + 'static,
        lexical: impl LexicalIndex + 'static,
        reranker: Option<Arc<dyn SemanticReranker>>,
    ) -> HybridSearchEngine {
        HybridSearchEngine::new(
            Arc::new(vector),
            Arc::new(lexical),
            Arc::new(StaticEmbedder),
            reranker,
            RetrievalConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_rrf_scores_are_exact() {
        // "a" is rank 1 in both lists; "b" rank 2 vector only; "c" rank 2
        // lexical only.
        let e = engine(
            StaticVector(vec![hit("a", 0.9), hit("b", 0.8)]),
            StaticLexical(vec![hit("a", 3.0), hit("c", 2.0)]),
            None,
        );
        let out = e.search("q", "o1", &options()).await;
        assert!(!out.degraded);

        let k = 60.0;
        let by_id: HashMap<&str, f64> = out
            .candidates
            .iter()
            .map(|c| (c.chunk_id.as_str(), c.fused_score))
            .collect();
        assert!((by_id["a"] - (1.0 / (k + 1.0) + 1.0 / (k + 1.0))).abs() < 1e-12);
        assert!((by_id["b"] - 1.0 / (k + 2.0)).abs() < 1e-12);
        assert!((by_id["c"] - 1.0 / (k + 2.0)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_output_bounded_and_sorted() {
        let vector: Vec<IndexHit> = (0..20).map(|i| hit(&format!("v{}", i), 0.9)).collect();
        let lexical: Vec<IndexHit> = (0..20).map(|i| hit(&format!("l{}", i), 1.0)).collect();
        let e = engine(StaticVector(vector), StaticLexical(lexical), None);

        let mut opts = options();
        opts.top_k = 7;
        let out = e.search("q", "o1", &opts).await;

        assert!(out.candidates.len() <= 7);
        for pair in out.candidates.windows(2) {
            assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }

    #[tokio::test]
    async fn test_ties_break_by_vector_then_lexical_rank() {
        // "b" and "c" both score 1/(k+2): b from vector rank 2, c from
        // lexical rank 2. Vector presence wins the tie.
        let e = engine(
            StaticVector(vec![hit("a", 0.9), hit("b", 0.8)]),
            StaticLexical(vec![hit("a", 3.0), hit("c", 2.0)]),
            None,
        );
        let out = e.search("q", "o1", &options()).await;
        let ids: Vec<&str> = out.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_single_source_failure_degrades() {
        let e = engine(
            FailingVector,
            StaticLexical(vec![hit("l1", 2.0), hit("l2", 1.0)]),
            None,
        );
        let out = e.search("q", "o1", &options()).await;
        assert!(out.degraded);
        assert_eq!(out.candidates.len(), 2);
        assert_eq!(out.candidates[0].chunk_id, "l1");
    }

    #[tokio::test]
    async fn test_both_sources_failing_is_empty_not_error() {
        let e = engine(FailingVector, FailingLexical, None);
        let out = e.search("q", "o1", &options()).await;
        assert!(out.degraded);
        assert!(out.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let e = engine(
            StaticVector(vec![hit("a", 0.9)]),
            StaticLexical(vec![]),
            None,
        );
        let out = e.search("   ", "o1", &options()).await;
        assert!(out.candidates.is_empty());
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn test_source_thresholds_filter_before_fusion() {
        let e = engine(
            StaticVector(vec![hit("strong", 0.9), hit("weak", 0.1)]),
            StaticLexical(vec![]),
            None,
        );
        let mut opts = options();
        opts.vector_threshold = 0.5;
        let out = e.search("q", "o1", &opts).await;
        let ids: Vec<&str> = out.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["strong"]);
    }

    #[tokio::test]
    async fn test_rerank_replaces_scores_and_drops_missing() {
        let reranker = StubReranker(vec![
            RerankHit {
                index: 1,
                relevance_score: 0.95,
            },
            RerankHit {
                index: 0,
                relevance_score: 0.60,
            },
            // index 2 ("c") omitted: dropped.
        ]);
        let e = engine(
            StaticVector(vec![hit("a", 0.9), hit("b", 0.8), hit("c", 0.7)]),
            StaticLexical(vec![]),
            Some(Arc::new(reranker)),
        );
        let mut opts = options();
        opts.rerank = true;
        let out = e.search("q", "o1", &opts).await;

        let ids: Vec<&str> = out.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(out.candidates[0].rerank_score, Some(0.95));
        assert!((out.candidates[0].fused_score - 0.95).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_rerank_threshold_uses_rerank_scale() {
        let reranker = StubReranker(vec![
            RerankHit {
                index: 0,
                relevance_score: 0.9,
            },
            RerankHit {
                index: 1,
                relevance_score: 0.2,
            },
        ]);
        let e = engine(
            StaticVector(vec![hit("a", 0.9), hit("b", 0.8)]),
            StaticLexical(vec![]),
            Some(Arc::new(reranker)),
        );
        let mut opts = options();
        opts.rerank = true;
        opts.min_relevance_rerank = 0.5;
        let out = e.search("q", "o1", &opts).await;
        let ids: Vec<&str> = out.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_reranker_failure_falls_back_to_rrf() {
        let e = engine(
            StaticVector(vec![hit("a", 0.9), hit("b", 0.8)]),
            StaticLexical(vec![]),
            Some(Arc::new(FailingReranker)),
        );
        let mut opts = options();
        opts.rerank = true;
        // The RRF-scale threshold applies on the fallback path; top RRF
        // score here is 1/61 ≈ 0.0164.
        opts.min_relevance_rrf = 0.016;
        let out = e.search("q", "o1", &opts).await;

        let ids: Vec<&str> = out.candidates.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(out.candidates[0].rerank_score.is_none());
        assert!(!out.degraded);
    }
}
