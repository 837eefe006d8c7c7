//! Semantic reranker abstraction and HTTP implementation.
//!
//! The reranker scores a `(query, candidate texts)` batch with a
//! cross-encoder served over HTTP. It is optional: when unconfigured or
//! unavailable, the search engine falls back to RRF ordering, so a
//! reranker failure is never fatal to retrieval.
//!
//! # Retry Strategy
//!
//! The HTTP client mirrors the usual remote-model call policy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// One reranked document, referring back to the input batch by index.
#[derive(Debug, Clone, Deserialize)]
pub struct RerankHit {
    pub index: usize,
    /// Cross-encoder relevance in `[0, 1]`. Not comparable to RRF scores.
    pub relevance_score: f64,
}

/// Scores a query against a batch of candidate texts.
#[async_trait]
pub trait SemanticReranker: Send + Sync {
    /// Return up to `top_n` hits, descending by relevance. Documents the
    /// reranker omits are dropped by the caller.
    async fn rerank(&self, query: &str, documents: &[String], top_n: usize)
        -> Result<Vec<RerankHit>>;
}

/// Environment variable holding the rerank API key.
pub const RERANK_API_KEY_ENV: &str = "QUARRY_RERANK_API_KEY";

/// HTTP reranker client (Cohere-compatible `POST /rerank` contract).
pub struct HttpReranker {
    endpoint: String,
    model: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankHit>,
}

impl HttpReranker {
    /// # Errors
    ///
    /// Returns an error if `QUARRY_RERANK_API_KEY` is not set or the HTTP
    /// client cannot be constructed.
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        if std::env::var(RERANK_API_KEY_ENV).is_err() {
            bail!("{} environment variable not set", RERANK_API_KEY_ENV);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            model: model.into(),
            max_retries: 3,
            client,
        })
    }
}

#[async_trait]
impl SemanticReranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        top_n: usize,
    ) -> Result<Vec<RerankHit>> {
        let api_key = std::env::var(RERANK_API_KEY_ENV)
            .map_err(|_| anyhow::anyhow!("{} not set", RERANK_API_KEY_ENV))?;

        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": documents,
            "top_n": top_n,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let parsed: RerankResponse = response.json().await?;
                        let mut hits = parsed.results;
                        hits.retain(|h| h.index < documents.len());
                        return Ok(hits);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("rerank API returned {}", status));
                        continue;
                    }

                    let text = response.text().await.unwrap_or_default();
                    bail!("rerank API returned {}: {}", status, text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rerank retries exhausted")))
    }
}
