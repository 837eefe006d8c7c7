use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub profiles: ProfilesConfig,
}

/// Tuning for the hybrid search pipeline.
///
/// `min_relevance_rrf` and `min_relevance_rerank` are on incompatible
/// scales (RRF sums are ≈0–0.03, reranker scores 0–1) and must never be
/// interchanged.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_rerank_window")]
    pub rerank_window: usize,
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f64,
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f64,
    #[serde(default = "default_min_relevance_rrf")]
    pub min_relevance_rrf: f64,
    #[serde(default = "default_min_relevance_rerank")]
    pub min_relevance_rerank: f64,
    #[serde(default = "default_true")]
    pub rerank: bool,
    #[serde(default = "default_source_timeout_ms")]
    pub source_timeout_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            rrf_k: default_rrf_k(),
            rerank_window: default_rerank_window(),
            vector_threshold: default_vector_threshold(),
            text_threshold: default_text_threshold(),
            min_relevance_rrf: default_min_relevance_rrf(),
            min_relevance_rerank: default_min_relevance_rerank(),
            rerank: true,
            source_timeout_ms: default_source_timeout_ms(),
        }
    }
}

fn default_top_k() -> usize {
    8
}
fn default_candidate_k() -> usize {
    40
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_rerank_window() -> usize {
    20
}
fn default_vector_threshold() -> f64 {
    0.25
}
fn default_text_threshold() -> f64 {
    0.0
}
fn default_min_relevance_rrf() -> f64 {
    0.01
}
fn default_min_relevance_rerank() -> f64 {
    0.3
}
fn default_true() -> bool {
    true
}
fn default_source_timeout_ms() -> u64 {
    4_000
}

/// Bounds for the SQL sandbox: pool sizing, timeouts, and row caps.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_max_pool_idle_secs")]
    pub max_pool_idle_secs: u64,
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "default_row_cap")]
    pub row_cap: i64,
    #[serde(default = "default_preview_rows")]
    pub preview_rows: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_pool_idle_secs: default_max_pool_idle_secs(),
            statement_timeout_ms: default_statement_timeout_ms(),
            row_cap: default_row_cap(),
            preview_rows: default_preview_rows(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_max_pool_idle_secs() -> u64 {
    600
}
fn default_statement_timeout_ms() -> u64 {
    15_000
}
fn default_row_cap() -> i64 {
    500
}
fn default_preview_rows() -> i64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    /// How many recent turns the router inspects for anaphora resolution.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Default for evidence-only mode when the caller does not specify.
    #[serde(default)]
    pub evidence_only: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            evidence_only: false,
        }
    }
}

fn default_history_window() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProfilesConfig {
    /// SQLite database holding encrypted connection profiles.
    #[serde(default = "default_profiles_path")]
    pub path: PathBuf,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            path: default_profiles_path(),
        }
    }
}

fn default_profiles_path() -> PathBuf {
    PathBuf::from("quarry-profiles.sqlite")
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
