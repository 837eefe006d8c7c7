//! Core data models used throughout Quarry.
//!
//! These types represent the chunks, search candidates, connection
//! profiles, query plans, and routing decisions that flow through the
//! retrieval and sandbox pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable chunk of document text produced by ingestion.
///
/// Read-only in this crate: ingestion owns chunk storage and embedding
/// generation; Quarry only retrieves.
#[derive(Debug, Clone)]
pub struct ContentChunk {
    pub id: String,
    pub owner_id: String,
    pub document_id: String,
    pub text: String,
    /// Present once the embedding pipeline has processed the chunk.
    pub embedding: Option<Vec<f32>>,
    /// Position of the chunk within its document.
    pub ordinal: i64,
    /// Page or section reference for citation display.
    pub page_ref: Option<String>,
    pub metadata: serde_json::Value,
}

/// A candidate produced by hybrid search, carrying per-source scores.
///
/// `fused_score` starts as the RRF score and is replaced by the reranker
/// relevance score when reranking runs; `rerank_score` records the latter
/// separately so callers can tell which scale they are looking at.
#[derive(Debug, Clone, Serialize)]
pub struct SearchCandidate {
    pub chunk_id: String,
    pub text: String,
    /// Cosine similarity from the vector index, if this candidate appeared there.
    pub vector_score: Option<f64>,
    /// Lexical relevance from the full-text index, if it appeared there.
    pub text_score: Option<f64>,
    pub fused_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f64>,
    /// Document the chunk belongs to, for citation display.
    pub source_document: String,
}

/// A stored database connection profile.
///
/// The DSN is encrypted at rest; the plaintext exists only transiently
/// inside the sandbox executor while a connection is being opened.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    pub id: String,
    pub owner_id: String,
    pub display_name: String,
    pub encrypted_dsn: String,
    pub created_at: DateTime<Utc>,
}

/// Statement kinds permitted by the read-only validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Show,
    Explain,
    Describe,
}

impl std::fmt::Display for StatementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatementKind::Select => "select",
            StatementKind::Show => "show",
            StatementKind::Explain => "explain",
            StatementKind::Describe => "describe",
        };
        write!(f, "{}", s)
    }
}

/// A validated, rewritten query ready for execution.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub raw_sql: String,
    pub statement_kind: StatementKind,
    pub referenced_tables: Vec<String>,
    /// The statement actually sent to the engine, with the row cap applied.
    pub rewritten_sql: String,
    pub row_limit: i64,
}

/// Column metadata returned alongside sandbox rows.
#[derive(Debug, Clone, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    pub type_name: String,
}

/// Outcome of one sandboxed query execution.
///
/// Validation and execution failures are carried here as `success = false`
/// rather than thrown past the sandbox boundary.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    pub rows: Vec<serde_json::Value>,
    pub row_count: usize,
    pub columns: Vec<ColumnMeta>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the returned row count reached the configured cap.
    pub limited: bool,
}

impl QueryOutcome {
    /// A failed outcome carrying only an error message.
    pub fn failure(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            row_count: 0,
            columns: Vec::new(),
            elapsed_ms,
            error: Some(error.into()),
            limited: false,
        }
    }
}

/// One turn of recent conversation history, as seen by the router.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    /// Set on assistant turns whose answer was produced from sandbox rows.
    #[serde(default)]
    pub tabular: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// The router's verdict for a single utterance.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub use_search: bool,
    pub use_sandbox: bool,
    /// Human-readable trace of which rules fired, for debugging.
    pub reasoning: String,
    /// Referents resolved from history for anaphoric utterances.
    pub resolved_referents: Vec<String>,
}

/// Evidence generated by the NL→SQL + sandbox path.
#[derive(Debug, Clone)]
pub struct SqlEvidence {
    pub sql: String,
    pub explanation: Option<String>,
    /// None when the generator asked for clarification instead of running.
    pub outcome: Option<QueryOutcome>,
    pub needs_clarification: bool,
    pub clarification: Option<String>,
}

impl SqlEvidence {
    pub fn has_evidence(&self) -> bool {
        // A clarification question must reach the user; it counts as
        // evidence for the gate even though no rows were produced.
        self.needs_clarification
            || self
                .outcome
                .as_ref()
                .map(|o| o.success && o.row_count > 0)
                .unwrap_or(false)
    }
}

/// What retrieval produced, as a tagged union so callers match
/// exhaustively instead of probing optional fields.
#[derive(Debug, Clone)]
pub enum RetrievalResult {
    Search(Vec<SearchCandidate>),
    Sandbox(SqlEvidence),
    Combined {
        candidates: Vec<SearchCandidate>,
        sql: SqlEvidence,
    },
    Empty,
}

impl RetrievalResult {
    /// Whether any usable evidence is present.
    pub fn has_evidence(&self) -> bool {
        match self {
            RetrievalResult::Search(c) => !c.is_empty(),
            RetrievalResult::Sandbox(s) => s.has_evidence(),
            RetrievalResult::Combined { candidates, sql } => {
                !candidates.is_empty() || sql.has_evidence()
            }
            RetrievalResult::Empty => false,
        }
    }
}

/// Instruction to the external answer generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnswerDirective {
    /// Generate an answer; when `evidence_only` is set, the generator must
    /// not fall back to outside knowledge.
    Generate { evidence_only: bool },
    /// Emit the fixed refusal text verbatim. Terminal state, not an error.
    Refuse { message: &'static str },
}

/// The bundle the router hands to the external answer generator.
#[derive(Debug, Clone)]
pub struct EvidenceBundle {
    pub decision: RoutingDecision,
    pub evidence: RetrievalResult,
    pub directive: AnswerDirective,
}
