//! NL→SQL generation seam.
//!
//! The generator is an external model call; this crate consumes it as a
//! trait. Generated SQL is untrusted input: it always passes through the
//! sandbox validator before execution, whatever confidence the generator
//! reports.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::ConversationTurn;

/// Schema information handed to the generator so it can target real
/// tables and columns.
#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    /// One entry per table, e.g. `"orders(id, customer_id, total, placed_at)"`.
    pub tables: Vec<String>,
    /// Engine hint, e.g. `"postgresql"`.
    pub dialect: String,
}

/// A candidate statement produced by the generator.
#[derive(Debug, Clone)]
pub struct SqlGeneration {
    pub sql: String,
    pub explanation: Option<String>,
    /// Generator's own confidence in `[0, 1]`; informational only.
    pub confidence: f64,
    /// Set when the utterance is too ambiguous to compile; `clarification`
    /// then carries the question to relay to the user.
    pub needs_clarification: bool,
    pub clarification: Option<String>,
}

/// Produces a candidate SQL statement from an utterance, schema, and
/// recent history.
#[async_trait]
pub trait NlToSqlGenerator: Send + Sync {
    async fn generate(
        &self,
        utterance: &str,
        schema: &SchemaContext,
        history: &[ConversationTurn],
    ) -> Result<SqlGeneration>;
}
