//! Agent routing: which evidence source(s) answer this utterance?
//!
//! The router decides `{use_search, use_sandbox}` from a first-pass intent
//! classification plus three overriding rules:
//!
//! 1. The sandbox is never invoked for an owner with no structured tables.
//! 2. An anaphoric utterance ("list them") immediately after a tabular
//!    answer forces the sandbox path, whatever the classifier said; the
//!    NL→SQL collaborator's own clarification step resolves any remaining
//!    ambiguity downstream.
//! 3. In evidence-only mode the router never routes to nothing while
//!    documents exist, and zero retrieved evidence produces a fixed
//!    refusal directive instead of open-domain generation.
//!
//! The router holds no mutable state and performs no I/O beyond delegating
//! to its collaborators; one instance serves concurrent conversations.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::RouterConfig;
use crate::models::{
    AnswerDirective, ConnectionProfile, ConversationTurn, EvidenceBundle, QueryOutcome,
    RetrievalResult, RoutingDecision, SqlEvidence, TurnRole,
};
use crate::nl2sql::{NlToSqlGenerator, SchemaContext};
use crate::sandbox::{SandboxError, SqlSandboxExecutor};
use crate::search::{HybridSearchEngine, SearchOutcome};

/// Fixed reply emitted when evidence-only mode retrieves nothing.
pub const NO_EVIDENCE_REPLY: &str =
    "I could not find relevant information in your connected documents or databases to answer that.";

/// Follow-up references that point back into recent conversation turns.
static ANAPHORA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(them|those|these|they|it|ones?)\b").expect("anaphora regex is valid")
});

/// What the owner has connected, as known by the caller.
#[derive(Debug, Clone, Copy)]
pub struct OwnerResources {
    pub has_documents: bool,
    pub has_tables: bool,
}

/// First-pass intent signal from the classification collaborator.
#[derive(Debug, Clone)]
pub struct IntentSignal {
    pub wants_search: bool,
    pub wants_sandbox: bool,
    pub label: String,
}

/// Classifies an utterance before the router's overriding rules apply.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        utterance: &str,
        resources: &OwnerResources,
        history: &[ConversationTurn],
    ) -> Result<IntentSignal>;
}

/// Keyword heuristics marking an utterance as tabular/analytic.
static TABULAR_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(how many|count|rows?|records?|tables?|columns?|average|avg|sum|total|median|maximum|minimum|top \d+|group(ed)? by)\b",
    )
    .expect("tabular hint regex is valid")
});

/// Default classifier: cheap keyword signals, no model call.
pub struct HeuristicClassifier;

#[async_trait]
impl IntentClassifier for HeuristicClassifier {
    async fn classify(
        &self,
        utterance: &str,
        resources: &OwnerResources,
        _history: &[ConversationTurn],
    ) -> Result<IntentSignal> {
        let tabular = TABULAR_HINT.is_match(utterance);
        Ok(IntentSignal {
            wants_search: resources.has_documents && !tabular,
            wants_sandbox: resources.has_tables && tabular,
            label: if tabular { "tabular" } else { "document" }.to_string(),
        })
    }
}

/// Retrieval seam so the router can be driven against fakes in tests.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, owner_id: &str) -> SearchOutcome;
}

#[async_trait]
impl SearchProvider for HybridSearchEngine {
    async fn search(&self, query: &str, owner_id: &str) -> SearchOutcome {
        HybridSearchEngine::search(self, query, owner_id, &self.default_options()).await
    }
}

/// Sandbox seam, mirroring [`SqlSandboxExecutor::execute`].
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn execute(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        sql: &str,
    ) -> std::result::Result<QueryOutcome, SandboxError>;
}

#[async_trait]
impl SandboxProvider for SqlSandboxExecutor {
    async fn execute(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        sql: &str,
    ) -> std::result::Result<QueryOutcome, SandboxError> {
        SqlSandboxExecutor::execute(self, profile, owner_id, sql).await
    }
}

/// All inputs for one routing call.
pub struct RouteRequest<'a> {
    pub utterance: &'a str,
    pub owner_id: &'a str,
    pub evidence_only: bool,
    pub history: &'a [ConversationTurn],
    pub resources: OwnerResources,
    pub schema: SchemaContext,
    /// Profile to query when the sandbox path is chosen.
    pub profile: Option<&'a ConnectionProfile>,
}

/// Stateless per-call router over the retrieval collaborators.
pub struct AgentRouter {
    classifier: Arc<dyn IntentClassifier>,
    search: Arc<dyn SearchProvider>,
    sandbox: Arc<dyn SandboxProvider>,
    generator: Arc<dyn NlToSqlGenerator>,
    config: RouterConfig,
}

impl AgentRouter {
    pub fn new(
        classifier: Arc<dyn IntentClassifier>,
        search: Arc<dyn SearchProvider>,
        sandbox: Arc<dyn SandboxProvider>,
        generator: Arc<dyn NlToSqlGenerator>,
        config: RouterConfig,
    ) -> Self {
        Self {
            classifier,
            search,
            sandbox,
            generator,
            config,
        }
    }

    /// Decide which source(s) to invoke, without invoking them.
    pub async fn decide(&self, request: &RouteRequest<'_>) -> RoutingDecision {
        let history = self.window(request.history);
        let mut reasons: Vec<String> = Vec::new();
        let mut resolved_referents: Vec<String> = Vec::new();

        let signal = match self
            .classifier
            .classify(request.utterance, &request.resources, history)
            .await
        {
            Ok(signal) => {
                reasons.push(format!("classifier label: {}", signal.label));
                signal
            }
            Err(e) => {
                // Safest available default: prefer search over silence.
                tracing::warn!(error = %e, "intent classifier failed, using fallback routing");
                reasons.push("classifier unavailable, defaulting to search".to_string());
                IntentSignal {
                    wants_search: request.resources.has_documents,
                    wants_sandbox: false,
                    label: "fallback".to_string(),
                }
            }
        };

        let mut use_search = signal.wants_search && request.resources.has_documents;
        let mut use_sandbox = signal.wants_sandbox && request.resources.has_tables;

        if signal.wants_sandbox && !request.resources.has_tables {
            reasons.push("no structured tables connected, sandbox suppressed".to_string());
        }

        if request.resources.has_tables
            && ANAPHORA.is_match(request.utterance)
            && last_assistant_turn_was_tabular(history)
        {
            if !use_sandbox {
                reasons.push(
                    "anaphoric follow-up to a tabular answer, sandbox forced".to_string(),
                );
            }
            use_sandbox = true;
            if let Some(referent) = preceding_user_utterance(history) {
                resolved_referents.push(referent);
            }
        }

        if request.evidence_only
            && !use_search
            && !use_sandbox
            && request.resources.has_documents
        {
            use_search = true;
            reasons.push("evidence-only mode, search forced over empty routing".to_string());
        }

        RoutingDecision {
            use_search,
            use_sandbox,
            reasoning: reasons.join("; "),
            resolved_referents,
        }
    }

    /// Decide, retrieve, and assemble the evidence bundle for the answer
    /// generator. Never falls through to unconstrained generation while
    /// evidence-only mode is active.
    pub async fn route(&self, request: &RouteRequest<'_>) -> EvidenceBundle {
        let decision = self.decide(request).await;

        let candidates = if decision.use_search {
            let outcome = self
                .search
                .search(request.utterance, request.owner_id)
                .await;
            if outcome.degraded {
                tracing::warn!(owner_id = %request.owner_id, "retrieval degraded, continuing on partial evidence");
            }
            Some(outcome.candidates)
        } else {
            None
        };

        let sql = if decision.use_sandbox {
            self.run_sandbox_path(request).await
        } else {
            None
        };

        let evidence = match (candidates, sql) {
            (Some(candidates), Some(sql)) => RetrievalResult::Combined { candidates, sql },
            (Some(candidates), None) => RetrievalResult::Search(candidates),
            (None, Some(sql)) => RetrievalResult::Sandbox(sql),
            (None, None) => RetrievalResult::Empty,
        };

        let directive = if request.evidence_only && !evidence.has_evidence() {
            tracing::info!(owner_id = %request.owner_id, "evidence exhausted, emitting fixed refusal");
            AnswerDirective::Refuse {
                message: NO_EVIDENCE_REPLY,
            }
        } else {
            AnswerDirective::Generate {
                evidence_only: request.evidence_only,
            }
        };

        EvidenceBundle {
            decision,
            evidence,
            directive,
        }
    }

    async fn run_sandbox_path(&self, request: &RouteRequest<'_>) -> Option<SqlEvidence> {
        let profile = match request.profile {
            Some(profile) => profile,
            None => {
                tracing::warn!(
                    owner_id = %request.owner_id,
                    "sandbox path chosen but no connection profile supplied"
                );
                return None;
            }
        };

        let history = self.window(request.history);
        let generation = match self
            .generator
            .generate(request.utterance, &request.schema, history)
            .await
        {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(owner_id = %request.owner_id, error = %e, "NL-to-SQL generation failed");
                return None;
            }
        };

        if generation.needs_clarification {
            return Some(SqlEvidence {
                sql: generation.sql,
                explanation: generation.explanation,
                outcome: None,
                needs_clarification: true,
                clarification: generation.clarification,
            });
        }

        let outcome = match self
            .sandbox
            .execute(profile, request.owner_id, &generation.sql)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                // Owner mismatch and decryption failures are surfaced in
                // the bundle, not swallowed.
                tracing::error!(owner_id = %request.owner_id, error = %e, "sandbox execution refused");
                QueryOutcome::failure(e.to_string(), 0)
            }
        };

        Some(SqlEvidence {
            sql: generation.sql,
            explanation: generation.explanation,
            outcome: Some(outcome),
            needs_clarification: false,
            clarification: None,
        })
    }

    fn window<'h>(&self, history: &'h [ConversationTurn]) -> &'h [ConversationTurn] {
        let start = history.len().saturating_sub(self.config.history_window);
        &history[start..]
    }
}

fn last_assistant_turn_was_tabular(history: &[ConversationTurn]) -> bool {
    history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::Assistant)
        .map(|t| t.tabular)
        .unwrap_or(false)
}

/// The user utterance that opened the preceding turn pair; the referent of
/// a follow-up like "list them".
fn preceding_user_utterance(history: &[ConversationTurn]) -> Option<String> {
    history
        .iter()
        .rev()
        .find(|t| t.role == TurnRole::User)
        .map(|t| t.content.clone())
}
