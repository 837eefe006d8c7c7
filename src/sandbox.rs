//! SQL sandbox executor.
//!
//! Composes the credential vault, the pool registry, and the read-only
//! validator to run caller-supplied SQL against a user-owned database with
//! no possibility of mutation, unbounded runtime, or unbounded result
//! size.
//!
//! Failure semantics: validation and execution failures cross this
//! boundary as [`QueryOutcome`] values with `success = false`, never as
//! panics or raw errors. The two exceptions are owner mismatch and
//! credential decryption failure, which are surfaced as [`SandboxError`] —
//! neither is a condition to retry or to answer around.
//!
//! The decrypted DSN lives only inside [`SqlSandboxExecutor::run`]'s stack
//! frame; logs carry profile and owner identifiers and a truncated query
//! excerpt, never the credential or the full statement.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo};
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::models::{ColumnMeta, ConnectionProfile, QueryOutcome, QueryPlan};
use crate::pool::PoolRegistry;
use crate::validate::{build_plan, excerpt_for_log, SqlRejected};
use crate::vault::{CredentialVault, VaultError};

/// Conditions that cannot be folded into a failed [`QueryOutcome`].
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The requesting owner does not own the profile. Nothing was
    /// decrypted or executed.
    #[error("profile {0} does not belong to the requesting owner")]
    OwnerMismatch(String),

    /// The stored credential failed to decrypt. Fatal for this profile
    /// until the credential is re-entered.
    #[error(transparent)]
    Decryption(#[from] VaultError),
}

/// Table identifiers accepted by [`SqlSandboxExecutor::preview_table`]:
/// plain or schema-qualified, no quoting tricks.
static TABLE_IDENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("table identifier regex is valid")
});

/// Executes validated, capped, timed queries over pooled connections.
pub struct SqlSandboxExecutor {
    vault: Arc<CredentialVault>,
    registry: Arc<PoolRegistry>,
    config: SandboxConfig,
}

impl SqlSandboxExecutor {
    pub fn new(
        vault: Arc<CredentialVault>,
        registry: Arc<PoolRegistry>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            vault,
            registry,
            config,
        }
    }

    /// Validate and execute one statement under the standard row cap.
    pub async fn execute(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        sql: &str,
    ) -> Result<QueryOutcome, SandboxError> {
        self.run(profile, owner_id, sql, self.config.row_cap).await
    }

    /// Run a sequence of statements, stopping at the first failure. The
    /// failed outcome is included as the last element.
    pub async fn execute_queries(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        statements: &[String],
    ) -> Result<Vec<QueryOutcome>, SandboxError> {
        let mut outcomes = Vec::with_capacity(statements.len());
        for sql in statements {
            let outcome = self.execute(profile, owner_id, sql).await?;
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Round-trip probe through the full decrypt → pool → execute path.
    pub async fn test_connection(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
    ) -> Result<QueryOutcome, SandboxError> {
        self.run(profile, owner_id, "SELECT 1", 1).await
    }

    /// Fetch the first rows of a table for display.
    pub async fn preview_table(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        table: &str,
    ) -> Result<QueryOutcome, SandboxError> {
        if !TABLE_IDENT.is_match(table) {
            return Ok(QueryOutcome::failure(
                format!("invalid table identifier: {}", table),
                0,
            ));
        }
        let quoted = table
            .split('.')
            .map(|part| format!("\"{}\"", part))
            .collect::<Vec<_>>()
            .join(".");
        let sql = format!("SELECT * FROM {}", quoted);
        self.run(profile, owner_id, &sql, self.config.preview_rows)
            .await
    }

    async fn run(
        &self,
        profile: &ConnectionProfile,
        owner_id: &str,
        sql: &str,
        row_cap: i64,
    ) -> Result<QueryOutcome, SandboxError> {
        if profile.owner_id != owner_id {
            tracing::warn!(
                profile_id = %profile.id,
                owner_id,
                "rejected sandbox call for foreign profile"
            );
            return Err(SandboxError::OwnerMismatch(profile.id.clone()));
        }

        let started = Instant::now();

        let plan = match build_plan(sql, row_cap) {
            Ok(plan) => plan,
            Err(rejection) => {
                return Ok(self.rejected(profile, sql, rejection, started));
            }
        };

        // The plaintext DSN exists only within this scope.
        let dsn = self.vault.decrypt(&profile.encrypted_dsn).map_err(|e| {
            tracing::error!(profile_id = %profile.id, error = %e, "credential decryption failed");
            SandboxError::Decryption(e)
        })?;
        let pool = match self.registry.get_pool(profile, &dsn).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(
                    profile_id = %profile.id,
                    owner_id,
                    error = %e,
                    "sandbox connection failed"
                );
                return Ok(QueryOutcome::failure(
                    format!("connection failed: {}", e),
                    started.elapsed().as_millis() as u64,
                ));
            }
        };
        drop(dsn);

        tracing::debug!(
            profile_id = %profile.id,
            owner_id,
            kind = %plan.statement_kind,
            excerpt = %excerpt_for_log(&plan.rewritten_sql),
            "executing sandboxed statement"
        );

        // The server enforces statement_timeout via the pool's connect
        // options; this is the client-side backstop, slightly behind so
        // the engine's own error wins when both fire.
        let backstop = Duration::from_millis(self.config.statement_timeout_ms + 500);
        let fetched =
            tokio::time::timeout(backstop, sqlx::query(&plan.rewritten_sql).fetch_all(&pool))
                .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match fetched {
            Ok(Ok(rows)) => Ok(self.collect(&plan, rows, elapsed_ms)),
            Ok(Err(e)) => {
                tracing::warn!(
                    profile_id = %profile.id,
                    owner_id,
                    excerpt = %excerpt_for_log(&plan.rewritten_sql),
                    error = %e,
                    "sandboxed statement failed"
                );
                Ok(QueryOutcome::failure(
                    format!("execution failed: {}", e),
                    elapsed_ms,
                ))
            }
            Err(_) => {
                tracing::warn!(
                    profile_id = %profile.id,
                    owner_id,
                    timeout_ms = self.config.statement_timeout_ms,
                    "sandboxed statement hit the client-side backstop"
                );
                Ok(QueryOutcome::failure(
                    format!(
                        "statement timed out after {} ms",
                        self.config.statement_timeout_ms
                    ),
                    elapsed_ms,
                ))
            }
        }
    }

    fn rejected(
        &self,
        profile: &ConnectionProfile,
        sql: &str,
        rejection: SqlRejected,
        started: Instant,
    ) -> QueryOutcome {
        tracing::warn!(
            profile_id = %profile.id,
            excerpt = %excerpt_for_log(sql),
            reason = %rejection,
            "rejected sandboxed statement"
        );
        QueryOutcome::failure(
            format!("statement rejected: {}", rejection),
            started.elapsed().as_millis() as u64,
        )
    }

    fn collect(&self, plan: &QueryPlan, rows: Vec<PgRow>, elapsed_ms: u64) -> QueryOutcome {
        let columns: Vec<ColumnMeta> = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| ColumnMeta {
                        name: c.name().to_string(),
                        type_name: c.type_info().name().to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let decoded: Vec<serde_json::Value> = rows.iter().map(row_to_json).collect();
        let row_count = decoded.len();
        let limited = row_count as i64 >= plan.row_limit;

        QueryOutcome {
            success: true,
            rows: decoded,
            row_count,
            columns,
            elapsed_ms,
            error: None,
            limited,
        }
    }
}

/// Decode one Postgres row into a JSON object keyed by column name.
///
/// Unknown types fall back to text decoding and, failing that, to null —
/// evidence display degrades rather than the whole query failing.
fn row_to_json(row: &PgRow) -> serde_json::Value {
    let mut object = serde_json::Map::with_capacity(row.columns().len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, idx, column.type_info().name());
        object.insert(column.name().to_string(), value);
    }
    serde_json::Value::Object(object)
}

fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> serde_json::Value {
    use serde_json::{json, Value};

    match type_name {
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)
            .map(|v| match v {
                Some(d) => json!(d.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| match v {
                Some(u) => json!(u.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| match v {
                Some(t) => json!(t.to_rfc3339()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| match v {
                Some(t) => json!(t.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| match v {
                Some(d) => json!(d.to_string()),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .map(|v| v.unwrap_or(Value::Null))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .map(|v| match v {
                Some(s) => json!(s),
                None => Value::Null,
            })
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::KEY_LENGTH;
    use chrono::Utc;

    fn fixture() -> (SqlSandboxExecutor, CredentialVault) {
        let vault = Arc::new(CredentialVault::new([3u8; KEY_LENGTH]));
        let mut config = SandboxConfig::default();
        config.connect_timeout_secs = 2;
        let registry = Arc::new(PoolRegistry::new(config.clone()));
        (
            SqlSandboxExecutor::new(Arc::clone(&vault), registry, config),
            CredentialVault::new([3u8; KEY_LENGTH]),
        )
    }

    fn profile(owner: &str, encrypted_dsn: String) -> ConnectionProfile {
        ConnectionProfile {
            id: "prof-1".to_string(),
            owner_id: owner.to_string(),
            display_name: "test db".to_string(),
            encrypted_dsn,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_fatal_before_decryption() {
        let (executor, vault) = fixture();
        let p = profile("owner-a", vault.encrypt("postgres://h/db").unwrap());
        let err = executor.execute(&p, "owner-b", "SELECT 1").await;
        assert!(matches!(err, Err(SandboxError::OwnerMismatch(_))));
    }

    #[tokio::test]
    async fn test_validation_failure_is_structured_not_thrown() {
        let (executor, vault) = fixture();
        let p = profile("owner-a", vault.encrypt("postgres://h/db").unwrap());
        let outcome = executor
            .execute(&p, "owner-a", "DROP TABLE users")
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("rejected"));
        assert_eq!(outcome.row_count, 0);
    }

    #[tokio::test]
    async fn test_tampered_credential_surfaces_decryption_error() {
        let (executor, _) = fixture();
        let p = profile("owner-a", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string());
        let err = executor.execute(&p, "owner-a", "SELECT 1").await;
        assert!(matches!(err, Err(SandboxError::Decryption(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_reports_connectivity_failure() {
        let (executor, vault) = fixture();
        let p = profile(
            "owner-a",
            vault.encrypt("postgres://user@127.0.0.1:1/nowhere").unwrap(),
        );
        let outcome = executor.execute(&p, "owner-a", "SELECT 1").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("connection failed"));
    }

    #[tokio::test]
    async fn test_execute_queries_stops_at_first_failure() {
        let (executor, vault) = fixture();
        let p = profile("owner-a", vault.encrypt("postgres://h/db").unwrap());
        let outcomes = executor
            .execute_queries(
                &p,
                "owner-a",
                &[
                    "TRUNCATE a".to_string(), // rejected before any connection
                    "SELECT 1".to_string(),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].success);
    }

    #[tokio::test]
    async fn test_preview_rejects_suspicious_identifiers() {
        let (executor, vault) = fixture();
        let p = profile("owner-a", vault.encrypt("postgres://h/db").unwrap());
        for bad in ["users; drop table x", "a\"b", "1starts_with_digit", "a.b.c"] {
            let outcome = executor.preview_table(&p, "owner-a", bad).await.unwrap();
            assert!(!outcome.success, "expected rejection for {:?}", bad);
            assert!(outcome
                .error
                .as_deref()
                .unwrap()
                .contains("invalid table identifier"));
        }
    }

    #[test]
    fn test_preview_identifier_shapes() {
        assert!(TABLE_IDENT.is_match("orders"));
        assert!(TABLE_IDENT.is_match("public.orders"));
        assert!(TABLE_IDENT.is_match("_private"));
        assert!(!TABLE_IDENT.is_match("or ders"));
        assert!(!TABLE_IDENT.is_match(""));
    }
}
