//! Read-only SQL enforcement for the sandbox.
//!
//! Statements are parsed into an AST with sqlparser's `GenericDialect` and
//! classified against the allow-list {select, show, explain, describe}.
//! A whole-word denylist regex over the raw text runs first as a second
//! line of defense: even if the parser can be fooled about a statement's
//! type, the denylist cannot. A parse failure is treated as invalid —
//! fail closed, never "assume safe."
//!
//! Validation also rewrites the statement to cap result size: an existing
//! `LIMIT` at or below the cap is kept, one above it is replaced, and a
//! missing one is appended. The rewrite operates on the AST and is
//! idempotent.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    Expr, Query, SetExpr, Statement, TableFactor, TableWithJoins, Value,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::models::{QueryPlan, StatementKind};

/// Keywords that must never appear as a whole word anywhere in a sandboxed
/// statement, regardless of what the parser reports.
static DENYLIST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(drop|delete|update|insert|alter|create|truncate|grant|revoke|execute|call|set|reset|copy|load)\b",
    )
    .expect("denylist regex is valid")
});

/// Reasons a statement is rejected by the validator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SqlRejected {
    #[error("empty statement")]
    Empty,

    #[error("statement could not be parsed: {0}")]
    ParseFailure(String),

    #[error("statement kind '{0}' is not allowed in the sandbox")]
    Disallowed(String),

    #[error("denied keyword '{0}' present in statement")]
    DeniedKeyword(String),

    #[error("expected a single statement, found {0}")]
    MultipleStatements(usize),

    #[error("write operation embedded in a subquery")]
    EmbeddedWrite,

    #[error("SELECT INTO writes to a table and is not allowed")]
    SelectInto,
}

/// Validate a caller-supplied statement and produce an execution plan.
///
/// On success the plan carries the allow-listed [`StatementKind`], the
/// tables the statement references, and a rewritten statement with the row
/// cap applied (for `select`; `show`/`explain`/`describe` pass through and
/// rely on the client-side cap alone).
pub fn build_plan(sql: &str, row_cap: i64) -> Result<QueryPlan, SqlRejected> {
    let raw = sql.trim();
    if raw.is_empty() {
        return Err(SqlRejected::Empty);
    }

    // Second line of defense first: cheap, and independent of the parser.
    if let Some(m) = DENYLIST.find(raw) {
        return Err(SqlRejected::DeniedKeyword(m.as_str().to_lowercase()));
    }

    let statements = Parser::parse_sql(&GenericDialect {}, raw)
        .map_err(|e| SqlRejected::ParseFailure(e.to_string()))?;

    match statements.len() {
        0 => return Err(SqlRejected::Empty),
        1 => {}
        n => return Err(SqlRejected::MultipleStatements(n)),
    }
    let mut statement = statements.into_iter().next().expect("one statement");

    let (kind, referenced_tables, row_limit) = match &mut statement {
        Statement::Query(query) => {
            scan_query_for_writes(query)?;
            let tables = collect_tables(query);
            let limit = apply_row_cap(query, row_cap);
            (StatementKind::Select, tables, limit)
        }
        Statement::Explain { statement: inner, .. } => {
            // EXPLAIN over anything but a plain query could execute the
            // inner statement (EXPLAIN ANALYZE), so only queries pass.
            match inner.as_ref() {
                Statement::Query(inner_query) => {
                    scan_query_for_writes(inner_query)?;
                    let tables = collect_tables(inner_query);
                    (StatementKind::Explain, tables, row_cap)
                }
                other => return Err(SqlRejected::Disallowed(first_keyword(&other.to_string()))),
            }
        }
        Statement::ExplainTable { table_name, .. } => (
            StatementKind::Describe,
            vec![table_name.to_string()],
            row_cap,
        ),
        other => {
            let rendered = other.to_string();
            if rendered.trim_start().to_uppercase().starts_with("SHOW") {
                (StatementKind::Show, Vec::new(), row_cap)
            } else {
                return Err(SqlRejected::Disallowed(first_keyword(&rendered)));
            }
        }
    };

    Ok(QueryPlan {
        raw_sql: raw.to_string(),
        statement_kind: kind,
        referenced_tables,
        rewritten_sql: statement.to_string(),
        row_limit,
    })
}

fn first_keyword(rendered: &str) -> String {
    rendered
        .split_whitespace()
        .next()
        .unwrap_or("?")
        .to_lowercase()
}

/// Reject write operations hidden inside the query tree: `INSERT`/`UPDATE`
/// bodies, writable CTEs, `SELECT INTO`, and the same nested in derived
/// tables or set operations.
fn scan_query_for_writes(query: &Query) -> Result<(), SqlRejected> {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            scan_query_for_writes(&cte.query)?;
        }
    }
    scan_set_expr(&query.body)
}

fn scan_set_expr(body: &SetExpr) -> Result<(), SqlRejected> {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                return Err(SqlRejected::SelectInto);
            }
            for twj in &select.from {
                scan_table_with_joins(twj)?;
            }
            Ok(())
        }
        SetExpr::Query(q) => scan_query_for_writes(q),
        SetExpr::SetOperation { left, right, .. } => {
            scan_set_expr(left)?;
            scan_set_expr(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => Ok(()),
        SetExpr::Insert(_) | SetExpr::Update(_) => Err(SqlRejected::EmbeddedWrite),
    }
}

fn scan_table_with_joins(twj: &TableWithJoins) -> Result<(), SqlRejected> {
    scan_table_factor(&twj.relation)?;
    for join in &twj.joins {
        scan_table_factor(&join.relation)?;
    }
    Ok(())
}

fn scan_table_factor(factor: &TableFactor) -> Result<(), SqlRejected> {
    match factor {
        TableFactor::Derived { subquery, .. } => scan_query_for_writes(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => scan_table_with_joins(table_with_joins),
        _ => Ok(()),
    }
}

/// Collect the tables a query references, outermost first, deduplicated.
fn collect_tables(query: &Query) -> Vec<String> {
    let mut tables = Vec::new();
    walk_query_tables(query, &mut tables);
    let mut seen = std::collections::HashSet::new();
    tables.retain(|t| seen.insert(t.clone()));
    tables
}

fn walk_query_tables(query: &Query, out: &mut Vec<String>) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query_tables(&cte.query, out);
        }
    }
    walk_set_expr_tables(&query.body, out);
}

fn walk_set_expr_tables(body: &SetExpr, out: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => {
            for twj in &select.from {
                walk_table_with_joins(twj, out);
            }
        }
        SetExpr::Query(q) => walk_query_tables(q, out),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr_tables(left, out);
            walk_set_expr_tables(right, out);
        }
        _ => {}
    }
}

fn walk_table_with_joins(twj: &TableWithJoins, out: &mut Vec<String>) {
    walk_table_factor(&twj.relation, out);
    for join in &twj.joins {
        walk_table_factor(&join.relation, out);
    }
}

fn walk_table_factor(factor: &TableFactor, out: &mut Vec<String>) {
    match factor {
        TableFactor::Table { name, .. } => out.push(name.to_string()),
        TableFactor::Derived { subquery, .. } => walk_query_tables(subquery, out),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => walk_table_with_joins(table_with_joins, out),
        _ => {}
    }
}

/// Apply the row cap to a query's `LIMIT` clause, returning the effective
/// limit. Keeps an existing limit at or below the cap, replaces one above
/// it (or one that is not a plain number), and appends one when absent.
fn apply_row_cap(query: &mut Query, row_cap: i64) -> i64 {
    let existing = match &query.limit {
        Some(Expr::Value(Value::Number(n, _))) => n.parse::<i64>().ok(),
        Some(_) => None,
        None => None,
    };

    match existing {
        Some(n) if n >= 0 && n <= row_cap => n,
        _ => {
            query.limit = Some(Expr::Value(Value::Number(row_cap.to_string(), false)));
            row_cap
        }
    }
}

/// Truncate a statement for logging. The full payload is never logged.
pub fn excerpt_for_log(sql: &str) -> String {
    const MAX: usize = 80;
    let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() > MAX {
        let cut = flat
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(MAX);
        format!("{}...", &flat[..cut])
    } else {
        flat
    }
}
