//! SQL statement dispatch.
//!
//! A statement is classified once by its leading keyword and every consumer
//! matches on the resulting [`StatementKind`]. Backend failures are reported
//! with the statement echoed back and are never retried.

use tracing::{debug, warn};

use crate::error::{GateError, GateResult};
use crate::outcome::ExecutionResult;

use super::format::render_table;
use super::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Use,
    Show,
    Describe,
    Select,
    /// Anything else: INSERT, UPDATE, DELETE, DDL...
    Mutation,
}

/// Classifies a statement by its first keyword, case-insensitively.
pub fn classify(statement: &str) -> StatementKind {
    let keyword = statement
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    match keyword.as_str() {
        "USE" => StatementKind::Use,
        "SHOW" => StatementKind::Show,
        "DESCRIBE" | "DESC" => StatementKind::Describe,
        "SELECT" => StatementKind::Select,
        _ => StatementKind::Mutation,
    }
}

pub async fn execute(manager: &mut ConnectionManager, statement: &str) -> ExecutionResult {
    try_execute(manager, statement).await.into()
}

pub async fn try_execute(manager: &mut ConnectionManager, statement: &str) -> GateResult<String> {
    let statement = statement.trim().trim_end_matches(';').trim_end();
    if statement.is_empty() {
        return Err(GateError::EmptyCommand);
    }

    let kind = classify(statement);
    debug!("Dispatching {kind:?} statement: {statement}");
    let db_error = |reason: String| {
        warn!("Statement failed: {statement}: {reason}");
        GateError::DatabaseError {
            statement: statement.to_string(),
            reason,
        }
    };

    match kind {
        StatementKind::Use => {
            manager.ensure_live().await?;
            let target = second_word(statement)
                .ok_or_else(|| db_error("USE requires a database name".to_string()))?;
            manager.switch_database(target).await
        }
        StatementKind::Show => {
            let conn = manager.ensure_live().await?;
            let values = if is_show_tables(statement) {
                conn.list_tables().await
            } else {
                conn.fetch(statement).await.map(|rows| rows.first_column())
            }
            .map_err(|e| db_error(e.to_string()))?;

            if values.is_empty() {
                return Ok("No tables found".to_string());
            }
            let listing: Vec<String> = values.iter().map(|v| format!("- {v}")).collect();
            Ok(format!(
                "Found {}:\n{}",
                plural(values.len(), "result"),
                listing.join("\n")
            ))
        }
        StatementKind::Describe => {
            let table = second_word(statement)
                .map(unquote)
                .ok_or_else(|| db_error("DESCRIBE requires a table name".to_string()))?;
            let conn = manager.ensure_live().await?;
            let rows = conn
                .describe_table(table)
                .await
                .map_err(|e| db_error(e.to_string()))?;
            Ok(format!("Structure of {table}:\n{}", render_table(&rows)))
        }
        StatementKind::Select => {
            let conn = manager.ensure_live().await?;
            let rows = conn
                .fetch(statement)
                .await
                .map_err(|e| db_error(e.to_string()))?;
            if rows.is_empty() {
                return Ok("Query returned no rows".to_string());
            }
            Ok(format!(
                "Query returned {}, {}\n{}",
                plural(rows.rows.len(), "row"),
                plural(rows.columns.len(), "column"),
                render_table(&rows)
            ))
        }
        StatementKind::Mutation => {
            let conn = manager.ensure_live().await?;
            let affected = conn
                .execute(statement)
                .await
                .map_err(|e| db_error(e.to_string()))?;
            Ok(format!("Query executed successfully. Rows affected: {affected}"))
        }
    }
}

fn second_word(statement: &str) -> Option<&str> {
    statement.split_whitespace().nth(1)
}

fn unquote(ident: &str) -> &str {
    ident.trim_matches(|c| c == '`' || c == '"')
}

fn is_show_tables(statement: &str) -> bool {
    let words: Vec<String> = statement
        .split_whitespace()
        .map(|w| w.to_ascii_uppercase())
        .collect();
    words == ["SHOW", "TABLES"]
}

pub(crate) fn plural(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}
