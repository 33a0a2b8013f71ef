//! SQL execution tool: runs a single read-only SELECT against the sales database.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use super::{ParamType, ToolError, ToolHandler, ToolInput, ToolSpec};

pub const SQL_TOOL_NAME: &str = "execute_sql_query";

const SQL_PARAM: &str = "sql_query";

pub const SELECT_ONLY: &str = "Error: Only SELECT queries are allowed for security reasons.";
pub const NO_RESULTS: &str = "Query executed successfully, but no results were found.";

/// Why a statement was refused before reaching the database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardRejection {
    #[error("statement does not start with SELECT")]
    NotSelect,

    #[error("more than one statement")]
    MultipleStatements,
}

/// Accept only a single statement whose first keyword is `SELECT`.
pub fn check_select_only(sql: &str) -> Result<(), GuardRejection> {
    let normalized = sql.trim().to_uppercase();
    let rest = normalized
        .strip_prefix("SELECT")
        .ok_or(GuardRejection::NotSelect)?;
    match rest.chars().next() {
        None => {}
        Some(c) if c.is_whitespace() || c == '(' || c == '*' => {}
        Some(_) => return Err(GuardRejection::NotSelect),
    }

    if has_second_statement(sql) {
        return Err(GuardRejection::MultipleStatements);
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// True when anything other than whitespace or comments follows a `;` that
/// sits outside literals, quoted identifiers and comments.
fn has_second_statement(sql: &str) -> bool {
    let mut state = Scan::Code;
    let mut terminated = false;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            Scan::Code => match c {
                '\'' | '"' | '`' => {
                    if terminated {
                        return true;
                    }
                    state = Scan::Quoted(c);
                }
                '[' => {
                    if terminated {
                        return true;
                    }
                    state = Scan::Quoted(']');
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = Scan::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                }
                ';' => {
                    if terminated {
                        return true;
                    }
                    terminated = true;
                }
                c if c.is_whitespace() => {}
                _ => {
                    if terminated {
                        return true;
                    }
                }
            },
            // A doubled quote inside a literal is an escaped quote: leaving and
            // re-entering the literal handles it.
            Scan::Quoted(close) => {
                if c == close {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                if c == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = Scan::Code;
                }
            }
        }
    }
    false
}

/// Rows returned by a successful query, already rendered as text cells.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Rows dropped by the row cap
    pub truncated: usize,
}

#[derive(Debug, Error)]
pub enum QueryError {
    /// The statement itself is wrong: syntax, unknown table or column, type errors.
    #[error("{0}")]
    Database(#[from] rusqlite::Error),

    /// Anything not caused by the statement: unopenable database, worker failure.
    #[error("{0}")]
    Unexpected(String),
}

/// Executes guarded SELECT statements against a SQLite file.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    database_path: PathBuf,
    max_rows: usize,
}

impl SqlExecutor {
    pub fn new(database_path: impl Into<PathBuf>, max_rows: usize) -> Self {
        Self {
            database_path: database_path.into(),
            max_rows: max_rows.max(1),
        }
    }

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            SQL_TOOL_NAME,
            "Executes a SQL SELECT query against the sales database (SQLite) and returns the \
             results as comma-separated rows with a header. Only SELECT queries are allowed. \
             Input must be the complete and correct SQL SELECT query.",
        )
        .param(SQL_PARAM, ParamType::String)
    }

    /// Run `sql` and render the outcome for the model.
    pub async fn execute_sql_query(&self, sql: &str) -> String {
        if let Err(rejection) = check_select_only(sql) {
            tracing::warn!("Rejected SQL ({}): {}", rejection, sql);
            return SELECT_ONLY.to_string();
        }

        tracing::info!("Executing SQL: {}", sql);
        let path = self.database_path.clone();
        let statement = sql.to_string();
        let max_rows = self.max_rows;
        let outcome = tokio::task::spawn_blocking(move || run_query(&path, &statement, max_rows))
            .await
            .unwrap_or_else(|e| Err(QueryError::Unexpected(e.to_string())));

        match outcome {
            Ok(result) if result.rows.is_empty() => NO_RESULTS.to_string(),
            Ok(result) => render_csv(&result),
            Err(QueryError::Database(e)) => format!("Database Query Error: {}", e),
            Err(QueryError::Unexpected(e)) => {
                tracing::error!("Unexpected SQL execution failure: {}", e);
                format!("An unexpected error occurred during SQL execution: {}", e)
            }
        }
    }
}

#[async_trait]
impl ToolHandler for SqlExecutor {
    async fn call(&self, input: &ToolInput) -> Result<String, ToolError> {
        let sql = input
            .get(SQL_PARAM)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::Failed(format!("missing '{}'", SQL_PARAM)))?;
        Ok(self.execute_sql_query(sql).await)
    }
}

/// Open a read-only connection for this call only and run `sql`.
///
/// The connection is dropped on every return path.
pub fn run_query(path: &Path, sql: &str, max_rows: usize) -> Result<QueryResult, QueryError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| QueryError::Unexpected(format!("cannot open {}: {}", path.display(), e)))?;

    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();

    let mut rows = Vec::new();
    let mut truncated = 0;
    let mut cursor = stmt.query([])?;
    while let Some(row) = cursor.next()? {
        if rows.len() >= max_rows {
            truncated += 1;
            continue;
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(render_value(row.get_ref(i)?));
        }
        rows.push(cells);
    }

    Ok(QueryResult {
        columns,
        rows,
        truncated,
    })
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{:.1}", f)
            } else {
                f.to_string()
            }
        }
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => format!("<blob {} bytes>", bytes.len()),
    }
}

fn csv_cell(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

fn csv_line(cells: &[String]) -> String {
    cells
        .iter()
        .map(|c| csv_cell(c))
        .collect::<Vec<_>>()
        .join(",")
}

/// Header line plus one comma-delimited line per row.
pub fn render_csv(result: &QueryResult) -> String {
    let mut lines = Vec::with_capacity(result.rows.len() + 2);
    lines.push(csv_line(&result.columns));
    lines.extend(result.rows.iter().map(|r| csv_line(r)));
    if result.truncated > 0 {
        lines.push(format!("... ({} more rows truncated)", result.truncated));
    }
    lines.join("\n")
}
