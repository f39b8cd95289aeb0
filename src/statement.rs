//! Statement classification.
//!
//! Uses sqlparser-rs with the PostgreSQL dialect to decide what kind of
//! statement the configured query is and whether it produces rows. The result
//! only informs logging and result collection: unparseable SQL is still sent to
//! the database, which has the final word on validity.

use std::fmt;

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::config::ResultMode;

/// Broad category of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// SELECT, VALUES, EXPLAIN, SHOW and friends.
    Query,
    /// INSERT, UPDATE, DELETE, MERGE, COPY.
    Modification,
    /// CREATE, ALTER, DROP, TRUNCATE, GRANT, REVOKE.
    Schema,
    /// Anything else the parser understood (SET, transaction control, ...).
    Other,
    /// The parser rejected the SQL.
    Unparsed,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Modification => write!(f, "modification"),
            Self::Schema => write!(f, "schema change"),
            Self::Other => write!(f, "other"),
            Self::Unparsed => write!(f, "unparsed"),
        }
    }
}

/// What the classifier learned about a SQL string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Kind of the last statement (the one whose rows a client would see).
    pub kind: StatementKind,
    /// Whether the last statement produces a result set.
    pub returns_rows: bool,
    /// Number of statements in the string; zero when unparsed.
    pub statement_count: usize,
}

impl Classification {
    fn unparsed() -> Self {
        Self {
            kind: StatementKind::Unparsed,
            returns_rows: false,
            statement_count: 0,
        }
    }

    /// Decides whether rows should be fetched and returned under `mode`.
    pub fn should_fetch_rows(&self, mode: ResultMode) -> bool {
        match mode {
            ResultMode::Always => true,
            ResultMode::Never => false,
            ResultMode::Auto => self.returns_rows,
        }
    }
}

/// Classifies a SQL string.
pub fn classify(sql: &str) -> Classification {
    let dialect = PostgreSqlDialect {};
    let statements = match Parser::parse_sql(&dialect, sql) {
        Ok(statements) => statements,
        Err(_) => return Classification::unparsed(),
    };

    let Some(last) = statements.last() else {
        return Classification::unparsed();
    };

    let (kind, returns_rows) = classify_statement(last);
    Classification {
        kind,
        returns_rows,
        statement_count: statements.len(),
    }
}

fn classify_statement(statement: &Statement) -> (StatementKind, bool) {
    match statement {
        Statement::Query(_) => (StatementKind::Query, true),
        Statement::Explain { .. } | Statement::ExplainTable { .. } => (StatementKind::Query, true),
        Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. } => (StatementKind::Query, true),

        Statement::Insert(insert) => (StatementKind::Modification, insert.returning.is_some()),
        Statement::Update { returning, .. } => (StatementKind::Modification, returning.is_some()),
        Statement::Delete(delete) => (StatementKind::Modification, delete.returning.is_some()),
        Statement::Merge { .. } | Statement::Copy { .. } => (StatementKind::Modification, false),

        Statement::Drop { .. }
        | Statement::Truncate { .. }
        | Statement::AlterTable { .. }
        | Statement::AlterIndex { .. }
        | Statement::AlterView { .. }
        | Statement::AlterRole { .. }
        | Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. }
        | Statement::CreateSchema { .. }
        | Statement::CreateDatabase { .. }
        | Statement::CreateFunction { .. }
        | Statement::CreateProcedure { .. }
        | Statement::CreateRole { .. }
        | Statement::CreateSequence { .. }
        | Statement::CreateType { .. }
        | Statement::Grant { .. }
        | Statement::Revoke { .. } => (StatementKind::Schema, false),

        _ => (StatementKind::Other, false),
    }
}
