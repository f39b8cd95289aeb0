//! Statement result types.
//!
//! Defines the structures used to carry an executed statement's outcome back
//! to the response.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of executing the configured statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column metadata; empty when rows were not fetched.
    pub columns: Vec<ColumnInfo>,

    /// Fetched rows; empty when rows were not fetched.
    pub rows: Vec<Row>,

    /// Rows affected, or rows fetched when the statement returned a result set.
    pub rows_affected: u64,

    /// Time spent executing and committing.
    pub execution_time: Duration,
}

impl QueryResult {
    /// Creates a query result carrying the given columns and rows.
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            columns,
            rows,
            rows_affected,
            execution_time: Duration::ZERO,
        }
    }

    /// Creates a result for a statement that returned no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// Sets the execution time.
    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time = duration;
        self
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// A single value from a result row.
///
/// Serializes as the plain JSON value (`null`, `true`, `42`, `"text"`), so rows
/// render as JSON arrays in the response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}
