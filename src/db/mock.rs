//! Mock database connector for testing.
//!
//! Scripts connection and statement outcomes and counts what the runner did
//! with them, so tests can assert that a connection was never attempted or
//! was released after a failure.

use super::{ColumnInfo, ConnectTarget, Connector, DatabaseClient, QueryResult, Row};
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Counters shared between a [`MockConnector`] and the clients it hands out.
#[derive(Debug, Default)]
pub struct MockStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    statements: Mutex<Vec<String>>,
    targets: Mutex<Vec<String>>,
}

impl MockStats {
    /// Number of connection attempts, successful or not.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Statements passed to `execute`, in order.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Display strings of every target a connection was attempted against.
    pub fn targets(&self) -> Vec<String> {
        self.targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A connector whose connections return predefined results.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    connect_error: Option<String>,
    statement_error: Option<String>,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    stats: Arc<MockStats>,
}

impl MockConnector {
    /// Creates a connector whose statements succeed with no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every connection attempt fail with `message`.
    pub fn rejecting_connections(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// Makes every statement fail with `message`.
    pub fn rejecting_statements(mut self, message: impl Into<String>) -> Self {
        self.statement_error = Some(message.into());
        self
    }

    /// Returns `rows` from statements executed with row fetching.
    pub fn returning(mut self, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        self.columns = columns;
        self.rows = rows;
        self
    }

    /// Shared counters for assertions.
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DatabaseClient>> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        self.stats
            .targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(target.display_string());

        if let Some(message) = &self.connect_error {
            return Err(RunnerError::connection(message.clone()));
        }

        Ok(Box::new(MockClient {
            statement_error: self.statement_error.clone(),
            columns: self.columns.clone(),
            rows: self.rows.clone(),
            stats: Arc::clone(&self.stats),
        }))
    }
}

struct MockClient {
    statement_error: Option<String>,
    columns: Vec<ColumnInfo>,
    rows: Vec<Row>,
    stats: Arc<MockStats>,
}

#[async_trait]
impl DatabaseClient for MockClient {
    async fn execute(
        &mut self,
        sql: &str,
        fetch_rows: bool,
        _timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        self.stats
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sql.to_string());

        if let Some(message) = &self.statement_error {
            return Err(RunnerError::execution(message.clone()));
        }

        let result = if fetch_rows {
            QueryResult::with_data(self.columns.clone(), self.rows.clone())
        } else {
            QueryResult::affected(self.rows.len() as u64)
        };
        Ok(result.with_execution_time(Duration::from_millis(1)))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
