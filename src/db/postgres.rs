//! PostgreSQL client implementation.
//!
//! Provides the `PostgresConnector` and `PostgresClient` that implement the
//! database traits over a single sqlx `PgConnection` to the proxy's loopback
//! port.

use crate::db::{ColumnInfo, ConnectTarget, Connector, DatabaseClient, QueryResult, Row, Value};
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, PgSslMode};
use sqlx::{Column as SqlxColumn, ConnectOptions, Connection, Executor, Row as SqlxRow, TypeInfo};
use std::time::{Duration, Instant};
use tracing::debug;

const APPLICATION_NAME: &str = "cloudsql-runner";

/// Opens [`PostgresClient`] connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresConnector;

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DatabaseClient>> {
        let client = PostgresClient::connect(target).await?;
        Ok(Box::new(client))
    }
}

/// One PostgreSQL connection.
#[derive(Debug)]
pub struct PostgresClient {
    conn: PgConnection,
}

impl PostgresClient {
    /// Connects to `target` without TLS; the proxy encrypts the onward hop.
    pub async fn connect(target: &ConnectTarget) -> Result<Self> {
        let mut options = PgConnectOptions::new()
            .host(&target.addr.ip().to_string())
            .port(target.addr.port())
            .username(&target.user)
            .database(&target.database)
            .ssl_mode(PgSslMode::Disable)
            .application_name(APPLICATION_NAME);
        if let Some(password) = &target.password {
            options = options.password(password);
        }

        debug!("Connecting to {}", target.display_string());

        let conn = tokio::time::timeout(target.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                RunnerError::connection(format!(
                    "Connection to {} timed out after {} seconds.",
                    target.addr,
                    target.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| map_connection_error(e, target))?;

        debug!("Connected to {}", target.display_string());
        Ok(Self { conn })
    }
}

#[async_trait]
impl DatabaseClient for PostgresClient {
    async fn execute(
        &mut self,
        sql: &str,
        fetch_rows: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        let start = Instant::now();
        let work = run_in_transaction(&mut self.conn, sql, fetch_rows);

        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                RunnerError::execution(format!(
                    "Query timed out after {} seconds",
                    limit.as_secs()
                ))
            })??,
            None => work.await?,
        };

        Ok(result.with_execution_time(start.elapsed()))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn
            .close()
            .await
            .map_err(|e| RunnerError::connection(format!("Failed to close connection: {e}")))
    }
}

/// Executes `sql` with the simple query protocol inside a transaction.
///
/// Returning early drops the transaction, which rolls it back.
async fn run_in_transaction(
    conn: &mut PgConnection,
    sql: &str,
    fetch_rows: bool,
) -> Result<QueryResult> {
    let mut tx = conn
        .begin()
        .await
        .map_err(|e| RunnerError::execution(format_query_error(e)))?;

    let db: &mut PgConnection = &mut tx;

    let result = if fetch_rows {
        let rows = Executor::fetch_all(&mut *db, sqlx::raw_sql(sql))
            .await
            .map_err(|e| RunnerError::execution(format_query_error(e)))?;

        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                    .collect()
            })
            .unwrap_or_default();

        QueryResult::with_data(columns, rows.iter().map(convert_row).collect())
    } else {
        let done = Executor::execute(&mut *db, sqlx::raw_sql(sql))
            .await
            .map_err(|e| RunnerError::execution(format_query_error(e)))?;
        QueryResult::affected(done.rows_affected())
    };

    tx.commit()
        .await
        .map_err(|e| RunnerError::execution(format_query_error(e)))?;

    Ok(result)
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        // Simple-protocol results arrive as text, so anything else (NUMERIC,
        // timestamps, UUID, JSON) is taken as its textual form.
        _ => row
            .try_get::<Option<String>, _>(index)
            .or_else(|_| row.try_get_unchecked::<Option<String>, _>(index))
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Maps sqlx connection errors to user-friendly messages.
fn map_connection_error(error: sqlx::Error, target: &ConnectTarget) -> RunnerError {
    let addr = target.addr;
    let user = &target.user;
    let database = &target.database;

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        RunnerError::connection(format!(
            "Cannot connect to {addr}. Check that the Cloud SQL Proxy is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        RunnerError::connection(format!(
            "Authentication failed for user '{user}'. Check the IAM database user and its grants."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        RunnerError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        RunnerError::connection(format!(
            "Connection to {addr} timed out. The proxy may still be establishing its tunnel."
        ))
    } else {
        RunnerError::connection(error.to_string())
    }
}

/// Formats a statement error with PostgreSQL detail and hint when available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = String::from("ERROR: ");
    result.push_str(db_error.message());

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }

        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }

        if let Some(table) = pg_error.table() {
            result.push_str("\n  TABLE: ");
            result.push_str(table);
        }

        if let Some(constraint) = pg_error.constraint() {
            result.push_str("\n  CONSTRAINT: ");
            result.push_str(constraint);
        }
    }

    result
}
