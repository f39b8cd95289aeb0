//! Database access through the local proxy.
//!
//! The runner talks to the database through two traits: a [`Connector`] that
//! opens exactly one connection per invocation, and the [`DatabaseClient`] it
//! returns, which runs the configured statement inside a transaction.

mod mock;
mod postgres;
mod types;

pub use mock::{MockConnector, MockStats};
pub use postgres::{PostgresClient, PostgresConnector};
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Where and as whom to connect.
#[derive(Clone)]
pub struct ConnectTarget {
    /// Loopback address the proxy listens on.
    pub addr: SocketAddr,

    pub database: String,

    pub user: String,

    /// Omitted under automatic IAM authentication, where the proxy supplies the token.
    pub password: Option<String>,

    pub connect_timeout: Duration,
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("addr", &self.addr)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectTarget {
    /// Returns a display-safe string for logs and error messages.
    pub fn display_string(&self) -> String {
        format!("{} @ {} as {}", self.database, self.addr, self.user)
    }
}

/// Opens database connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens one connection to `target`.
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DatabaseClient>>;
}

/// A single open database connection.
///
/// All failures are reported as execution errors.
#[async_trait]
pub trait DatabaseClient: Send {
    /// Runs `sql` in a transaction and commits it.
    ///
    /// When `fetch_rows` is set the result set is collected; otherwise only the
    /// affected row count is reported. A failed statement rolls the
    /// transaction back.
    async fn execute(
        &mut self,
        sql: &str,
        fetch_rows: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResult>;

    /// Closes the connection.
    async fn close(self: Box<Self>) -> Result<()>;
}
