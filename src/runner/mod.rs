//! The proxy-mediated query runner.
//!
//! One invocation reads its request from the environment, makes sure the proxy
//! binary is cached, starts (or reuses) the proxy, opens one connection through
//! it, runs the configured statement and reports the outcome.

mod reporter;
mod response;

pub use reporter::{Phase, RecordingReporter, Reporter, TracingReporter};
pub use response::{Invocation, InvocationResponse, Status, SUCCESS_MESSAGE};

use crate::config::{Config, Environment, ProxyLifetime, QueryRequest};
use crate::db::{ConnectTarget, Connector, PostgresConnector, QueryResult};
use crate::error::{Result, RunnerError};
use crate::proxy::{Fetcher, HttpFetcher, ProxyBinary, ProxyHandle};
use crate::statement;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Runs invocations against a shared configuration.
///
/// Collaborators are trait objects so the download, the database and the
/// progress sink can be replaced; [`Runner::new`] wires the production ones.
pub struct Runner {
    config: Arc<Config>,
    env: Environment,
    binary: ProxyBinary,
    fetcher: Arc<dyn Fetcher>,
    connector: Arc<dyn Connector>,
    reporter: Arc<dyn Reporter>,
    resident: Mutex<Option<ProxyHandle>>,
    /// Held for the whole life of a per-invocation proxy: every proxy listens
    /// on the same port, so two must never run at once.
    port_lock: Mutex<()>,
}

impl Runner {
    /// Creates a runner with the HTTP fetcher, PostgreSQL connector and tracing reporter.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let fetcher = HttpFetcher::new(config.proxy.download_timeout())?;
        let binary = ProxyBinary::new(&config.proxy.binary_path, &config.proxy.download_url);

        Ok(Self {
            config: Arc::new(config),
            env: Environment::Process,
            binary,
            fetcher: Arc::new(fetcher),
            connector: Arc::new(PostgresConnector),
            reporter: Arc::new(TracingReporter),
            resident: Mutex::new(None),
            port_lock: Mutex::new(()),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Reads requests from `env` instead of the process environment.
    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = env;
        self
    }

    /// Runs one invocation with a request read from the environment.
    pub async fn invoke_from_env(&self) -> Invocation {
        let span = info_span!("invocation", id = %Uuid::new_v4().simple());
        async {
            let started = Instant::now();
            self.reporter.phase(Phase::Validating);
            let outcome = match QueryRequest::from_env(&self.env, &self.config.defaults) {
                Ok(request) => self.execute(&request).await,
                Err(e) => Err(e),
            };
            self.finish(outcome, started)
        }
        .instrument(span)
        .await
    }

    /// Runs one invocation for an already-built request.
    pub async fn invoke(&self, request: &QueryRequest) -> Invocation {
        let span = info_span!("invocation", id = %Uuid::new_v4().simple());
        async {
            let started = Instant::now();
            let outcome = self.execute(request).await;
            self.finish(outcome, started)
        }
        .instrument(span)
        .await
    }

    /// Like [`Runner::invoke_from_env`], on its own task.
    ///
    /// A panic inside the invocation becomes an execution error instead of
    /// tearing down the caller.
    pub async fn invoke_isolated(self: &Arc<Self>) -> Invocation {
        let started = Instant::now();
        let runner = Arc::clone(self);
        match tokio::spawn(async move { runner.invoke_from_env().await }).await {
            Ok(invocation) => invocation,
            Err(e) => {
                let error = RunnerError::execution(format!("invocation aborted: {e}"));
                let invocation = Invocation::failure(&error, started.elapsed());
                self.reporter.finished(&invocation);
                invocation
            }
        }
    }

    /// Terminates the resident proxy, if one is running.
    pub async fn shutdown(&self) {
        if let Some(proxy) = self.resident.lock().await.take() {
            info!(pid = ?proxy.pid(), "Stopping resident Cloud SQL Proxy");
            proxy.shutdown().await;
        }
    }

    fn finish(&self, outcome: Result<(QueryResult, bool)>, started: Instant) -> Invocation {
        let invocation = match outcome {
            Ok((result, include_rows)) => {
                Invocation::success(result, include_rows, started.elapsed())
            }
            Err(e) => Invocation::failure(&e, started.elapsed()),
        };
        self.reporter.finished(&invocation);
        invocation
    }

    /// Returns the statement result and whether its rows belong in the response.
    async fn execute(&self, request: &QueryRequest) -> Result<(QueryResult, bool)> {
        info!("Running query against {}", request.display_string());

        let classification = statement::classify(&request.sql_query);
        debug!(
            kind = %classification.kind,
            statements = classification.statement_count,
            "Classified SQL_QUERY"
        );
        if classification.statement_count > 1 {
            warn!(
                "SQL_QUERY holds {} statements; they run in one transaction",
                classification.statement_count
            );
        }
        let fetch_rows = classification.should_fetch_rows(self.config.database.results);

        self.reporter.phase(Phase::AcquiringProxy);
        let binary = self.binary.ensure(self.fetcher.as_ref()).await?;

        let result = match self.config.proxy.lifetime {
            ProxyLifetime::PerInvocation => {
                let _port = self.port_lock.lock().await;
                let proxy = self.start_proxy(binary, request).await?;
                let result = self
                    .run_statement(request, proxy.listen_addr(), fetch_rows)
                    .await;
                proxy.shutdown().await;
                result
            }
            ProxyLifetime::Resident => {
                let addr = self.resident_proxy(binary, request).await?;
                self.run_statement(request, addr, fetch_rows).await
            }
        }?;

        info!(
            rows_affected = result.rows_affected,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "SQL query committed"
        );
        Ok((result, fetch_rows))
    }

    async fn start_proxy(&self, binary: &Path, request: &QueryRequest) -> Result<ProxyHandle> {
        self.reporter.phase(Phase::StartingProxy);
        let proxy = ProxyHandle::launch(
            binary,
            &self.config.proxy,
            &request.instance_connection_name,
        )
        .await?;

        self.reporter.phase(Phase::AwaitingReadiness);
        if let Err(e) = proxy.wait_ready(&self.config.proxy.readiness).await {
            proxy.shutdown().await;
            return Err(e);
        }
        Ok(proxy)
    }

    /// Returns the address of a live resident proxy for the request's instance,
    /// starting one if needed.
    async fn resident_proxy(&self, binary: &Path, request: &QueryRequest) -> Result<SocketAddr> {
        let mut slot = self.resident.lock().await;

        if let Some(proxy) = slot.as_ref() {
            if proxy.is_running() && proxy.instance() == request.instance_connection_name {
                debug!(pid = ?proxy.pid(), "Reusing resident Cloud SQL Proxy");
                return Ok(proxy.listen_addr());
            }
        }

        if let Some(stale) = slot.take() {
            info!(pid = ?stale.pid(), "Replacing resident Cloud SQL Proxy");
            stale.shutdown().await;
        }

        let proxy = self.start_proxy(binary, request).await?;
        let addr = proxy.listen_addr();
        *slot = Some(proxy);
        Ok(addr)
    }

    /// Opens one connection, runs the statement and always releases the connection.
    async fn run_statement(
        &self,
        request: &QueryRequest,
        addr: SocketAddr,
        fetch_rows: bool,
    ) -> Result<QueryResult> {
        self.reporter.phase(Phase::Connecting);
        let target = ConnectTarget {
            addr,
            database: request.db_name.clone(),
            user: request.db_user.clone(),
            password: request.db_password.clone(),
            connect_timeout: self.config.database.connect_timeout(),
        };
        let mut client = self.connector.connect(&target).await?;

        self.reporter.phase(Phase::Executing);
        let result = client
            .execute(
                &request.sql_query,
                fetch_rows,
                self.config.database.statement_timeout(),
            )
            .await;

        self.reporter.phase(Phase::Releasing);
        if let Err(e) = client.close().await {
            warn!("Failed to release database connection: {e}");
        }

        result
    }
}
