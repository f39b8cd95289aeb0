//! End-to-end invocation tests.
//!
//! The proxy binary is a shell script served by a [`StaticFetcher`]. It records
//! each start in a file and then sleeps; readiness is simulated by a listener
//! the test binds on the proxy port. The database side is a [`MockConnector`].
//! Tests that need a proxy owning its port use a small python3 listener and
//! are skipped where python3 is unavailable.

use cloudsql_runner::config::{Config, Environment, ProxyLifetime, QueryRequest};
use async_trait::async_trait;
use cloudsql_runner::db::{
    ColumnInfo, ConnectTarget, Connector, DatabaseClient, MockConnector, QueryResult, Value,
};
use cloudsql_runner::error::{ErrorKind, Result, RunnerError};
use cloudsql_runner::proxy::{FailingFetcher, Fetcher, StaticFetcher};
use cloudsql_runner::runner::{Phase, RecordingReporter, Runner, Status, SUCCESS_MESSAGE};
use pretty_assertions::assert_eq;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const INSTANCE: &str = "proj:us-central1:main";

/// A proxy that starts and stays up.
const IDLE: &str = "exec sleep 30";

/// A proxy that owns its port like the real one, failing when the port is taken.
const BINDS_PORT: &str = r#"exec python3 - "$@" <<'PY'
import socket, sys
args = sys.argv[1:]
port = int(args[args.index("--port") + 1])
sock = socket.socket()
sock.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
try:
    sock.bind(("127.0.0.1", port))
except OSError:
    sys.stderr.write("Error: listen tcp 127.0.0.1:%d: bind: address already in use\n" % port)
    sys.exit(1)
sock.listen(16)
while True:
    conn, _ = sock.accept()
    conn.close()
PY"#;

fn has_python3() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

struct Harness {
    dir: TempDir,
    config: Config,
    port: u16,
    _listener: Option<TcpListener>,
}

impl Harness {
    /// Proxy port with something accepting connections.
    fn listening() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        Self::build(port, Some(listener))
    }

    /// Proxy port nobody listens on.
    fn silent() -> Self {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        Self::build(port, None)
    }

    fn build(port: u16, listener: Option<TcpListener>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.proxy.binary_path = dir.path().join("bin").join("cloud-sql-proxy");
        config.proxy.port = port;
        config.proxy.readiness.timeout_secs = 2;
        config.proxy.readiness.min_delay_ms = 20;
        config.proxy.readiness.max_delay_ms = 200;
        Self {
            dir,
            config,
            port,
            _listener: listener,
        }
    }

    fn starts_file(&self) -> PathBuf {
        self.dir.path().join("starts")
    }

    /// Number of times the fake proxy was launched.
    fn starts(&self) -> usize {
        std::fs::read_to_string(self.starts_file())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// A fetcher serving a proxy script that logs its start, then runs `body`.
    fn proxy(&self, body: &str) -> Arc<StaticFetcher> {
        let script = format!(
            "#!/bin/sh\necho started >> '{}'\n{body}\n",
            self.starts_file().display()
        );
        Arc::new(StaticFetcher::new(script))
    }

    fn runner(
        &self,
        fetcher: Arc<dyn Fetcher>,
        connector: MockConnector,
        reporter: Arc<RecordingReporter>,
        env: Environment,
    ) -> Runner {
        self.runner_with_connector(fetcher, Arc::new(connector), reporter, env)
    }

    fn runner_with_connector(
        &self,
        fetcher: Arc<dyn Fetcher>,
        connector: Arc<dyn Connector>,
        reporter: Arc<RecordingReporter>,
        env: Environment,
    ) -> Runner {
        Runner::new(self.config.clone())
            .unwrap()
            .with_fetcher(fetcher)
            .with_connector(connector)
            .with_reporter(reporter)
            .with_environment(env)
    }
}

/// A connector whose statements take a while and need the proxy port to stay
/// up for their whole duration.
struct TunnelCheckingConnector {
    statement_time: Duration,
}

#[async_trait]
impl Connector for TunnelCheckingConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Box<dyn DatabaseClient>> {
        tokio::net::TcpStream::connect(target.addr)
            .await
            .map_err(|e| RunnerError::connection(e.to_string()))?;
        Ok(Box::new(TunnelCheckingClient {
            addr: target.addr,
            statement_time: self.statement_time,
        }))
    }
}

struct TunnelCheckingClient {
    addr: SocketAddr,
    statement_time: Duration,
}

#[async_trait]
impl DatabaseClient for TunnelCheckingClient {
    async fn execute(
        &mut self,
        _sql: &str,
        _fetch_rows: bool,
        _timeout: Option<Duration>,
    ) -> Result<QueryResult> {
        tokio::time::sleep(self.statement_time).await;
        tokio::net::TcpStream::connect(self.addr)
            .await
            .map_err(|e| RunnerError::execution(format!("tunnel lost mid-statement: {e}")))?;
        Ok(QueryResult::affected(1))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn request_env(sql: &str) -> Environment {
    Environment::fixed([
        ("INSTANCE_CONNECTION_NAME", INSTANCE),
        ("DB_USER", "svc"),
        ("DB_NAME", "app"),
        ("SQL_QUERY", sql),
    ])
}

#[tokio::test]
async fn test_select_returns_rows() {
    let harness = Harness::listening();
    let connector = MockConnector::new().returning(
        vec![ColumnInfo::new("id", "INT4"), ColumnInfo::new("name", "TEXT")],
        vec![vec![Value::Int(1), Value::String("alice".to_string())]],
    );
    let stats = connector.stats();
    let reporter = Arc::new(RecordingReporter::new());
    let runner = harness.runner(
        harness.proxy(IDLE),
        connector,
        Arc::clone(&reporter),
        request_env("SELECT id, name FROM users"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.status_code, 200);
    assert_eq!(invocation.response.status, Status::Success);
    assert_eq!(invocation.response.message, SUCCESS_MESSAGE);
    assert_eq!(
        invocation.response.results,
        Some(vec![vec![Value::Int(1), Value::String("alice".to_string())]])
    );
    assert_eq!(
        reporter.phases(),
        vec![
            Phase::Validating,
            Phase::AcquiringProxy,
            Phase::StartingProxy,
            Phase::AwaitingReadiness,
            Phase::Connecting,
            Phase::Executing,
            Phase::Releasing,
        ]
    );
    assert_eq!(reporter.outcomes(), vec![None]);
    assert_eq!(
        stats.targets(),
        vec![format!("app @ 127.0.0.1:{} as svc", harness.port)]
    );
    assert_eq!(stats.statements(), vec!["SELECT id, name FROM users"]);
    assert_eq!(stats.close_count(), 1);
    assert_eq!(harness.starts(), 1);
}

#[tokio::test]
async fn test_update_omits_results() {
    let harness = Harness::listening();
    let runner = harness.runner(
        harness.proxy(IDLE),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        request_env("UPDATE users SET active = true WHERE id = 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert!(invocation.is_success());
    assert_eq!(invocation.response.results, None);
}

#[tokio::test]
async fn test_missing_configuration_touches_nothing() {
    let harness = Harness::listening();
    let fetcher = harness.proxy(IDLE);
    let connector = MockConnector::new();
    let stats = connector.stats();
    let reporter = Arc::new(RecordingReporter::new());
    let env = Environment::fixed([("INSTANCE_CONNECTION_NAME", INSTANCE), ("DB_USER", "svc")]);
    let runner = harness.runner(fetcher.clone(), connector, Arc::clone(&reporter), env);

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.status_code, 500);
    assert_eq!(invocation.error_kind, Some(ErrorKind::Configuration));
    assert_eq!(
        invocation.response.message,
        "Configuration error: Missing required environment variables: DB_NAME, SQL_QUERY"
    );
    assert_eq!(reporter.phases(), vec![Phase::Validating]);
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(stats.connect_count(), 0);
    assert_eq!(harness.starts(), 0);
}

#[tokio::test]
async fn test_malformed_instance_name() {
    let harness = Harness::listening();
    let fetcher = harness.proxy(IDLE);
    let env = Environment::fixed([
        ("INSTANCE_CONNECTION_NAME", "just-an-instance"),
        ("DB_USER", "svc"),
        ("DB_NAME", "app"),
        ("SQL_QUERY", "SELECT 1"),
    ]);
    let runner = harness.runner(
        fetcher.clone(),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        env,
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Configuration));
    assert!(invocation.response.message.contains("project:region:instance"));
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn test_download_failure() {
    let harness = Harness::listening();
    let connector = MockConnector::new();
    let stats = connector.stats();
    let runner = harness.runner(
        Arc::new(FailingFetcher::new("HTTP 403 Forbidden")),
        connector,
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Download));
    assert_eq!(
        invocation.response.message,
        "Failed to download Cloud SQL Proxy: HTTP 403 Forbidden"
    );
    assert!(!harness.config.proxy.binary_path.exists());
    assert_eq!(stats.connect_count(), 0);
}

#[tokio::test]
async fn test_proxy_exit_is_startup_error() {
    let harness = Harness::silent();
    let connector = MockConnector::new();
    let stats = connector.stats();
    let runner = harness.runner(
        harness.proxy("echo 'invalid instance' >&2\nexit 3"),
        connector,
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Startup));
    let message = &invocation.response.message;
    assert!(message.starts_with("Failed to start Cloud SQL Proxy:"), "{message}");
    assert!(message.contains("exited"), "{message}");
    assert_eq!(stats.connect_count(), 0);
}

#[tokio::test]
async fn test_proxy_error_output_is_startup_error() {
    let harness = Harness::silent();
    let runner = harness.runner(
        harness.proxy("echo 'Error: failed to get instance metadata' >&2\nexec sleep 30"),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Startup));
    assert!(
        invocation
            .response
            .message
            .contains("failed to get instance metadata"),
        "{}",
        invocation.response.message
    );
}

#[tokio::test]
async fn test_readiness_deadline() {
    let mut harness = Harness::silent();
    harness.config.proxy.readiness.timeout_secs = 1;
    let connector = MockConnector::new();
    let stats = connector.stats();
    let reporter = Arc::new(RecordingReporter::new());
    let runner = harness.runner(
        harness.proxy(IDLE),
        connector,
        Arc::clone(&reporter),
        request_env("SELECT 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Startup));
    assert!(
        invocation.response.message.contains("within 1 seconds"),
        "{}",
        invocation.response.message
    );
    assert!(reporter.saw(Phase::AwaitingReadiness));
    assert!(!reporter.saw(Phase::Connecting));
    assert_eq!(stats.connect_count(), 0);
}

#[tokio::test]
async fn test_connection_rejected() {
    let harness = Harness::listening();
    let connector =
        MockConnector::new().rejecting_connections("password authentication failed for user 'svc'");
    let stats = connector.stats();
    let runner = harness.runner(
        harness.proxy(IDLE),
        connector,
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Connection));
    assert_eq!(
        invocation.response.message,
        "Failed to connect to the database: password authentication failed for user 'svc'"
    );
    assert!(stats.statements().is_empty());
    assert_eq!(stats.close_count(), 0);
}

#[tokio::test]
async fn test_statement_failure_releases_connection() {
    let harness = Harness::listening();
    let connector = MockConnector::new().rejecting_statements("relation \"missing\" does not exist");
    let stats = connector.stats();
    let reporter = Arc::new(RecordingReporter::new());
    let runner = harness.runner(
        harness.proxy(IDLE),
        connector,
        Arc::clone(&reporter),
        request_env("DELETE FROM missing"),
    );

    let invocation = runner.invoke_from_env().await;

    assert_eq!(invocation.error_kind, Some(ErrorKind::Execution));
    assert_eq!(
        invocation.response.message,
        "Failed to execute SQL query: relation \"missing\" does not exist"
    );
    assert_eq!(stats.close_count(), 1);
    assert!(reporter.saw(Phase::Releasing));
    assert_eq!(reporter.outcomes(), vec![Some(ErrorKind::Execution)]);
}

#[tokio::test]
async fn test_repeated_invocations_reuse_cached_binary() {
    let harness = Harness::listening();
    let fetcher = harness.proxy(IDLE);
    let connector = MockConnector::new();
    let stats = connector.stats();
    let runner = harness.runner(
        fetcher.clone(),
        connector,
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    let first = runner.invoke_from_env().await;
    let second = runner.invoke_from_env().await;

    assert_eq!(first.response, second.response);
    assert!(second.is_success());
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(harness.starts(), 2);
    assert_eq!(stats.close_count(), 2);
}

#[tokio::test]
async fn test_resident_proxy_is_reused() {
    let mut harness = Harness::listening();
    harness.config.proxy.lifetime = ProxyLifetime::Resident;
    let runner = harness.runner(
        harness.proxy(IDLE),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    for _ in 0..3 {
        assert!(runner.invoke_from_env().await.is_success());
    }
    assert_eq!(harness.starts(), 1);

    runner.shutdown().await;
    assert!(runner.invoke_from_env().await.is_success());
    assert_eq!(harness.starts(), 2);
    runner.shutdown().await;
}

#[tokio::test]
async fn test_resident_proxy_replaced_for_other_instance() {
    let mut harness = Harness::listening();
    harness.config.proxy.lifetime = ProxyLifetime::Resident;
    let runner = harness.runner(
        harness.proxy(IDLE),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    );

    assert!(runner.invoke_from_env().await.is_success());

    let other = QueryRequest {
        instance_connection_name: "proj:europe-west1:replica".to_string(),
        db_name: "app".to_string(),
        db_user: "svc".to_string(),
        sql_query: "SELECT 1".to_string(),
        db_password: None,
    };
    assert!(runner.invoke(&other).await.is_success());
    assert_eq!(harness.starts(), 2);
    runner.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_cold_starts_download_once() {
    let harness = Harness::listening();
    let fetcher = Arc::new(
        StaticFetcher::new(format!(
            "#!/bin/sh\necho started >> '{}'\n{IDLE}\n",
            harness.starts_file().display()
        ))
        .with_delay(Duration::from_millis(100)),
    );
    let runner = Arc::new(harness.runner(
        fetcher.clone(),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    ));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.invoke_isolated().await })
        })
        .collect();

    for task in tasks {
        let invocation = task.await.unwrap();
        assert!(invocation.is_success(), "{}", invocation.response.message);
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_overlapping_invocations_keep_their_tunnel() {
    if !has_python3() {
        eprintln!("Skipping test: python3 not available");
        return;
    }

    let harness = Harness::silent();
    let connector = Arc::new(TunnelCheckingConnector {
        statement_time: Duration::from_millis(300),
    });
    let runner = Arc::new(harness.runner_with_connector(
        harness.proxy(BINDS_PORT),
        connector,
        Arc::new(RecordingReporter::new()),
        request_env("SELECT 1"),
    ));

    let first = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.invoke_isolated().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = {
        let runner = Arc::clone(&runner);
        tokio::spawn(async move { runner.invoke_isolated().await })
    };

    for task in [first, second] {
        let invocation = task.await.unwrap();
        assert!(invocation.is_success(), "{}", invocation.response.message);
    }
    assert_eq!(harness.starts(), 2);
}

#[tokio::test]
async fn test_instance_name_containing_error_starts() {
    let harness = Harness::listening();
    let instance = "proj:us-central1:error-logs";
    let script = format!(
        "echo \"2024/01/01 12:00:00 [{instance}] Listening on 127.0.0.1:{}\" >&2\n{IDLE}",
        harness.port
    );
    let env = Environment::fixed([
        ("INSTANCE_CONNECTION_NAME", instance),
        ("DB_USER", "svc"),
        ("DB_NAME", "app"),
        ("SQL_QUERY", "SELECT 1"),
    ]);
    let runner = harness.runner(
        harness.proxy(&script),
        MockConnector::new(),
        Arc::new(RecordingReporter::new()),
        env,
    );

    let invocation = runner.invoke_from_env().await;

    assert!(invocation.is_success(), "{}", invocation.response.message);
}
