//! The proxy child process.
//!
//! A supervisor task owns the `Child`: it publishes the exit status on a watch
//! channel and kills the process when asked to, or when the [`ProxyHandle`] is
//! dropped. Readiness is decided by polling the loopback port with exponential
//! backoff under an overall deadline.

use crate::config::{ProxyConfig, ProxyFlavor, ReadinessConfig};
use crate::error::{Result, RunnerError};
use backon::{ExponentialBuilder, Retryable};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lines of proxy stderr kept for error reports.
const STDERR_CAPACITY: usize = 64;

/// Bound on a single readiness probe's TCP connect.
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts at spawning a freshly written binary.
const SPAWN_ATTEMPTS: u32 = 3;

/// Builds the proxy command line for `instance`.
pub fn proxy_args(config: &ProxyConfig, instance: &str) -> Vec<String> {
    let mut args = match config.flavor {
        ProxyFlavor::V1 => {
            let mut args = vec![format!(
                "-instances={instance}=tcp:{}:{}",
                config.address, config.port
            )];
            if config.auto_iam_authn {
                args.push("-enable_iam_login".to_string());
            }
            args
        }
        ProxyFlavor::V2 => {
            let mut args = vec![
                instance.to_string(),
                "--address".to_string(),
                config.address.clone(),
                "--port".to_string(),
                config.port.to_string(),
            ];
            if config.auto_iam_authn {
                args.push("--auto-iam-authn".to_string());
            }
            args
        }
    };
    args.extend(config.extra_args.iter().cloned());
    args
}

/// Recent stderr lines from the proxy.
#[derive(Debug, Default)]
struct StderrLog {
    instance: String,
    lines: Mutex<VecDeque<String>>,
}

impl StderrLog {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            lines: Mutex::default(),
        }
    }

    fn is_error(&self, line: &str) -> bool {
        is_error_line(line, &self.instance)
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == STDERR_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// First retained line that reports an error.
    fn first_error(&self) -> Option<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().find(|line| self.is_error(line)).cloned()
    }

    /// Last `n` lines joined for an error message.
    fn tail(&self, n: usize) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect::<Vec<_>>().join(" | ")
    }
}

/// Whether a proxy log line reports a failure.
///
/// Matches whole words only, after removing the instance name, so a healthy
/// `[proj:region:error-logs] Listening on ...` line does not count.
fn is_error_line(line: &str, instance: &str) -> bool {
    let line = if instance.is_empty() {
        line.to_ascii_lowercase()
    } else {
        line.replace(instance, "").to_ascii_lowercase()
    };
    line.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| matches!(word, "error" | "errors" | "fatal" | "panic"))
}

/// Why a readiness probe failed.
#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error("proxy exited before becoming ready ({0})")]
    Exited(String),

    #[error("proxy reported an error: {0}")]
    ErrorOutput(String),

    #[error("proxy is not accepting connections on {addr}: {reason}")]
    NotListening { addr: SocketAddr, reason: String },
}

impl ProbeError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::NotListening { .. })
    }
}

/// A running proxy child process.
#[derive(Debug)]
pub struct ProxyHandle {
    instance: String,
    listen_addr: SocketAddr,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitStatus>>,
    stop_tx: Option<oneshot::Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
    stderr: Arc<StderrLog>,
}

impl ProxyHandle {
    /// Launches `binary` for `instance` with the flags `config` describes.
    pub async fn launch(binary: &Path, config: &ProxyConfig, instance: &str) -> Result<Self> {
        let listen_addr = config.listen_addr()?;
        let args = proxy_args(config, instance);

        info!("Starting Cloud SQL Proxy: {} {}", binary.display(), args.join(" "));

        let mut child = spawn_with_retry(binary, &args).await?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_stdout(stdout, pid);
        }
        let stderr = Arc::new(StderrLog::new(instance));
        if let Some(pipe) = child.stderr.take() {
            capture_stderr(pipe, pid, Arc::clone(&stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, pid, stop_rx, exit_tx));

        Ok(Self {
            instance: instance.to_string(),
            listen_addr,
            pid,
            exit_rx,
            stop_tx: Some(stop_tx),
            supervisor: Some(supervisor),
            stderr,
        })
    }

    /// Instance this proxy tunnels to.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has not exited yet.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Waits until the proxy accepts TCP connections on its port.
    ///
    /// Fails with a startup error if the child exits, logs an error on stderr,
    /// or the deadline passes first.
    pub async fn wait_ready(&self, readiness: &ReadinessConfig) -> Result<()> {
        let deadline = readiness.timeout();
        let min_delay = readiness.min_delay().max(Duration::from_millis(1));
        let max_attempts = (deadline.as_millis() / min_delay.as_millis()) as usize + 1;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(min_delay)
            .with_max_delay(readiness.max_delay())
            .with_max_times(max_attempts);

        let probe = (|| self.probe())
            .retry(backoff)
            .when(ProbeError::is_retryable)
            .notify(|err, delay| debug!("Proxy not ready ({err}), probing again in {delay:?}"));

        match tokio::time::timeout(deadline, probe).await {
            Ok(Ok(())) => {
                info!("Cloud SQL Proxy accepting connections on {}", self.listen_addr);
                Ok(())
            }
            Ok(Err(e)) => Err(RunnerError::startup(e.to_string())),
            Err(_) => Err(RunnerError::startup(format!(
                "proxy did not accept connections on {} within {} seconds",
                self.listen_addr,
                deadline.as_secs()
            ))),
        }
    }

    async fn probe(&self) -> std::result::Result<(), ProbeError> {
        self.check_alive()?;

        let connected =
            tokio::time::timeout(PROBE_CONNECT_TIMEOUT, TcpStream::connect(self.listen_addr)).await;
        match connected {
            // The port may belong to another process; ours must still be up.
            Ok(Ok(_stream)) => self.check_alive(),
            Ok(Err(e)) => Err(ProbeError::NotListening {
                addr: self.listen_addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(ProbeError::NotListening {
                addr: self.listen_addr,
                reason: "connect timed out".to_string(),
            }),
        }
    }

    /// Fails if the child has exited or logged an error.
    fn check_alive(&self) -> std::result::Result<(), ProbeError> {
        let exited = *self.exit_rx.borrow();
        if let Some(status) = exited {
            let tail = self.stderr.tail(5);
            let detail = if tail.is_empty() {
                status.to_string()
            } else {
                format!("{status}; stderr: {tail}")
            };
            return Err(ProbeError::Exited(detail));
        }

        match self.stderr.first_error() {
            Some(line) => Err(ProbeError::ErrorOutput(line)),
            None => Ok(()),
        }
    }

    /// Terminates the proxy and waits for the supervisor to reap it.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop_tx.take() {
            // Err means the supervisor already finished.
            let _ = stop.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                warn!("Cloud SQL Proxy supervisor failed: {e}");
            }
        }
    }
}

/// Spawns the proxy, retrying briefly on ETXTBSY: a process forked while the
/// binary was still open for writing keeps it busy until that process execs.
async fn spawn_with_retry(binary: &Path, args: &[String]) -> Result<Child> {
    let mut attempt = 1;
    loop {
        let spawned = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => return Ok(child),
            Err(e) if is_text_file_busy(&e) && attempt < SPAWN_ATTEMPTS => {
                debug!("{} busy, retrying spawn", binary.display());
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                return Err(RunnerError::startup(format!(
                    "failed to launch {}: {e}",
                    binary.display()
                )))
            }
        }
    }
}

fn is_text_file_busy(error: &std::io::Error) -> bool {
    // ETXTBSY on Linux and macOS.
    error.raw_os_error() == Some(26)
}

async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    stop_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            debug!(?pid, "Stopping Cloud SQL Proxy");
            if let Err(e) = child.kill().await {
                warn!(?pid, "Failed to kill Cloud SQL Proxy: {e}");
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            info!(?pid, "Cloud SQL Proxy exited: {status}");
            exit_tx.send_replace(Some(status));
        }
        Err(e) => warn!(?pid, "Failed to wait for Cloud SQL Proxy: {e}"),
    }
}

fn forward_stdout(stdout: ChildStdout, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(?pid, "[cloud-sql-proxy] {line}");
        }
    });
}

fn capture_stderr(stderr: ChildStderr, pid: Option<u32>, log: Arc<StderrLog>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if log.is_error(&line) {
                warn!(?pid, "[cloud-sql-proxy] {line}");
            } else {
                info!(?pid, "[cloud-sql-proxy] {line}");
            }
            log.push(line);
        }
    });
}
