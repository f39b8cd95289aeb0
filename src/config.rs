//! Configuration management for the runner.
//!
//! Two layers feed an invocation:
//! - [`Config`]: process-level settings (proxy location, flavor, readiness policy,
//!   timeouts) loaded once from a TOML file and environment overrides.
//! - [`QueryRequest`]: the per-invocation target and statement, read fresh from the
//!   environment every time and discarded afterwards.

use crate::error::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable naming the Cloud SQL instance (`project:region:instance`).
pub const ENV_INSTANCE_CONNECTION_NAME: &str = "INSTANCE_CONNECTION_NAME";
/// Environment variable naming the database user (an IAM principal under auto IAM authn).
pub const ENV_DB_USER: &str = "DB_USER";
/// Environment variable naming the database.
pub const ENV_DB_NAME: &str = "DB_NAME";
/// Environment variable holding the statement to run.
pub const ENV_SQL_QUERY: &str = "SQL_QUERY";
/// Optional password for built-in database users.
pub const ENV_DB_PASSWORD: &str = "DB_PASSWORD";

const ENV_PROXY_PATH: &str = "CLOUD_SQL_PROXY_PATH";
const ENV_PROXY_URL: &str = "CLOUD_SQL_PROXY_URL";
const ENV_PROXY_PORT: &str = "CLOUD_SQL_PROXY_PORT";

/// Source of environment variables.
///
/// Production reads the process environment; tests and embedders can supply a
/// fixed map so invocations never race on process-global state.
#[derive(Debug, Clone, Default)]
pub enum Environment {
    #[default]
    Process,
    Fixed(HashMap<String, String>),
}

impl Environment {
    /// Builds a fixed environment from key/value pairs.
    pub fn fixed<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Fixed(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns the value of `key`. Blank values count as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(vars) => vars.get(key).cloned(),
        };
        value.filter(|v| !v.trim().is_empty())
    }
}

/// The per-invocation query configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Cloud SQL instance the proxy tunnels to.
    pub instance_connection_name: String,

    /// Database name.
    pub db_name: String,

    /// Authenticating identity.
    pub db_user: String,

    /// Statement executed verbatim.
    pub sql_query: String,

    /// Password for built-in users; absent under automatic IAM authentication.
    pub db_password: Option<String>,
}

impl QueryRequest {
    /// Reads the request from `env`, filling absent values from `defaults`.
    ///
    /// Fails with a configuration error naming every missing variable.
    pub fn from_env(env: &Environment, defaults: &RequestDefaults) -> Result<Self> {
        let instance = env.get(ENV_INSTANCE_CONNECTION_NAME);
        let user = env.get(ENV_DB_USER).or_else(|| defaults.db_user.clone());
        let name = env.get(ENV_DB_NAME).or_else(|| defaults.db_name.clone());
        let query = env.get(ENV_SQL_QUERY).or_else(|| defaults.sql_query.clone());

        let missing: Vec<&str> = [
            (ENV_INSTANCE_CONNECTION_NAME, instance.is_none()),
            (ENV_DB_USER, user.is_none()),
            (ENV_DB_NAME, name.is_none()),
            (ENV_SQL_QUERY, query.is_none()),
        ]
        .into_iter()
        .filter_map(|(var, absent)| absent.then_some(var))
        .collect();

        let (Some(instance), Some(user), Some(name), Some(query)) = (instance, user, name, query)
        else {
            return Err(RunnerError::configuration(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )));
        };

        validate_instance_connection_name(&instance)?;

        Ok(Self {
            instance_connection_name: instance,
            db_name: name,
            db_user: user,
            sql_query: query,
            db_password: env.get(ENV_DB_PASSWORD),
        })
    }

    /// Returns a display-safe string (no password) for logs.
    pub fn display_string(&self) -> String {
        format!(
            "{} @ {} as {}",
            self.db_name, self.instance_connection_name, self.db_user
        )
    }
}

impl fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRequest")
            .field("instance_connection_name", &self.instance_connection_name)
            .field("db_name", &self.db_name)
            .field("db_user", &self.db_user)
            .field("sql_query", &self.sql_query)
            .field("db_password", &self.db_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Checks the `project:region:instance` shape (legacy domain-scoped projects add one segment).
fn validate_instance_connection_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split(':').collect();
    let well_formed = matches!(parts.len(), 3 | 4) && parts.iter().all(|p| !p.trim().is_empty());
    if well_formed {
        Ok(())
    } else {
        Err(RunnerError::configuration(format!(
            "Invalid {ENV_INSTANCE_CONNECTION_NAME} '{name}'. Expected 'project:region:instance'"
        )))
    }
}

/// Process-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Proxy binary and process settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Database connection settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Fallbacks for request variables the environment leaves unset.
    #[serde(default)]
    pub defaults: RequestDefaults,
}

/// Command-line syntax understood by the proxy binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyFlavor {
    /// Legacy `cloud_sql_proxy` (`-instances=NAME=tcp:PORT`).
    V1,
    /// `cloud-sql-proxy` v2 (`NAME --port PORT`).
    #[default]
    V2,
}

/// Whether the proxy child outlives the invocation that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyLifetime {
    /// Terminate the proxy at the end of every invocation.
    #[default]
    PerInvocation,
    /// Keep the proxy running and reuse it while it stays alive.
    Resident,
}

impl std::str::FromStr for ProxyLifetime {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "per-invocation" => Ok(Self::PerInvocation),
            "resident" => Ok(Self::Resident),
            _ => Err(format!(
                "Invalid proxy lifetime: {s}. Expected: per-invocation or resident"
            )),
        }
    }
}

/// Proxy binary and process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Cached binary location.
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,

    /// Where to fetch the binary from on a cache miss.
    #[serde(default = "default_download_url")]
    pub download_url: String,

    /// Bound on the whole download.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    #[serde(default)]
    pub flavor: ProxyFlavor,

    /// Loopback address the proxy listens on.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Pass the automatic IAM database authentication flag to the proxy.
    #[serde(default = "default_true")]
    pub auto_iam_authn: bool,

    #[serde(default)]
    pub lifetime: ProxyLifetime,

    /// Extra arguments appended verbatim to the proxy command line.
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default)]
    pub readiness: ReadinessConfig,
}

fn default_binary_path() -> PathBuf {
    PathBuf::from("/tmp/cloud-sql-proxy")
}

fn default_download_url() -> String {
    "https://storage.googleapis.com/cloud-sql-connectors/cloud-sql-proxy/v2.14.1/cloud-sql-proxy.linux.amd64"
        .to_string()
}

fn default_download_timeout() -> u64 {
    120
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            download_url: default_download_url(),
            download_timeout_secs: default_download_timeout(),
            flavor: ProxyFlavor::default(),
            address: default_address(),
            port: default_port(),
            auto_iam_authn: true,
            lifetime: ProxyLifetime::default(),
            extra_args: Vec::new(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Socket address the proxy listens on and the database client dials.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.address.parse().map_err(|_| {
            RunnerError::configuration(format!(
                "Invalid proxy address '{}'. Expected an IP address",
                self.address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Bounded poll used to decide the proxy is accepting connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Overall deadline for the proxy to accept a TCP connection.
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,

    /// First backoff delay between probes.
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,

    /// Cap on the backoff delay.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

fn default_readiness_timeout() -> u64 {
    20
}

fn default_min_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    1000
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_readiness_timeout(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Which statements get their rows returned in the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultMode {
    /// Only statements classified as row-returning.
    #[default]
    Auto,
    Always,
    Never,
}

/// Database connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Optional bound on statement execution. Unbounded when absent.
    #[serde(default)]
    pub statement_timeout_secs: Option<u64>,

    #[serde(default)]
    pub results: ResultMode,
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            statement_timeout_secs: None,
            results: ResultMode::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }
}

/// Fallback values for request variables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestDefaults {
    pub db_user: Option<String>,
    pub db_name: Option<String>,
    pub sql_query: Option<String>,
}

impl Config {
    /// Returns the default config file path for the current platform.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudsql-runner")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. A missing file yields the defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::configuration(format!("Failed to read config file: {e}"))
        })?;

        Self::parse_toml(&content, path)
    }

    /// Parses configuration from a TOML string.
    fn parse_toml(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            RunnerError::configuration(format!(
                "Configuration error in {}:\n  {}",
                path.display(),
                e
            ))
        })
    }

    /// Applies `CLOUD_SQL_PROXY_*` environment variables over file values.
    pub fn apply_env_overrides(&mut self, env: &Environment) -> Result<()> {
        if let Some(path) = env.get(ENV_PROXY_PATH) {
            self.proxy.binary_path = PathBuf::from(path);
        }
        if let Some(url) = env.get(ENV_PROXY_URL) {
            self.proxy.download_url = url;
        }
        if let Some(port) = env.get(ENV_PROXY_PORT) {
            self.proxy.port = port.trim().parse().map_err(|_| {
                RunnerError::configuration(format!("Invalid {ENV_PROXY_PORT} '{port}'"))
            })?;
        }
        Ok(())
    }

    /// Checks values serde cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.proxy.download_url).map_err(|e| {
            RunnerError::configuration(format!(
                "Invalid proxy download URL '{}': {e}",
                self.proxy.download_url
            ))
        })?;
        if url.scheme() != "https" && url.scheme() != "http" {
            return Err(RunnerError::configuration(format!(
                "Invalid proxy download URL scheme '{}'. Expected 'https' or 'http'",
                url.scheme()
            )));
        }

        self.proxy.listen_addr()?;

        if self.proxy.port == 0 {
            return Err(RunnerError::configuration("Proxy port must be non-zero"));
        }

        let readiness = &self.proxy.readiness;
        if readiness.timeout_secs == 0 {
            return Err(RunnerError::configuration(
                "Proxy readiness timeout must be at least one second",
            ));
        }
        if readiness.min_delay_ms == 0 || readiness.min_delay_ms > readiness.max_delay_ms {
            return Err(RunnerError::configuration(
                "Proxy readiness delays must satisfy 0 < min_delay_ms <= max_delay_ms",
            ));
        }

        Ok(())
    }
}
