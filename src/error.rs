//! Error types for the runner.
//!
//! Every failure an invocation can hit falls into one of five kinds, each
//! reported to the caller as a 500 response.

use std::fmt;
use thiserror::Error;

/// Main error type for runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Missing or malformed configuration (required variables absent, bad config file).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The proxy binary could not be fetched or installed.
    #[error("Failed to download Cloud SQL Proxy: {0}")]
    Download(String),

    /// The proxy could not be launched or never became ready.
    #[error("Failed to start Cloud SQL Proxy: {0}")]
    Startup(String),

    /// Opening the database connection failed (auth, refused, unknown database).
    #[error("Failed to connect to the database: {0}")]
    Connection(String),

    /// The statement failed, timed out, or could not be committed.
    #[error("Failed to execute SQL query: {0}")]
    Execution(String),
}

/// Discriminant of [`RunnerError`], cheap to copy into responses and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Download,
    Startup,
    Connection,
    Execution,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "Configuration Error",
            Self::Download => "Download Error",
            Self::Startup => "Startup Error",
            Self::Connection => "Connection Error",
            Self::Execution => "Execution Error",
        };
        f.write_str(name)
    }
}

impl RunnerError {
    /// Creates a configuration error with the given message.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates a download error with the given message.
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Creates a startup error with the given message.
    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates an execution error with the given message.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Download(_) => ErrorKind::Download,
            Self::Startup(_) => ErrorKind::Startup,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Execution(_) => ErrorKind::Execution,
        }
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Configuration => "Configuration Error",
            ErrorKind::Download => "Download Error",
            ErrorKind::Startup => "Startup Error",
            ErrorKind::Connection => "Connection Error",
            ErrorKind::Execution => "Execution Error",
        }
    }

    /// HTTP status code reported for this error. All kinds are server-side failures.
    pub fn status_code(&self) -> u16 {
        500
    }
}

/// Result type alias using RunnerError.
pub type Result<T> = std::result::Result<T, RunnerError>;
