//! Logging configuration for cloudsql-runner.
//!
//! Logs always go to stderr so stdout stays free for the JSON response of
//! `run`. Serverless log collectors usually prefer the JSON format.

use tracing_subscriber::EnvFilter;

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Invalid log format: {s}. Expected: text or json")),
        }
    }
}

/// Initializes logging to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_stderr_logging(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().with_current_span(true).init(),
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
