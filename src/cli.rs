//! Command-line argument parsing for cloudsql-runner.

use crate::config::ProxyLifetime;
use crate::logging::LogFormat;
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Runs one SQL statement against a Cloud SQL instance through the Cloud SQL Auth Proxy.
#[derive(Parser, Debug)]
#[command(name = "cloudsql-runner")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Log output format (text or json)
    #[arg(
        long,
        value_name = "FORMAT",
        env = "LOG_FORMAT",
        default_value = "text",
        global = true
    )]
    pub log_format: String,

    /// Proxy lifetime (per-invocation or resident), overriding the config file
    #[arg(long, value_name = "LIFETIME", global = true)]
    pub proxy_lifetime: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one invocation and print the JSON response
    Run,

    /// Serve invocations over HTTP
    Serve {
        /// Address to bind
        #[arg(long, value_name = "HOST", default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(short = 'p', long, value_name = "PORT", env = "PORT", default_value = "8080")]
        port: u16,
    },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::Config::default_path)
    }

    pub fn parse_log_format(&self) -> std::result::Result<LogFormat, String> {
        self.log_format.parse()
    }

    /// Parses the --proxy-lifetime override, if given.
    pub fn parse_proxy_lifetime(&self) -> std::result::Result<Option<ProxyLifetime>, String> {
        self.proxy_lifetime
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Bind address for `serve`, if that is the command.
    pub fn serve_addr(&self) -> Option<SocketAddr> {
        match self.command {
            Command::Serve { host, port } => Some(SocketAddr::new(host, port)),
            Command::Run => None,
        }
    }
}
