//! cloudsql-runner - run one SQL statement through the Cloud SQL Auth Proxy.

use anyhow::Context;
use cloudsql_runner::cli::{Cli, Command};
use cloudsql_runner::config::{Config, Environment};
use cloudsql_runner::error::{Result, RunnerError};
use cloudsql_runner::logging::{self, LogFormat};
use cloudsql_runner::runner::{Invocation, Runner};
use cloudsql_runner::server;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse_args();
    let log_format = match cli.parse_log_format() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("Warning: {e}; using text logs");
            LogFormat::Text
        }
    };
    logging::init_stderr_logging(log_format);

    let runner = build_runner(&cli);

    match cli.command {
        Command::Run => run_once(runner).await,
        Command::Serve { .. } => match serve(&cli, runner).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Builds the runner from config file, environment and CLI, in increasing precedence.
fn build_runner(cli: &Cli) -> Result<Runner> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());

    let mut config = Config::load_from_file(&config_path)?;
    config.apply_env_overrides(&Environment::Process)?;
    if let Some(lifetime) = cli
        .parse_proxy_lifetime()
        .map_err(RunnerError::configuration)?
    {
        config.proxy.lifetime = lifetime;
    }

    Runner::new(config)
}

async fn run_once(runner: Result<Runner>) -> ExitCode {
    let invocation = match runner {
        Ok(runner) => {
            let invocation = runner.invoke_from_env().await;
            runner.shutdown().await;
            invocation
        }
        Err(e) => {
            error!("{}: {}", e.category(), e);
            Invocation::failure(&e, Duration::ZERO)
        }
    };

    match serde_json::to_string_pretty(&invocation.response) {
        Ok(body) => println!("{body}"),
        Err(e) => error!("Failed to encode response: {e}"),
    }

    if invocation.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn serve(cli: &Cli, runner: Result<Runner>) -> anyhow::Result<()> {
    let runner = runner.context("Invalid configuration")?;
    let addr = cli
        .serve_addr()
        .context("serve requires a listen address")?;

    server::serve(Arc::new(runner), addr)
        .await
        .with_context(|| format!("HTTP server on {addr} failed"))
}
