//! Binary tests for `cloudsql-runner run`.
//!
//! These only exercise failures that end before the proxy is fetched, so they
//! need neither network access nor a database.

use cloudsql_runner::runner::{InvocationResponse, Status};
use pretty_assertions::assert_eq;
use std::process::{Command, Output};

fn run_with_env(args: &[&str], vars: &[(&str, &str)]) -> (Output, InvocationResponse) {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_cloudsql-runner"))
        .arg("--config")
        .arg(dir.path().join("config.toml"))
        .arg("run")
        .args(args)
        .current_dir(dir.path())
        .env_clear()
        .envs(vars.iter().copied())
        .output()
        .unwrap();

    let body: InvocationResponse = serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout is not a response ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    });
    (output, body)
}

#[test]
fn test_run_without_environment_fails() {
    let (output, body) = run_with_env(&[], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(body.status, Status::Error);
    assert_eq!(
        body.message,
        "Configuration error: Missing required environment variables: \
         INSTANCE_CONNECTION_NAME, DB_USER, DB_NAME, SQL_QUERY"
    );
    assert_eq!(body.results, None);
}

#[test]
fn test_run_with_invalid_proxy_lifetime_fails() {
    let (output, body) = run_with_env(&["--proxy-lifetime", "forever"], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(body.message.starts_with("Configuration error:"), "{}", body.message);
    assert!(body.message.contains("forever"));
}

#[test]
fn test_run_with_invalid_proxy_url_fails() {
    let (output, body) = run_with_env(&[], &[("CLOUD_SQL_PROXY_URL", "ftp://example.com/proxy")]);

    assert_eq!(output.status.code(), Some(1));
    assert!(body.message.contains("ftp"), "{}", body.message);
}

#[test]
fn test_logs_stay_off_stdout() {
    let (output, _) = run_with_env(&[], &[("RUST_LOG", "debug"), ("LOG_FORMAT", "json")]);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Loading config from"), "{stderr}");
    assert!(stderr.lines().all(|line| line.starts_with('{')), "{stderr}");
}
