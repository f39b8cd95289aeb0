//! Fetching the proxy binary.

use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Downloads a file.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `url` into a new file at `dest` and returns the bytes written.
    ///
    /// `dest` is a staging path; the caller moves it into place on success and
    /// removes it on failure.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Fetches over HTTP(S) with reqwest, streaming the body to disk.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cloudsql-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RunnerError::download(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RunnerError::download(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::download(format!(
                "{url} returned HTTP {status}"
            )));
        }

        let write_error =
            |e: std::io::Error| RunnerError::download(format!("Failed to write {}: {e}", dest.display()));

        let mut file = tokio::fs::File::create(dest).await.map_err(write_error)?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                RunnerError::download(format!("Download from {url} interrupted: {e}"))
            })?;
            file.write_all(&chunk).await.map_err(write_error)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(write_error)?;
        file.sync_all().await.map_err(write_error)?;

        Ok(written)
    }
}
