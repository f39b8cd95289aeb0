//! Fetchers for testing.
//!
//! Stand-ins for the network download: one writes a fixed body (typically a
//! shell script posing as the proxy), the other always fails.

use super::Fetcher;
use crate::error::{Result, RunnerError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Writes a fixed body to the destination.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    body: Vec<u8>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Delays every fetch, widening the window for concurrent callers.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of fetches performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        tokio::fs::write(dest, &self.body)
            .await
            .map_err(|e| RunnerError::download(format!("Failed to write {}: {e}", dest.display())))?;
        Ok(self.body.len() as u64)
    }
}

/// Fails every fetch with the configured message.
#[derive(Debug, Default)]
pub struct FailingFetcher {
    message: String,
    calls: AtomicUsize,
}

impl FailingFetcher {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of fetches attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FailingFetcher {
    async fn fetch(&self, _url: &str, _dest: &Path) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RunnerError::download(self.message.clone()))
    }
}
