//! The cached proxy binary.
//!
//! A cache miss downloads into a uniquely named staging file beside the target
//! and renames it into place, so a reader never observes a partial binary.
//! Within one process an async mutex makes a single task own the download;
//! the others wait and then find the binary installed.

use super::Fetcher;
use crate::error::{Result, RunnerError};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Location and origin of the proxy binary.
#[derive(Debug)]
pub struct ProxyBinary {
    path: PathBuf,
    url: String,
    install_lock: Mutex<()>,
}

impl ProxyBinary {
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            install_lock: Mutex::new(()),
        }
    }

    /// Cached binary location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the binary path, downloading the binary first if it is missing.
    pub async fn ensure(&self, fetcher: &dyn Fetcher) -> Result<&Path> {
        if is_installed(&self.path).await {
            debug!("Cloud SQL Proxy found at {}", self.path.display());
            return Ok(&self.path);
        }

        let _guard = self.install_lock.lock().await;

        // Another task may have finished the download while we waited.
        if is_installed(&self.path).await {
            return Ok(&self.path);
        }

        info!(
            "Downloading Cloud SQL Proxy from {} to {}",
            self.url,
            self.path.display()
        );

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RunnerError::download(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        let staging = staging_path(&self.path);
        let outcome = self.install(fetcher, &staging).await;
        if outcome.is_err() {
            if let Err(e) = tokio::fs::remove_file(&staging).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove {}: {e}", staging.display());
                }
            }
        }
        outcome?;

        Ok(&self.path)
    }

    async fn install(&self, fetcher: &dyn Fetcher, staging: &Path) -> Result<()> {
        let bytes = fetcher.fetch(&self.url, staging).await?;
        if bytes == 0 {
            return Err(RunnerError::download(format!(
                "{} returned an empty body",
                self.url
            )));
        }

        make_executable(staging).await?;

        tokio::fs::rename(staging, &self.path).await.map_err(|e| {
            RunnerError::download(format!(
                "Cannot move download into {}: {e}",
                self.path.display()
            ))
        })?;

        info!(bytes, "Installed Cloud SQL Proxy at {}", self.path.display());
        Ok(())
    }
}

async fn is_installed(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Unique sibling of `path`, so the final rename stays on one filesystem.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cloud-sql-proxy".to_string());
    path.with_file_name(format!(".{name}.{}.partial", Uuid::new_v4().simple()))
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| {
            RunnerError::download(format!("Cannot mark {} executable: {e}", path.display()))
        })
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
