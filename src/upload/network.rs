//! Network liveness probe and file transfer used by the upload worker.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

/// Reports whether the network store can be reached right now.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// The network store answers.
    async fn is_reachable(&self) -> bool;
}

/// Probe sending a single ICMP echo with the system `ping`.
#[derive(Debug, Clone)]
pub struct PingProbe {
    host: String,
}

impl PingProbe {
    /// Probe pinging `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl NetworkProbe for PingProbe {
    async fn is_reachable(&self) -> bool {
        let count_flag = if cfg!(windows) { "-n" } else { "-c" };
        match Command::new("ping")
            .args([count_flag, "1", &self.host])
            .output()
            .await
        {
            Ok(output) => {
                let reachable = output.status.success()
                    && !String::from_utf8_lossy(&output.stdout).contains("unreachable");
                if !reachable {
                    tracing::warn!(host = %self.host, "connection to the network store is lost");
                }
                reachable
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "could not run ping");
                false
            }
        }
    }
}

/// Copies one file to its network destination.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// Copy `source` to `destination`, creating parent directories. Returns the bytes copied.
    async fn copy(&self, source: &Path, destination: &Path) -> Result<u64>;
}

/// Plain filesystem copy to a mounted network share.
#[derive(Debug, Clone, Default)]
pub struct CopyTransfer;

#[async_trait]
impl FileTransfer for CopyTransfer {
    async fn copy(&self, source: &Path, destination: &Path) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::copy(source, destination)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), destination.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("scan.npy");
        std::fs::write(&source, b"12345").unwrap();
        let destination = dir.path().join("share/run/ROI_001/scan.npy");

        let copied = CopyTransfer.copy(&source, &destination).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(std::fs::read(&destination).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn test_copy_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = CopyTransfer
            .copy(&dir.path().join("missing.tif"), &dir.path().join("out.tif"))
            .await;
        assert!(result.is_err());
    }
}
