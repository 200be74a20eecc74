//! Point-in-time copies of a domain's disk image.

use crate::config::TwinConfig;
use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Produces the snapshot that gets shipped to the peer.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Create a snapshot of `domain`'s disk and return its path.
    async fn create_snapshot(&self, domain: &str) -> Result<PathBuf>;
}

/// How `DiskSnapshotter` obtains the snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotMethod {
    /// Copy the live image file.
    Copy,
    /// Run an external program that leaves the snapshot at the target path.
    Command(Vec<String>),
}

/// Snapshots the production image under the configured mount point.
pub struct DiskSnapshotter {
    config: TwinConfig,
    method: SnapshotMethod,
}

impl DiskSnapshotter {
    /// Build from configuration.
    pub fn from_config(config: &TwinConfig) -> Self {
        let method = match config.snapshot.command {
            Some(ref argv) if !argv.is_empty() => SnapshotMethod::Command(argv.clone()),
            _ => SnapshotMethod::Copy,
        };
        Self {
            config: config.clone(),
            method,
        }
    }

    async fn run_command(&self, argv: &[String], domain: &str, target: &Path) -> Result<()> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("TWIN_DOMAIN", domain)
            .env("TWIN_SNAPSHOT_PATH", target)
            .env("TWIN_SOURCE_PATH", self.config.production_image(domain))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = ?cmd, "Running snapshot command");

        let output = cmd.output().await.map_err(|e| TwinError::Snapshot {
            domain: domain.to_string(),
            msg: format!("cannot run {}: {}", argv[0], e),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TwinError::Snapshot {
                domain: domain.to_string(),
                msg: format!("{} failed ({}): {}", argv[0], output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Snapshotter for DiskSnapshotter {
    async fn create_snapshot(&self, domain: &str) -> Result<PathBuf> {
        let target = self.config.snapshot_image(domain);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(domain = %domain, path = %target.display(), "Creating snapshot");
        match self.method {
            SnapshotMethod::Copy => {
                let source = self.config.production_image(domain);
                tokio::fs::copy(&source, &target)
                    .await
                    .map_err(|e| TwinError::Snapshot {
                        domain: domain.to_string(),
                        msg: format!("copy {}: {}", source.display(), e),
                    })?;
            }
            SnapshotMethod::Command(ref argv) => {
                self.run_command(argv, domain, &target).await?;
            }
        }

        if !tokio::fs::try_exists(&target).await? {
            return Err(TwinError::Snapshot {
                domain: domain.to_string(),
                msg: format!("{} missing after snapshot", target.display()),
            });
        }
        Ok(target)
    }
}
