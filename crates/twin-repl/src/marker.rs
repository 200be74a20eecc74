//! Completion markers: the only signal exchanged between the two hosts.
//!
//! Each domain has an incoming directory `<work_dir>/<domain>/incoming/`
//! holding the received image and two marker files. Only presence matters;
//! contents are never read. The sender owns `complete.txt`, the receiver
//! (via the test domain) owns `startup.txt`.

use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The two marker files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// The image transfer finished.
    Complete,
    /// The test domain booted.
    Startup,
}

impl Marker {
    /// File name of the marker inside the incoming directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            Marker::Complete => "complete.txt",
            Marker::Startup => "startup.txt",
        }
    }
}

/// Per-domain incoming directory, on either host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDir {
    root: PathBuf,
}

impl IncomingDir {
    /// Incoming directory of `domain` under `work_dir`.
    pub fn new(work_dir: &Path, domain: &str) -> Self {
        Self {
            root: work_dir.join(domain).join("incoming"),
        }
    }

    /// The directory itself.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Full path of a marker.
    pub fn marker_path(&self, marker: Marker) -> PathBuf {
        self.root.join(marker.file_name())
    }

    /// Where the transferred image lands.
    pub fn image_path(&self, disk_name: &str) -> PathBuf {
        self.root.join(disk_name)
    }

    /// Whether a marker is present locally.
    pub async fn is_set(&self, marker: Marker) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.marker_path(marker)).await?)
    }

    /// Create a marker locally.
    pub async fn set(&self, marker: Marker) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.marker_path(marker))
            .await?;
        Ok(())
    }

    /// Remove a marker locally. Returns whether it was present.
    pub async fn clear(&self, marker: Marker) -> Result<bool> {
        match tokio::fs::remove_file(self.marker_path(marker)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(marker = marker.file_name(), "Marker already absent");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}
