//! Send path: ship a snapshot to the peer behind a completion marker.
//!
//! The order is fixed: clear the remote `complete.txt`, copy the payload,
//! then set `complete.txt`. The marker is only ever written after a copy
//! that reported success, so the receiver never sees a marker without a
//! full payload. Nothing is retried here.

use crate::error::{Result, TransferStep, TwinError};
use crate::marker::{IncomingDir, Marker};
use crate::remote::RemoteChannel;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

/// Pushes snapshots into the peer's incoming directories.
pub struct Transporter {
    channel: Arc<dyn RemoteChannel>,
    remote_work_dir: PathBuf,
}

impl Transporter {
    /// Create a transporter writing under the peer's `remote_work_dir`.
    pub fn new(channel: Arc<dyn RemoteChannel>, remote_work_dir: impl Into<PathBuf>) -> Self {
        Self {
            channel,
            remote_work_dir: remote_work_dir.into(),
        }
    }

    /// The peer's incoming directory for `domain`.
    pub fn remote_incoming(&self, domain: &str) -> IncomingDir {
        IncomingDir::new(&self.remote_work_dir, domain)
    }

    /// Transfer `snapshot` for `domain`.
    pub async fn send(&self, domain: &str, snapshot: &Path) -> Result<()> {
        let incoming = self.remote_incoming(domain);
        let marker = incoming.marker_path(Marker::Complete);
        let marker = path_str(&marker);
        let dir = path_str(incoming.path());

        info!(domain = %domain, "Removing remote completion marker");
        self.channel
            .exec(&["rm", "-f", "--", marker.as_str()])
            .await
            .map_err(|e| transfer_error(domain, TransferStep::ClearMarker, e))?;

        info!(domain = %domain, snapshot = %snapshot.display(), "Copying payload");
        self.channel
            .exec(&["mkdir", "-p", "--", dir.as_str()])
            .await
            .map_err(|e| transfer_error(domain, TransferStep::CopyPayload, e))?;
        self.channel
            .push(snapshot, incoming.path())
            .await
            .map_err(|e| transfer_error(domain, TransferStep::CopyPayload, e))?;

        info!(domain = %domain, "Setting remote completion marker");
        self.channel
            .exec(&["touch", "--", marker.as_str()])
            .await
            .map_err(|e| transfer_error(domain, TransferStep::SetMarker, e))?;

        info!(domain = %domain, "Finished sending");
        Ok(())
    }
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

fn transfer_error(domain: &str, step: TransferStep, cause: TwinError) -> TwinError {
    error!(domain = %domain, step = %step, error = %cause, "Send aborted");
    TwinError::Transfer {
        domain: domain.to_string(),
        step,
        msg: cause.to_string(),
    }
}
