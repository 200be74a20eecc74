//! Authenticated channel to the peer host: remote commands and bulk copy.

use crate::config::RemoteConfig;
use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Remote execution and bulk copy to the peer host.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Run a command on the peer. Arguments are passed verbatim.
    async fn exec(&self, argv: &[&str]) -> Result<()>;

    /// Copy a local file into a directory on the peer, overwriting in place.
    async fn push(&self, local: &Path, remote_dir: &Path) -> Result<()>;
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// `RemoteChannel` over ssh, with rsync for the payload.
pub struct SshChannel {
    config: RemoteConfig,
}

impl SshChannel {
    /// Create a channel to the configured peer.
    pub fn new(config: RemoteConfig) -> Self {
        Self { config }
    }

    /// The ssh invocation without the host or command.
    pub fn ssh_args(&self) -> Vec<String> {
        vec![
            "ssh".to_string(),
            "-p".to_string(),
            self.config.port.to_string(),
            "-l".to_string(),
            self.config.username.clone(),
            "-i".to_string(),
            self.config.key_path.display().to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    /// Arguments to rsync for copying `local` into `remote_dir`.
    ///
    /// Every byte is re-sent and written in place: completeness is signalled
    /// by the marker written afterwards, not by rsync's delta checks.
    pub fn rsync_args(&self, local: &Path, remote_dir: &Path) -> Vec<String> {
        let rsh = self
            .ssh_args()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");
        vec![
            "--inplace".to_string(),
            "--whole-file".to_string(),
            "--ignore-times".to_string(),
            format!("--bwlimit={}", self.config.bandwidth_limit_kbps),
            "--stats".to_string(),
            "--human-readable".to_string(),
            "--rsh".to_string(),
            rsh,
            local.display().to_string(),
            format!("{}:{}/", self.config.host, remote_dir.display()),
        ]
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<String> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = ?cmd, "Running {}", what);

        let output = cmd.output().await.map_err(|e| TwinError::Remote {
            msg: format!("cannot run {}: {}", what, e),
        })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TwinError::Remote {
                msg: format!("{} failed ({}): {}", what, output.status, stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    async fn exec(&self, argv: &[&str]) -> Result<()> {
        let ssh = self.ssh_args();
        let remote_command = argv
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ");

        let mut cmd = Command::new(&ssh[0]);
        cmd.args(&ssh[1..]).arg(&self.config.host).arg(remote_command);
        self.run(cmd, "ssh").await.map(|_| ())
    }

    async fn push(&self, local: &Path, remote_dir: &Path) -> Result<()> {
        let mut cmd = Command::new("rsync");
        cmd.args(self.rsync_args(local, remote_dir));
        let stats = self.run(cmd, "rsync").await?;
        info!(host = %self.config.host, "Payload copied");
        debug!(stats = %stats.trim(), "rsync stats");
        Ok(())
    }
}
