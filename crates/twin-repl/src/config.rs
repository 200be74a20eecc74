//! Runtime configuration, loaded once at startup and shared by reference.

use crate::domain::WaitPolicy;
use crate::error::{Result, TwinError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/twin/config.toml";

/// Top-level configuration for both the sending and the receiving host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinConfig {
    /// Hypervisor connection URI.
    pub hypervisor_uri: String,
    /// Seconds to wait for a graceful shutdown or a startup acknowledgment.
    pub wait_time_secs: u64,
    /// Interval between polls while waiting, in milliseconds.
    pub poll_interval_ms: u64,
    /// Local work directory holding `<domain>/incoming/`.
    pub work_dir: PathBuf,
    /// Directory holding production images and snapshots.
    pub mount_point: PathBuf,
    /// File name of the replicated disk image.
    pub disk_name: String,
    /// Directory holding `<domain>.xml` test domain templates.
    pub template_dir: PathBuf,
    /// Log file; logs go to stderr when unset.
    pub log_file: Option<PathBuf>,
    /// The peer host receiving snapshots.
    pub remote: RemoteConfig,
    /// Database quiesced around snapshots.
    pub database: DatabaseConfig,
    /// Snapshot creation.
    pub snapshot: SnapshotConfig,
}

/// Peer host reached over ssh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host name or address.
    pub host: String,
    /// ssh port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Private key used for authentication.
    pub key_path: PathBuf,
    /// The peer's work directory.
    pub work_dir: PathBuf,
    /// Bulk copy bandwidth cap in KiB/s.
    pub bandwidth_limit_kbps: u64,
}

/// MySQL server whose tables are read-locked during a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Skip locking entirely when false.
    pub enabled: bool,
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    pub password: Option<String>,
    /// Upper bound on connecting and on each lock statement.
    pub statement_timeout_secs: u64,
}

/// How snapshots are produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// External program and arguments; the live image is copied when unset.
    pub command: Option<Vec<String>>,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            hypervisor_uri: String::from("qemu:///system"),
            wait_time_secs: 60,
            poll_interval_ms: 1000,
            work_dir: PathBuf::from("/var/lib/twin"),
            mount_point: PathBuf::from("/var/lib/twin/images"),
            disk_name: String::from("hda.raw"),
            template_dir: PathBuf::from("/etc/twin"),
            log_file: None,
            remote: RemoteConfig::default(),
            database: DatabaseConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::from("twin"),
            key_path: PathBuf::from("/etc/twin/id_ed25519"),
            work_dir: PathBuf::from("/var/lib/twin"),
            bandwidth_limit_kbps: 10_000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::from("localhost"),
            port: 3306,
            user: String::from("root"),
            password: None,
            statement_timeout_secs: 60,
        }
    }
}

impl TwinConfig {
    /// Load configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TwinError::Config {
            msg: format!("cannot read {}: {}", path.display(), e),
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TwinConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TwinError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| TwinError::Config {
                msg: format!("{}: {}", path.display(), e),
            })?,
            _ => {
                return Err(TwinError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Check settings every command depends on.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(TwinError::Config {
                msg: "poll_interval_ms must be positive".to_string(),
            });
        }
        if self.disk_name.is_empty() {
            return Err(TwinError::Config {
                msg: "disk_name must not be empty".to_string(),
            });
        }
        if self.disk_name.contains('/') {
            return Err(TwinError::Config {
                msg: format!("disk_name must be a plain file name: {}", self.disk_name),
            });
        }
        Ok(())
    }

    /// Check the settings only the sending host needs.
    pub fn validate_for_send(&self) -> Result<()> {
        self.validate()?;
        if self.remote.host.is_empty() {
            return Err(TwinError::Config {
                msg: "remote.host must be set to send".to_string(),
            });
        }
        Ok(())
    }

    /// The polling bound shared by shutdown and acknowledgment waits.
    pub fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::from_timeout(
            Duration::from_secs(self.wait_time_secs),
            Duration::from_millis(self.poll_interval_ms),
        )
    }

    /// Live production image of a domain.
    pub fn production_image(&self, domain: &str) -> PathBuf {
        self.mount_point.join(domain).join(&self.disk_name)
    }

    /// Snapshot image of a domain, taken under the database lock.
    pub fn snapshot_image(&self, domain: &str) -> PathBuf {
        self.mount_point
            .join(format!("{}-snapshot", domain))
            .join(&self.disk_name)
    }

    /// Test domain template for a domain.
    pub fn template_path(&self, domain: &str) -> PathBuf {
        self.template_dir.join(format!("{}.xml", domain))
    }
}
