//! `Hypervisor` backed by the libvirt `virsh` command line client.

use crate::domain::{DomainHandle, Hypervisor, RunState};
use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

/// Drives a libvirt connection through `virsh -c <uri>`.
pub struct VirshHypervisor {
    program: PathBuf,
    uri: String,
    scratch_dir: PathBuf,
    /// Transient domains created here; they disappear once shut off.
    transient: Mutex<HashSet<String>>,
}

impl VirshHypervisor {
    /// Create a driver for the given connection URI.
    ///
    /// Transient domain definitions are written under `scratch_dir`.
    pub fn new(uri: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: PathBuf::from("virsh"),
            uri: uri.into(),
            scratch_dir: scratch_dir.into(),
            transient: Mutex::new(HashSet::new()),
        }
    }

    /// Use another `virsh` binary.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn virsh(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-c")
            .arg(&self.uri)
            .args(args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = ?cmd, "Running virsh");

        cmd.output().await.map_err(|e| TwinError::Hypervisor {
            msg: format!("cannot run virsh: {}", e),
        })
    }

    async fn virsh_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.virsh(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TwinError::Hypervisor {
                msg: format!("virsh {} failed: {}", args.join(" "), stderr.trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn write_definition(&self, name: &str, definition: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        let path = self.scratch_dir.join(format!("{}.xml", name));
        tokio::fs::write(&path, definition).await?;
        Ok(path)
    }
}

/// Map `virsh domstate` output to a run state.
pub fn parse_domstate(state: &str) -> Result<RunState> {
    match state.trim() {
        "shut off" | "crashed" => Ok(RunState::Stopped),
        "running" | "paused" | "blocked" | "idle" | "pmsuspended" => Ok(RunState::Running),
        "in shutdown" => Ok(RunState::Transitioning),
        other => Err(TwinError::Hypervisor {
            msg: format!("unknown domain state: {}", other),
        }),
    }
}

/// Extract the `<name>` element from a domain definition.
pub fn definition_name(definition: &str) -> Option<&str> {
    let start = definition.find("<name>")? + "<name>".len();
    let end = start + definition[start..].find("</name>")?;
    let name = definition[start..end].trim();
    (!name.is_empty()).then_some(name)
}

/// Whether virsh stderr reports an unknown domain. Requires the C locale.
pub fn is_not_found(stderr: &str) -> bool {
    stderr.contains("failed to get domain") || stderr.contains("Domain not found")
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| TwinError::Hypervisor {
        msg: format!("non UTF-8 path: {}", path.display()),
    })
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>> {
        let output = self.virsh(&["domstate", name]).await?;
        if output.status.success() {
            return Ok(Some(DomainHandle::new(name)));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(TwinError::Hypervisor {
            msg: format!("lookup of {} failed: {}", name, stderr.trim()),
        })
    }

    async fn start(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh_ok(&["start", domain.name()]).await.map(|_| ())
    }

    async fn shutdown(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh_ok(&["shutdown", domain.name()]).await.map(|_| ())
    }

    async fn destroy(&self, domain: &DomainHandle) -> Result<()> {
        self.virsh_ok(&["destroy", domain.name()]).await.map(|_| ())
    }

    async fn run_state(&self, domain: &DomainHandle) -> Result<RunState> {
        let output = self.virsh(&["domstate", domain.name()]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                // transient domains vanish once they are off
                if self.transient.lock().await.contains(domain.name()) {
                    return Ok(RunState::Stopped);
                }
                return Err(TwinError::DomainNotFound {
                    name: domain.name().to_string(),
                });
            }
            return Err(TwinError::Hypervisor {
                msg: format!("domstate {} failed: {}", domain, stderr.trim()),
            });
        }
        parse_domstate(&String::from_utf8_lossy(&output.stdout))
    }

    async fn create_transient(&self, definition: &str) -> Result<DomainHandle> {
        let name = definition_name(definition).ok_or_else(|| TwinError::Hypervisor {
            msg: "domain definition has no <name>".to_string(),
        })?;
        let path = self.write_definition(name, definition).await?;
        self.virsh_ok(&["create", path_arg(&path)?]).await?;
        self.transient.lock().await.insert(name.to_string());
        Ok(DomainHandle::new(name))
    }

    async fn release(&self, domain: &DomainHandle) {
        self.transient.lock().await.remove(domain.name());
    }
}
