//! Top-level driver for operator commands.

use crate::config::TwinConfig;
use crate::domain::{DomainController, DomainHandle, Hypervisor, RunState};
use crate::error::Result;
use crate::guard::{ConsistencyGuard, Database};
use crate::marker::Marker;
use crate::remote::RemoteChannel;
use crate::snapshot::Snapshotter;
use crate::transport::Transporter;
use crate::verifier::{ReceiveOutcome, Verifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// External collaborators the orchestrator drives.
pub struct Drivers {
    /// Hypervisor managing the domains.
    pub hypervisor: Arc<dyn Hypervisor>,
    /// Database quiesced around snapshots.
    pub database: Arc<dyn Database>,
    /// Snapshot producer.
    pub snapshotter: Arc<dyn Snapshotter>,
    /// Channel to the peer host.
    pub remote: Arc<dyn RemoteChannel>,
}

/// Summary of a completed send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    /// Domain name.
    pub domain: String,
    /// Snapshot that was shipped.
    pub snapshot: PathBuf,
    /// Payload size in bytes.
    pub bytes: u64,
    /// Wall time of the send.
    pub elapsed: Duration,
}

/// Point-in-time view of a domain on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    /// Domain name.
    pub domain: String,
    /// Hypervisor run state.
    pub run_state: RunState,
    /// Whether a completed transfer is waiting locally.
    pub transfer_waiting: bool,
    /// Whether a startup acknowledgment is present locally.
    pub startup_acknowledged: bool,
}

/// Sequences the components for the start, stop, send and receive commands.
pub struct ReplicationOrchestrator {
    controller: Arc<DomainController>,
    guard: ConsistencyGuard,
    snapshotter: Arc<dyn Snapshotter>,
    transporter: Transporter,
    verifier: Verifier,
}

impl ReplicationOrchestrator {
    /// Wire the components from configuration and drivers.
    pub fn new(config: Arc<TwinConfig>, drivers: Drivers) -> Self {
        let wait = config.wait_policy();
        let controller = Arc::new(DomainController::new(drivers.hypervisor, wait));
        Self {
            guard: ConsistencyGuard::new(drivers.database),
            snapshotter: drivers.snapshotter,
            transporter: Transporter::new(drivers.remote, config.remote.work_dir.clone()),
            verifier: Verifier::new(controller.clone(), config, wait),
            controller,
        }
    }

    /// Resolve a domain name before any other action.
    pub async fn resolve(&self, name: &str) -> Result<DomainHandle> {
        self.controller.resolve(name).await
    }

    /// Boot a domain.
    pub async fn start(&self, name: &str) -> Result<()> {
        let domain = self.resolve(name).await?;
        self.controller.start(&domain).await
    }

    /// Shut a domain down, escalating to destroy.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let domain = self.resolve(name).await?;
        self.controller.stop(&domain).await
    }

    /// Snapshot a domain under the database lock and ship it to the peer.
    pub async fn send(&self, name: &str) -> Result<SendReport> {
        let domain = self.resolve(name).await?;
        let started = Instant::now();
        info!(domain = %domain, "Sending");

        let snapshot = self
            .guard
            .with_database_lock(|| self.snapshotter.create_snapshot(domain.name()))
            .await?;
        let bytes = tokio::fs::metadata(&snapshot).await?.len();

        self.transporter.send(domain.name(), &snapshot).await?;

        Ok(SendReport {
            domain: domain.name().to_string(),
            snapshot,
            bytes,
            elapsed: started.elapsed(),
        })
    }

    /// Verify and promote a received replica, if one is waiting.
    pub async fn receive(&self, name: &str) -> Result<ReceiveOutcome> {
        let domain = self.resolve(name).await?;
        info!(domain = %domain, "Receiving");
        self.verifier.receive(&domain).await
    }

    /// Report run state and local markers for a domain.
    pub async fn status(&self, name: &str) -> Result<DomainStatus> {
        let domain = self.resolve(name).await?;
        let run_state = self.controller.hypervisor().run_state(&domain).await?;
        let incoming = self.verifier.incoming(domain.name());
        Ok(DomainStatus {
            domain: domain.name().to_string(),
            run_state,
            transfer_waiting: incoming.is_set(Marker::Complete).await?,
            startup_acknowledged: incoming.is_set(Marker::Startup).await?,
        })
    }
}
