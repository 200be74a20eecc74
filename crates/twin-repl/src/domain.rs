//! Domain lifecycle: the hypervisor seam and graceful-then-forced shutdown.
//!
//! `DomainController` is the only component that starts or stops domains.
//! Shutdown asks the guest nicely, polls its run state for a bounded number
//! of intervals, then destroys it. A domain that survives destruction means
//! the hypervisor itself is unresponsive and the command aborts.

use crate::error::{Result, TwinError};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Run state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Shut off.
    Stopped,
    /// Running, paused or otherwise holding its disk.
    Running,
    /// Between states, e.g. in shutdown.
    Transitioning,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Stopped => "stopped",
            RunState::Running => "running",
            RunState::Transitioning => "transitioning",
        };
        f.write_str(s)
    }
}

/// Handle to a domain known to the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainHandle {
    name: String,
}

impl DomainHandle {
    /// Create a handle for the named domain.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The domain name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for DomainHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Hypervisor management interface.
///
/// Calls are synchronous from the caller's point of view and report
/// success or failure unambiguously.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Look a domain up by name; `None` when it does not exist.
    async fn lookup(&self, name: &str) -> Result<Option<DomainHandle>>;

    /// Create (boot) a defined domain.
    async fn start(&self, domain: &DomainHandle) -> Result<()>;

    /// Request a graceful guest shutdown.
    async fn shutdown(&self, domain: &DomainHandle) -> Result<()>;

    /// Force the domain off.
    async fn destroy(&self, domain: &DomainHandle) -> Result<()>;

    /// Current run state.
    async fn run_state(&self, domain: &DomainHandle) -> Result<RunState>;

    /// Create and boot a transient domain from a full definition.
    async fn create_transient(&self, definition: &str) -> Result<DomainHandle>;

    /// Release any hypervisor-side resources held for the handle.
    async fn release(&self, _domain: &DomainHandle) {}
}

/// Bounded polling: check, sleep one interval, up to `attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Number of sleeps before giving up.
    pub attempts: u32,
    /// Sleep between checks.
    pub interval: Duration,
}

impl WaitPolicy {
    /// Create a policy with an explicit attempt count.
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Derive the attempt count covering `timeout` at the given interval.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval_ms = interval.as_millis().max(1);
        let attempts = timeout.as_millis().div_ceil(interval_ms);
        Self {
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            interval,
        }
    }

    /// Total time spent sleeping when the condition never holds.
    pub fn total(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }

    /// Poll `check` until it returns true or the attempts run out.
    ///
    /// Returns whether the condition was observed. Running out is final;
    /// there is no backoff or extension.
    pub async fn wait_until<F, Fut>(&self, mut check: F) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let mut count = 0;
        loop {
            if check().await? {
                return Ok(true);
            }
            if count >= self.attempts {
                return Ok(false);
            }
            count += 1;
            tokio::time::sleep(self.interval).await;
        }
    }
}

/// Starts and stops domains with timeout-based escalation.
pub struct DomainController {
    hypervisor: Arc<dyn Hypervisor>,
    wait: WaitPolicy,
}

impl DomainController {
    /// Create a controller over the given hypervisor.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, wait: WaitPolicy) -> Self {
        Self { hypervisor, wait }
    }

    /// The hypervisor this controller drives.
    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Resolve a domain name, failing when it does not exist.
    pub async fn resolve(&self, name: &str) -> Result<DomainHandle> {
        match self.hypervisor.lookup(name).await? {
            Some(domain) => Ok(domain),
            None => {
                error!(domain = %name, "Failed to connect to domain");
                Err(TwinError::DomainNotFound {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Boot the domain.
    pub async fn start(&self, domain: &DomainHandle) -> Result<()> {
        info!(domain = %domain, "Starting");
        if let Err(e) = self.hypervisor.start(domain).await {
            self.hypervisor.release(domain).await;
            error!(domain = %domain, error = %e, "Failed to start");
            return Err(TwinError::DomainStart {
                name: domain.name().to_string(),
                msg: e.to_string(),
            });
        }
        info!(domain = %domain, "Started");
        Ok(())
    }

    /// Shut the domain down, destroying it if it ignores the request.
    pub async fn stop(&self, domain: &DomainHandle) -> Result<()> {
        info!(domain = %domain, "Stopping");
        if let Err(e) = self.hypervisor.shutdown(domain).await {
            warn!(domain = %domain, error = %e, "Shutdown request failed");
        }

        let stopped = self
            .wait
            .wait_until(|| async move {
                let running = self.is_running(domain).await?;
                Ok::<bool, TwinError>(!running)
            })
            .await?;

        if !stopped {
            warn!(domain = %domain, "Didn't shut down nicely, forcing");
            if let Err(e) = self.hypervisor.destroy(domain).await {
                warn!(domain = %domain, error = %e, "Destroy request failed");
            }
        }

        if self.is_running(domain).await? {
            error!(domain = %domain, "Still running after destruction");
            return Err(TwinError::DomainStop {
                name: domain.name().to_string(),
            });
        }

        self.hypervisor.release(domain).await;
        info!(domain = %domain, "Stopped");
        Ok(())
    }

    /// Point-in-time check whether the domain still holds its disk.
    ///
    /// A transitioning domain counts as running.
    pub async fn is_running(&self, domain: &DomainHandle) -> Result<bool> {
        let state = self.hypervisor.run_state(domain).await?;
        debug!(domain = %domain, state = %state, "Run state");
        Ok(state != RunState::Stopped)
    }
}
