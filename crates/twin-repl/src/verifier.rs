//! Receive path: boot the replica in a throwaway domain, then promote it.
//!
//! ```text
//! Idle --complete.txt--> Booting --test domain up--> AwaitingAck
//!   AwaitingAck --startup.txt--> Promoting --> (production restarted)
//!   Booting | AwaitingAck --failure/timeout--> Failed
//! ```
//!
//! `complete.txt` is consumed by unlinking it before anything else happens,
//! so one marker drives at most one cycle. Once created, the test domain is
//! torn down on every path. Failed never touches the production domain.

use crate::config::TwinConfig;
use crate::domain::{DomainController, DomainHandle, WaitPolicy};
use crate::error::{Result, TwinError};
use crate::marker::{IncomingDir, Marker};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Token in a test domain template replaced by the received image path.
pub const DISK_PLACEHOLDER: &str = "{{disk}}";

/// State of the receive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyState {
    /// No cycle in progress.
    #[default]
    Idle,
    /// Booting the test domain from the received image.
    Booting,
    /// Waiting for the test domain to write `startup.txt`.
    AwaitingAck,
    /// Swapping the verified image into the production domain.
    Promoting,
    /// Verification failed; production untouched.
    Failed,
}

/// Result of a receive cycle that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// No completed transfer was waiting.
    NothingIncoming,
    /// The replica booted and is now the production image.
    Promoted {
        /// Production domain name.
        domain: String,
        /// Wall time of the whole cycle.
        elapsed: Duration,
    },
}

/// Drives the receive state machine for one domain at a time.
pub struct Verifier {
    controller: Arc<DomainController>,
    config: Arc<TwinConfig>,
    wait: WaitPolicy,
    state: Mutex<VerifyState>,
}

impl Verifier {
    /// Create a verifier.
    pub fn new(controller: Arc<DomainController>, config: Arc<TwinConfig>, wait: WaitPolicy) -> Self {
        Self {
            controller,
            config,
            wait,
            state: Mutex::new(VerifyState::Idle),
        }
    }

    /// Current state.
    pub async fn state(&self) -> VerifyState {
        *self.state.lock().await
    }

    /// Local incoming directory of `domain`.
    pub fn incoming(&self, domain: &str) -> IncomingDir {
        IncomingDir::new(&self.config.work_dir, domain)
    }

    async fn transition(&self, domain: &DomainHandle, next: VerifyState) {
        let mut state = self.state.lock().await;
        info!(domain = %domain, from = ?*state, to = ?next, "Receive state change");
        *state = next;
    }

    async fn fail(&self, domain: &DomainHandle, err: TwinError) -> TwinError {
        self.transition(domain, VerifyState::Failed).await;
        error!(domain = %domain, error = %err, "Verification failed, production left in place");
        err
    }

    /// Run one receive cycle for `domain`.
    pub async fn receive(&self, domain: &DomainHandle) -> Result<ReceiveOutcome> {
        let started = Instant::now();
        let incoming = self.incoming(domain.name());
        self.transition(domain, VerifyState::Idle).await;

        if !incoming.clear(Marker::Complete).await? {
            info!(domain = %domain, "No completed transfer waiting");
            return Ok(ReceiveOutcome::NothingIncoming);
        }
        info!(domain = %domain, "Completed transfer found");

        self.transition(domain, VerifyState::Booting).await;
        // an ack left over from an earlier cycle must not count
        if let Err(e) = incoming.clear(Marker::Startup).await {
            return Err(self.fail(domain, e).await);
        }

        let test_domain = match self.boot_test_domain(domain, &incoming).await {
            Ok(test_domain) => test_domain,
            Err(e) => return Err(self.fail(domain, e).await),
        };

        self.transition(domain, VerifyState::AwaitingAck).await;
        let acked = self.await_ack(&incoming).await;
        let teardown = self.controller.stop(&test_domain).await;

        let acked = match (acked, teardown) {
            (Ok(acked), Ok(())) => acked,
            (Err(e), teardown) => {
                if let Err(t) = teardown {
                    warn!(domain = %test_domain, error = %t, "Test domain teardown failed");
                }
                return Err(self.fail(domain, e).await);
            }
            (Ok(_), Err(t)) => return Err(self.fail(domain, t).await),
        };

        if !acked {
            let err = TwinError::VerificationTimeout {
                domain: domain.name().to_string(),
                waited_secs: self.wait.total().as_secs(),
            };
            return Err(self.fail(domain, err).await);
        }

        self.transition(domain, VerifyState::Promoting).await;
        if let Err(e) = self.promote(domain, &incoming).await {
            self.transition(domain, VerifyState::Failed).await;
            error!(domain = %domain, error = %e, "Promotion failed");
            return Err(e);
        }

        let elapsed = started.elapsed();
        self.transition(domain, VerifyState::Idle).await;
        info!(domain = %domain, elapsed_ms = elapsed.as_millis() as u64, "Replica promoted");
        Ok(ReceiveOutcome::Promoted {
            domain: domain.name().to_string(),
            elapsed,
        })
    }

    async fn boot_test_domain(
        &self,
        domain: &DomainHandle,
        incoming: &IncomingDir,
    ) -> Result<DomainHandle> {
        let start_error = |msg: String| TwinError::VerificationStart {
            domain: domain.name().to_string(),
            msg,
        };

        let image = incoming.image_path(&self.config.disk_name);
        if !tokio::fs::try_exists(&image).await? {
            return Err(start_error(format!("{} missing", image.display())));
        }

        let template_path = self.config.template_path(domain.name());
        let template = tokio::fs::read_to_string(&template_path)
            .await
            .map_err(|e| start_error(format!("{}: {}", template_path.display(), e)))?;
        let definition = template.replace(DISK_PLACEHOLDER, &image.display().to_string());

        info!(domain = %domain, image = %image.display(), "Starting test domain");
        let test_domain = self
            .controller
            .hypervisor()
            .create_transient(&definition)
            .await
            .map_err(|e| start_error(e.to_string()))?;
        info!(domain = %domain, test_domain = %test_domain, "Test domain started");
        Ok(test_domain)
    }

    /// Wait for `startup.txt`, consuming it once seen.
    async fn await_ack(&self, incoming: &IncomingDir) -> Result<bool> {
        let acked = self
            .wait
            .wait_until(|| incoming.is_set(Marker::Startup))
            .await?;
        if acked {
            incoming.clear(Marker::Startup).await?;
        }
        Ok(acked)
    }

    async fn promote(&self, domain: &DomainHandle, incoming: &IncomingDir) -> Result<()> {
        self.controller.stop(domain).await?;

        let replica = incoming.image_path(&self.config.disk_name);
        let production = self.config.production_image(domain.name());
        if let Err(e) = replace_image(&replica, &production).await {
            error!(domain = %domain, error = %e, "Image swap failed, restarting previous image");
            self.controller.start(domain).await?;
            return Err(TwinError::Promotion {
                domain: domain.name().to_string(),
                msg: e.to_string(),
            });
        }
        info!(domain = %domain, image = %production.display(), "Image replaced");

        self.controller.start(domain).await
    }
}

/// Copy `replica` next to `production`, then rename it into place.
async fn replace_image(replica: &Path, production: &Path) -> Result<()> {
    let file_name = production
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let staging: PathBuf = production.with_file_name(format!(".{}.twin-staging", file_name));

    if let Some(parent) = production.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(e) = tokio::fs::copy(replica, &staging).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&staging, production).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }
    Ok(())
}
