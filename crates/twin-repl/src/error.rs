//! Error types for the replication workflow.

use thiserror::Error;

/// Errors that can occur while starting, sending, receiving or promoting a domain.
#[derive(Debug, Error)]
pub enum TwinError {
    /// The hypervisor has no domain with this name.
    #[error("domain not found: {name}")]
    DomainNotFound {
        /// Name that failed to resolve.
        name: String,
    },

    /// The hypervisor refused to create or resume the domain.
    #[error("failed to start {name}: {msg}")]
    DomainStart {
        /// Domain name.
        name: String,
        /// Error message from the hypervisor.
        msg: String,
    },

    /// The domain is still running after a forced destroy.
    #[error("{name} still running after destruction")]
    DomainStop {
        /// Domain name.
        name: String,
    },

    /// A hypervisor call failed outside start/stop.
    #[error("hypervisor error: {msg}")]
    Hypervisor {
        /// Error message describing the issue.
        msg: String,
    },

    /// Acquiring or releasing the database lock failed.
    #[error("database error: {msg}")]
    Database {
        /// Error message describing the issue.
        msg: String,
    },

    /// A command on the peer host or a bulk copy to it failed.
    #[error("remote error: {msg}")]
    Remote {
        /// Error message describing the issue.
        msg: String,
    },

    /// Creating the disk snapshot failed.
    #[error("snapshot of {domain} failed: {msg}")]
    Snapshot {
        /// Domain name.
        domain: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// A step of the send path failed.
    #[error("send of {domain} failed at {step}: {msg}")]
    Transfer {
        /// Domain name.
        domain: String,
        /// The send step that failed.
        step: TransferStep,
        /// Error message describing the issue.
        msg: String,
    },

    /// The test domain could not be booted from the received image.
    #[error("failed to start test domain for {domain}: {msg}")]
    VerificationStart {
        /// Production domain name.
        domain: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// The test domain never acknowledged startup.
    #[error("test domain for {domain} didn't respond within {waited_secs}s")]
    VerificationTimeout {
        /// Production domain name.
        domain: String,
        /// How long the receiver waited.
        waited_secs: u64,
    },

    /// Swapping the verified image into place failed.
    #[error("promotion of {domain} failed: {msg}")]
    Promotion {
        /// Domain name.
        domain: String,
        /// Error message describing the issue.
        msg: String,
    },

    /// Configuration could not be loaded or is invalid.
    #[error("config error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl TwinError {
    /// Whether this error must abort the current command.
    ///
    /// Database lock failures are the only degraded condition: replication
    /// continues without the consistency guarantee.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TwinError::Database { .. })
    }
}

/// The ordered steps of the send path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    /// Removing the remote completion marker.
    ClearMarker,
    /// Bulk-copying the snapshot payload.
    CopyPayload,
    /// Writing the remote completion marker.
    SetMarker,
}

impl std::fmt::Display for TransferStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransferStep::ClearMarker => "clear-marker",
            TransferStep::CopyPayload => "copy-payload",
            TransferStep::SetMarker => "set-marker",
        };
        f.write_str(s)
    }
}

/// Result alias for replication operations.
pub type Result<T> = std::result::Result<T, TwinError>;
