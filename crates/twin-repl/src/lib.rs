#![warn(missing_docs)]

//! Twin: two-host VM disk replication with boot verification before promotion.
//!
//! The sending host snapshots a domain's disk under a database read lock and
//! ships it to the standby behind a completion marker. The standby boots the
//! replica in a throwaway test domain and only promotes it once the test
//! domain acknowledges startup.

pub mod cli;
pub mod config;
pub mod domain;
pub mod error;
pub mod guard;
pub mod marker;
pub mod mysql;
pub mod orchestrator;
pub mod remote;
pub mod snapshot;
pub mod transport;
pub mod verifier;
pub mod virsh;

pub use config::TwinConfig;
pub use domain::{DomainController, DomainHandle, Hypervisor, RunState, WaitPolicy};
pub use error::{Result, TransferStep, TwinError};
pub use guard::{ConsistencyGuard, Database, NoDatabase};
pub use marker::{IncomingDir, Marker};
pub use orchestrator::{DomainStatus, Drivers, ReplicationOrchestrator, SendReport};
pub use remote::RemoteChannel;
pub use snapshot::Snapshotter;
pub use transport::Transporter;
pub use verifier::{ReceiveOutcome, Verifier, VerifyState};
