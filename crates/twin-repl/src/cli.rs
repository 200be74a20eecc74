use crate::config::{TwinConfig, DEFAULT_CONFIG_PATH};
use crate::guard::{Database, NoDatabase};
use crate::mysql::MysqlDatabase;
use crate::orchestrator::{Drivers, ReplicationOrchestrator};
use crate::remote::SshChannel;
use crate::snapshot::DiskSnapshotter;
use crate::verifier::ReceiveOutcome;
use crate::virsh::VirshHypervisor;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "twin")]
#[command(about = "Replicate a VM disk to a standby host and verify it boots before promotion", long_about = None)]
pub struct Cli {
    #[arg(short, long, env = "TWIN_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Log to the console even when a log file is configured.
    #[arg(long)]
    pub console: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Boot the domain.
    Start { domain: String },
    /// Shut the domain down, forcing it off after the wait time.
    Stop { domain: String },
    /// Snapshot the domain under a database lock and ship it to the standby.
    Send { domain: String },
    /// Verify a received replica in a test domain and promote it.
    Receive { domain: String },
    /// Show run state and pending markers.
    Status { domain: String },
}

impl Command {
    pub fn domain(&self) -> &str {
        match self {
            Command::Start { domain }
            | Command::Stop { domain }
            | Command::Send { domain }
            | Command::Receive { domain }
            | Command::Status { domain } => domain,
        }
    }
}

impl Cli {
    pub fn load_config(&self) -> Result<TwinConfig> {
        let config = TwinConfig::from_file(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))?;
        if let Command::Send { .. } = self.command {
            config.validate_for_send()?;
        }
        Ok(config)
    }

    pub async fn run(self, config: Arc<TwinConfig>) -> Result<()> {
        let orchestrator = ReplicationOrchestrator::new(config.clone(), drivers(&config));

        match self.command {
            Command::Start { ref domain } => {
                println!("Starting {}", domain);
                orchestrator.start(domain).await?;
                println!("{} started", domain);
            }
            Command::Stop { ref domain } => {
                println!("Stopping {}", domain);
                orchestrator.stop(domain).await?;
                println!("{} stopped", domain);
            }
            Command::Send { ref domain } => {
                println!("Sending {}", domain);
                let report = orchestrator.send(domain).await?;
                println!(
                    "Sent {} ({}) in {:.1}s",
                    report.snapshot.display(),
                    format_bytes(report.bytes),
                    report.elapsed.as_secs_f64()
                );
            }
            Command::Receive { ref domain } => {
                println!("Receiving {}", domain);
                match orchestrator.receive(domain).await? {
                    ReceiveOutcome::NothingIncoming => println!("No completed transfer for {}", domain),
                    ReceiveOutcome::Promoted { elapsed, .. } => println!(
                        "{} verified and promoted in {:.1}s",
                        domain,
                        elapsed.as_secs_f64()
                    ),
                }
            }
            Command::Status { ref domain } => {
                let status = orchestrator.status(domain).await?;
                println!("Domain: {}", status.domain);
                println!("State: {}", status.run_state);
                println!("Transfer waiting: {}", yes_no(status.transfer_waiting));
                println!("Startup acknowledged: {}", yes_no(status.startup_acknowledged));
            }
        }
        Ok(())
    }
}

fn drivers(config: &TwinConfig) -> Drivers {
    let database: Arc<dyn Database> = if config.database.enabled {
        Arc::new(MysqlDatabase::new(config.database.clone()))
    } else {
        Arc::new(NoDatabase)
    };
    Drivers {
        hypervisor: Arc::new(VirshHypervisor::new(
            config.hypervisor_uri.clone(),
            config.work_dir.join("definitions"),
        )),
        database,
        snapshotter: Arc::new(DiskSnapshotter::from_config(config)),
        remote: Arc::new(SshChannel::new(config.remote.clone())),
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
