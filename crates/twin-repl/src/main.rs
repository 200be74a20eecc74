#![warn(missing_docs)]

//! `twin` command line entry point.

use clap::Parser;
use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use twin_repl::cli::Cli;
use twin_repl::TwinConfig;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_tracing(&config, cli.console) {
        eprintln!("FATAL: cannot open log: {:#}", e);
        return ExitCode::FAILURE;
    }

    let domain = cli.command.domain().to_string();
    tracing::info!(domain = %domain, "Twin starting");

    match cli.run(Arc::new(config)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(domain = %domain, error = %format!("{:#}", e), "Aborted");
            eprintln!("ABORT: {}: {:#}", domain, e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &TwinConfig, console: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_file {
        Some(ref path) if !console => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(filter)
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(filter)
                .init();
        }
    }
    Ok(())
}
