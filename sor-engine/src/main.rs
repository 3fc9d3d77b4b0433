//! SOR engine entry point.
//!
//! Without a subcommand (or with `run`) this process becomes the director:
//! it loads the configuration, provisions the IPC objects and supervises the
//! simulation. The hidden subcommands turn a re-executed copy of the binary
//! into one of the worker roles.

use anyhow::{Context, Result};
use clap::Parser;
use sor_engine::cli::{Cli, Mode, RunArgs};
use sor_engine::config::SimulationConfig;
use sor_engine::director::Director;
use sor_engine::roles;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(mode: &Mode) {
    let log_level = if mode.verbose() {
        "debug"
    } else if mode.is_worker() {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_director(args: RunArgs) -> Result<()> {
    let mut config =
        SimulationConfig::discover(args.config.as_deref()).context("Failed to load configuration")?;
    config.apply_overrides(&args);
    config.validate().context("Invalid configuration")?;

    let exe = std::env::current_exe().context("Failed to locate the sor binary")?;
    let mut director = Director::new(config, exe);
    let report = director.run().await.context("Simulation failed")?;

    let state = &report.summary.state;
    info!(
        "Stopped ({}): {} patients, {} sent home by triage, {} dropped",
        report.summary.stop_reason, state.total_patients, state.triage_sent_home, state.dropped_units
    );
    info!("Event log: {}", report.log_path.display());
    info!("Summary: {}", report.summary_path.display());
    if report.teardown_errors > 0 {
        error!("{} IPC objects could not be removed", report.teardown_errors);
    }
    Ok(())
}

async fn run_mode(mode: Mode) -> Result<()> {
    match mode {
        Mode::Run(args) => run_director(args).await,
        worker => {
            let label = format!("{worker:?}");
            let exe = std::env::current_exe().context("Failed to locate the sor binary")?;
            roles::run_worker(worker, exe)
                .await
                .with_context(|| format!("Worker failed: {label}"))
        }
    }
}

#[tokio::main]
async fn main() {
    let mode = Cli::parse().mode();
    init_tracing(&mode);

    if let Err(e) = run_mode(mode).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
