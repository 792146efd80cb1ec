mod catalog;
mod config;
mod control;
mod dispatch;
mod lock;
mod remote;
mod rig;
mod selector;
mod signals;
mod status;
mod supervisor;
mod telemetry;
#[cfg(test)]
mod testutil;
mod watchdog;

use catalog::{MinerCatalog, StaticCatalog};
use clap::Parser;
use config::RigConfig;
use remote::HttpRemote;
use rig::Rig;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

/// A Rust agent that supervises a mining process: runs the configured miner,
/// reports its output to the remote service, restarts it when it dies, and
/// switches miners when the service says so.
#[derive(Parser, Debug)]
#[command(name = "minerstat-rig", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "rig.toml")]
    config: PathBuf,

    /// Miner to start with (overrides identity.client_name)
    #[arg(long)]
    client: Option<String>,

    /// Worker id reported to the service (overrides identity.worker_id)
    #[arg(long)]
    worker: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the running rig's status file and exit
    #[arg(long)]
    status: bool,

    /// Extra logging (miner output, tick results)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "minerstat_rig=debug"
    } else if cli.quiet {
        "minerstat_rig=warn"
    } else {
        "minerstat_rig=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "minerstat-rig failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = RigConfig::load(&cli.config)?;
    config.apply_overrides(cli.client.as_deref(), cli.worker.as_deref());

    if cli.status {
        return print_status(&config.runtime.status_file);
    }

    config.validate()?;
    let catalog: Arc<dyn MinerCatalog> = Arc::new(StaticCatalog::from_config(
        &config.catalog,
        &config.supervisor.launcher,
    )?);

    if cli.dry_run {
        print_dry_run(&cli.config, &config, catalog.as_ref());
        return Ok(());
    }

    let remote = HttpRemote::new(
        &config.identity,
        Duration::from_secs(config.remote.timeout_secs),
        Arc::clone(&catalog),
    )?;
    let mut signals = signals::SignalHandler::install()?;
    let mut rig = Rig::new(&config, catalog, remote);

    rig.start().await?;
    let signal = signals.recv().await;
    tracing::info!(signal, "shutdown requested");
    rig.stop().await;
    Ok(())
}

fn print_status(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = match status::StatusFile::read(path) {
        Ok(data) => data,
        Err(status::StatusError::Read { source, .. })
            if source.kind() == std::io::ErrorKind::NotFound =>
        {
            println!("No rig running (no status file at {}).", path.display());
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}

fn print_dry_run(path: &Path, config: &RigConfig, catalog: &dyn MinerCatalog) {
    println!("minerstat-rig v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file: {}", path.display());
    println!("Worker:      {}", config.identity.worker_id);
    println!("API base:    {}", config.identity.api_base);
    println!("Tick:        {} ms", config.control.tick_interval_ms);
    println!("Restart:     {} ms after an unexpected exit", config.supervisor.restart_delay_ms);
    println!("Miners:");
    for miner in catalog.list() {
        println!("  {:<12} {}", miner.name, miner.path.display());
    }
    match catalog.find(&config.identity.client_name) {
        Some(miner) => println!("Would start: {} ({})", miner.name, miner.path.display()),
        None => println!(
            "Would fail: no miner named {:?} in the catalog",
            config.identity.client_name
        ),
    }
    println!("Dry run: config validated, not running.");
}
