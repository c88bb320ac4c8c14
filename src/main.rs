//! CLI entry point for beamline-sim
//!
//! Loads a beamline configuration and drives its devices against the
//! simulated IOC:
//! - `check` validates a configuration file
//! - `status` prints device housekeeping once every device is active
//! - `scan`, `shutter` and `acquire` run one device operation to completion
//!
//! # Usage
//!
//! ```bash
//! beamline-sim check --config config/beamline.toml
//! beamline-sim scan --device gonio --timeout 30s
//! beamline-sim status --json
//! ```

use anyhow::{bail, Context, Result};
use beamline_pv::beamline::Beamline;
use beamline_pv::channel::SimBackend;
use beamline_pv::config::BeamlineConfig;
use beamline_pv::device::WaitOutcome;
use beamline_pv::logging;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "beamline-sim")]
#[command(about = "Drive configured beamline devices against a simulated IOC", long_about = None)]
struct Cli {
    /// Beamline configuration file
    #[arg(long, global = true, default_value = "config/beamline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShutterAction {
    Open,
    Close,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration
    Check {
        /// Print the effective configuration as TOML
        #[arg(long)]
        print: bool,
    },

    /// Print the status of every device
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run one goniometer scan
    Scan {
        /// Goniometer id
        #[arg(long)]
        device: String,

        /// Scan timeout, e.g. `30s`
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Option<Duration>,
    },

    /// Open or close a shutter
    Shutter {
        /// Shutter id
        #[arg(long)]
        device: String,

        #[arg(value_enum)]
        action: ShutterAction,
    },

    /// Run one detector acquisition
    Acquire {
        /// Detector id
        #[arg(long)]
        device: String,

        /// Acquisition timeout
        #[arg(long, default_value = "20s", value_parser = humantime_serde::re::humantime::parse_duration)]
        timeout: Duration,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BeamlineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;
    config.validate()?;

    let outcome = match cli.command {
        Commands::Check { print: true } => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Commands::Check { print: false } => {
            println!(
                "{}: {} device(s), {} enabled",
                config.application.name,
                config.devices.len(),
                config.enabled_devices().len()
            );
            for device in config.enabled_devices() {
                println!("  {:<12} {:<11} {}", device.id, device.kind, device.root);
            }
            return Ok(());
        }
        Commands::Status { json } => {
            let (beamline, _ioc) = ready(config)?;
            return print_status(&beamline, json);
        }
        Commands::Scan { device, timeout } => {
            let (beamline, _ioc) = ready(config)?;
            beamline.scan(&device, timeout).await?
        }
        Commands::Shutter { device, action } => {
            let (beamline, _ioc) = ready(config)?;
            let timeout = beamline_pv::device::shutter::DEFAULT_TIMEOUT;
            match action {
                ShutterAction::Open => beamline.open_shutter(&device, timeout).await?,
                ShutterAction::Close => beamline.close_shutter(&device, timeout).await?,
            }
        }
        Commands::Acquire { device, timeout } => {
            let (beamline, _ioc) = ready(config)?;
            beamline.acquire(&device, timeout).await?
        }
    };

    match outcome {
        WaitOutcome::Reached => {
            println!("done");
            Ok(())
        }
        other => bail!("operation did not complete: {:?}", other),
    }
}

/// Build the simulated beamline and wait until every device is active.
fn ready(config: BeamlineConfig) -> Result<(Beamline, SimBackend)> {
    let (beamline, ioc) = Beamline::simulated(config)?;
    let inactive = beamline.wait_ready();
    if !inactive.is_empty() {
        bail!("devices not active: {}", inactive.join(", "));
    }
    Ok((beamline, ioc))
}

fn print_status(beamline: &Beamline, json: bool) -> Result<()> {
    let status = beamline.status();
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    for s in status {
        println!(
            "{:<12} {:<11} active={:<5} busy={:<5} health={} {}",
            s.id, s.kind, s.active, s.busy, s.health, s.detail
        );
        if !s.health_message.is_empty() {
            println!("{:<12} {}", "", s.health_message);
        }
    }
    Ok(())
}
