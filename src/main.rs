//! CLI Entry Point for daq-buffer
//!
//! Provides command-line interface for:
//! - Running an acquisition from a configuration file, with recording
//! - Inspecting a recorded JSON session file
//!
//! # Usage
//!
//! Record for one minute:
//! ```bash
//! daq-buffer run --config config/buffer.toml --duration 60 --name cooldown
//! ```
//!
//! Collect until Ctrl-C without writing a file:
//! ```bash
//! daq-buffer run --config config/buffer.toml --no-record
//! ```
//!
//! Inspect a session file:
//! ```bash
//! daq-buffer inspect temp_data/2024-03-05T14-07-09_cooldown.json
//! ```

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use daq_buffer::config::{Settings, DEFAULT_CONFIG_PATH};
use daq_buffer::data::read_session;
use daq_buffer::hardware::{build_registrations, AdapterRegistry};
use daq_buffer::{logging, BufferManager};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "daq-buffer")]
#[command(about = "Buffered multi-device acquisition with periodic recording", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect from the configured devices and record a session file
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long)]
        duration: Option<f64>,

        /// Measurement name (overrides the configuration)
        #[arg(long)]
        name: Option<String>,

        /// Output folder (overrides the configuration)
        #[arg(long)]
        folder: Option<PathBuf>,

        /// Collect without recording
        #[arg(long)]
        no_record: bool,
    },

    /// Print the tables of a recorded JSON session file
    Inspect {
        /// Session file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            duration,
            name,
            folder,
            no_record,
        } => run(config, duration, name, folder, no_record).await,
        Commands::Inspect { file } => inspect(file),
    }
}

async fn run(
    config_path: PathBuf,
    duration: Option<f64>,
    name: Option<String>,
    folder: Option<PathBuf>,
    no_record: bool,
) -> Result<()> {
    let settings = Settings::load_from(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    settings.validate().map_err(|e| anyhow!(e))?;
    logging::init_from_settings(&settings).map_err(|e| anyhow!(e))?;

    let devices = build_registrations(&settings, &AdapterRegistry::new())?;
    if devices.is_empty() {
        bail!("No enabled devices in {}", config_path.display());
    }

    let mut manager = BufferManager::new(settings.recording_settings());
    manager.register(devices)?;
    if let Some(name) = name {
        manager.set_measurement_name(name)?;
    }
    if let Some(folder) = folder {
        manager.set_data_folder(folder)?;
    }

    manager.start_collection().await?;
    if !no_record {
        let path = manager.start_recording_configured().await?;
        println!("Recording to {}", path.display());
    }

    match duration {
        Some(secs) => {
            let wait = Duration::try_from_secs_f64(secs)
                .map_err(|_| anyhow!("Invalid duration: {secs}"))?;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            }
        }
        None => {
            println!("Collecting, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    if let Some(report) = manager.stop_recording().await? {
        println!(
            "Wrote {} snapshots to {} ({} skipped, {} failed)",
            report.snapshots,
            report.path.display(),
            report.skipped,
            report.failed
        );
    }
    manager.stop_collection().await?;

    for (device, state) in manager.pipeline_states() {
        let rows = manager.accumulator(&device).map_or(0, |acc| acc.len());
        println!("{device:<16} {rows:>8} rows  {state:?}");
    }
    Ok(())
}

fn inspect(file: PathBuf) -> Result<()> {
    let session = read_session(&file).with_context(|| format!("Failed to read {}", file.display()))?;

    println!("Measurement: {}", session.session.measurement_name);
    println!("Started:     {}", session.session.started_at);
    println!("Updated:     {}", session.updated_at);
    for (key, table) in &session.tables {
        println!(
            "{key:<20} {:>8} rows  [{}]",
            table.data.len(),
            table.data.column_names().join(", ")
        );
    }
    Ok(())
}
