use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod barrier;
mod channels;
mod config;
mod device;
mod error;
mod exporter;
mod light;
mod record;
mod recorder;
mod session;
mod simulator;
mod storage;
mod supervisor;
mod trigger;
mod utils;

use config::AppConfig;
use device::{DeviceClass, Driver};
use simulator::{SimulatedDriver, SimulatorOptions};
use supervisor::SessionSupervisor;

#[derive(Debug, Parser)]
#[command(name = "lab_stream_recorder", version, about = "Synchronized multi-device stream recorder")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record every configured device until interrupted
    Record {
        /// Configuration file; the bundled default is used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Run against simulated devices instead of hardware
        #[arg(long)]
        simulate: bool,

        /// Seconds before the simulated trigger line goes high
        #[arg(long, default_value_t = 2.0)]
        trigger_after: f64,

        /// Device type code the simulated devices report (4 = T4, 7 = T7)
        #[arg(long, default_value_t = 7)]
        device_type: i32,
    },
    /// Convert binary recordings (files or directories) to CSV
    Export {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Write all CSV files here instead of a csv_files directory beside each input
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn record(config: Option<PathBuf>, simulate: bool, trigger_after: f64, device_type: i32) -> Result<()> {
    let config = match config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };
    let plan = config.validate()?;
    info!(
        devices = ?plan.devices.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
        controller = %plan.controller,
        scan_rate = plan.stream.scan_rate,
        "loaded configuration"
    );

    if !simulate {
        bail!("no hardware driver is linked into this build; run with --simulate");
    }
    let driver: Arc<dyn Driver> = Arc::new(SimulatedDriver::new(SimulatorOptions {
        class: DeviceClass::from_code(device_type),
        trigger_line: plan.lines.trigger.clone(),
        light_line: plan.lines.light_output.clone(),
        trigger_after: Duration::from_secs_f64(trigger_after.max(0.0)),
        ..SimulatorOptions::default()
    }));

    let output_dir = plan.output_directory.clone();
    let running = SessionSupervisor::new(plan, driver).start()?;
    let report = running.run_until(shutdown_signal()).await;

    for dev in &report.devices {
        match &dev.error {
            Some(e) => tracing::warn!(device = %dev.name, "finished with error: {}", e),
            None => info!(device = %dev.name, records = dev.records_written, skipped_scans = dev.skipped_scans, "finished"),
        }
    }
    let path = report.write_json(&output_dir)?;
    info!("session report written to {}", path.display());
    Ok(())
}

fn export(inputs: Vec<PathBuf>, out_dir: Option<PathBuf>) -> Result<()> {
    let results = exporter::export_all(&inputs, out_dir.as_deref())?;
    if results.is_empty() {
        bail!("no recordings found");
    }
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
    if failed > 0 {
        bail!("{} of {} files failed to export", failed, results.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    info!("Starting lab_stream_recorder");

    match cli.command {
        Command::Record {
            config,
            simulate,
            trigger_after,
            device_type,
        } => record(config, simulate, trigger_after, device_type).await,
        Command::Export { inputs, out_dir } => export(inputs, out_dir),
    }
}
