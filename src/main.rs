//! # NCS emulation launcher
//!
//! Runs one side of the speed demo:
//! - `ncs plant [--config plant.yaml] [--duration SECS]`: speed model at the configured tick rate,
//!   sending samples to the controller and applying its actuation.
//! - `ncs controller [--config controller.yaml]`: PID speed controller answering every sample.
//!
//! Logging goes through `env_logger` (`RUST_LOG`, default `info`). Events are written as CSV
//! under `output_dir` when one is configured. Fatal errors exit non-zero after shutdown hooks ran.
//! Ctrl-C sets the stop signal: both sides run their shutdown hooks, close the event log and exit 0.

use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{error, info, warn};

use ncs_emulation::{
    config::{ControllerConfig, PlantConfig},
    controller::service::ControllerService,
    demo::speed::{speed_plant, SpeedController, DEFAULT_SPEED_LIMIT},
    plant::link::PlantLink,
    utils::{
        metrics::{CsvRecorder, RecorderHandle},
        shutdown::StopSignal,
    },
};

#[derive(Parser, Debug)]
#[command(name = "ncs", version, about = "Networked Control System emulator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the speed plant
    Plant {
        /// YAML plant configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many seconds (overrides the configuration)
        #[arg(short, long)]
        duration: Option<f64>,
    },
    /// Run the PID speed controller
    Controller {
        /// YAML controller configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Plant { config, duration } => run_plant(config.as_deref(), duration),
        Command::Controller { config } => run_controller(config.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Routes Ctrl-C to `stop` instead of killing the process.
fn stop_on_interrupt(stop: StopSignal, component: &'static str) {
    let installed = ctrlc::set_handler(move || {
        info!("[{}] interrupt received, stopping", component);
        stop.stop();
    });
    if let Err(e) = installed {
        warn!("[{}] cannot install interrupt handler: {}", component, e);
    }
}

/// Flushes the event log and reports what it holds.
fn close_recorder(csv: Option<Arc<CsvRecorder>>) {
    if let Some(csv) = csv {
        csv.close();
        match csv.dropped() {
            0 => info!("Events written to {}", csv.path().display()),
            n => warn!("Events written to {}, {} dropped on a full queue", csv.path().display(), n),
        }
    }
}

/// Opens `<dir>/<file>` as a CSV recorder when an output directory is configured.
fn open_recorder(dir: Option<&Path>, file: &str) -> Result<(RecorderHandle, Option<Arc<CsvRecorder>>)> {
    let Some(dir) = dir else {
        return Ok((RecorderHandle::null(), None));
    };
    let path = dir.join(file);
    let csv = Arc::new(
        CsvRecorder::create(&path).with_context(|| format!("cannot create event log {}", path.display()))?,
    );
    info!("Recording events to {}", path.display());
    Ok((RecorderHandle::new(csv.clone()), Some(csv)))
}

fn run_plant(config_path: Option<&Path>, duration: Option<f64>) -> Result<()> {
    let mut config = match config_path {
        Some(path) => PlantConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => PlantConfig::default(),
    };
    if duration.is_some() {
        config.duration_secs = duration;
    }
    config.validate().context("invalid plant configuration")?;

    let (recorder, csv) = open_recorder(config.output_dir.as_deref(), "plant_events.csv")?;
    let mut plant = speed_plant(&config, DEFAULT_SPEED_LIMIT, recorder)?;
    info!("[Plant] controller parameters: {:?}", plant.store().controller_parameters());
    stop_on_interrupt(plant.stop_signal(), "Plant");

    // On either failure the plant is dropped unrun and its hooks still fire.
    let link = PlantLink::connect(&config, &mut plant)?;
    let outcome = plant.spawn().context("cannot start the tick thread")?.join();
    link.join();
    close_recorder(csv);

    let report = outcome?;
    info!(
        "[Plant] {} ticks, {} overruns, {} samples, {} batches sent",
        report.ticks, report.overruns, report.samples, report.batches_sent
    );
    Ok(())
}

fn run_controller(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => ControllerConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => ControllerConfig::default(),
    };

    let (recorder, csv) = open_recorder(config.output_dir.as_deref(), "controller_events.csv")?;
    let controller = SpeedController::from_parameters(&config.parameters);
    info!("[Controller] speed setpoint {}", controller.setpoint());

    let service = ControllerService::bind(&config, Box::new(controller))?.with_recorder(recorder);
    stop_on_interrupt(service.stop_signal(), "Controller");
    let outcome = service.run();
    close_recorder(csv);
    outcome?;
    Ok(())
}
