//! # him_daq
//!
//! Command line driver of the Hi-M orchestration engine.
//!
//! - `him_daq validate --config run.toml` loads the configuration, the injection sequence and
//!   the ROI list and prints what the run would do.
//! - `him_daq run --config run.toml --simulate` runs the experiment against the simulated rig.
//!
//! Hardware drivers live outside this crate; without `--simulate` there is nothing to drive.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use him_daq::config::RunConfig;
use him_daq::experiment::{
    run_task, FluidicStep, HiMTask, InjectionProtocol, RoiSet, TaskServices, TaskState,
};
use him_daq::hardware::mock::SimulatedRig;
use him_daq::logging;
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "him_daq")]
#[command(about = "Orchestrates multi-cycle Hi-M fluidics and imaging experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a run configuration and its input documents
    Validate {
        /// Run configuration (TOML or YAML)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Run an experiment
    Run {
        /// Run configuration (TOML or YAML)
        #[arg(short, long)]
        config: PathBuf,
        /// Use the simulated rig
        #[arg(long)]
        simulate: bool,
        /// Override the configured log level
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(config),
        Command::Run {
            config,
            simulate,
            log_level,
        } => run(config, simulate, log_level).await,
    }
}

fn validate(path: PathBuf) -> Result<ExitCode> {
    let config = RunConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let protocol = InjectionProtocol::load(&config.experiment.injections_path)?;
    let rois = RoiSet::load(&config.experiment.roi_list_path)?;

    println!("Sample: {}", config.experiment.sample_name);
    println!("Probes ({}):", protocol.probes.len());
    for probe in protocol.probes.iter() {
        println!("  tube {:>3}  {}", probe.needle_position, probe.name);
    }
    for (phase, steps) in [
        ("Hybridization", &protocol.hybridization),
        ("Photobleaching", &protocol.photobleaching),
    ] {
        println!("{phase} ({} steps):", steps.len());
        for (n, step) in steps.iter().enumerate() {
            println!("  {:>2}. {step}", n + 1);
        }
    }
    let injection_time: std::time::Duration = protocol
        .hybridization
        .iter()
        .chain(protocol.photobleaching.iter())
        .filter(|s| matches!(s, FluidicStep::Injection { .. }))
        .map(FluidicStep::expected_duration)
        .fold(std::time::Duration::ZERO, std::time::Duration::saturating_add);
    println!(
        "Expected injection time per cycle: {}",
        humantime::format_duration(injection_time)
    );
    println!(
        "Expected fluidics time per cycle: {}",
        humantime::format_duration(protocol.expected_cycle_duration())
    );
    println!(
        "ROIs ({}), {} planes x {} lines per stack",
        rois.len(),
        config.imaging.num_z_planes,
        config.imaging.sequence.len()
    );
    Ok(ExitCode::SUCCESS)
}

async fn run(path: PathBuf, simulate: bool, log_level: Option<String>) -> Result<ExitCode> {
    let mut config = RunConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    if let Some(level) = log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    logging::init(&config.application)?;

    if !simulate {
        bail!("no hardware drivers are linked into this build; use --simulate");
    }
    let rig = SimulatedRig::new(512, 512, config.imaging.sync.exposure_line);
    let services = TaskServices::from_config(&config.transfer);
    let mut task = HiMTask::new(config, rig.instruments(), services);

    let abort = task.abort_flag();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, aborting the run");
                abort.request();
            }
            Err(e) => error!(error = %e, "could not listen for ctrl-c"),
        }
    });

    let state = run_task(&mut task).await;
    info!(%state, cycles = task.cycles_run(), "run ended");
    if task.was_aborted() || state == TaskState::Aborted {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
