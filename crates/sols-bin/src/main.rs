//! `sols`: command-line front end for the SOLS acquisition sequencer.
//!
//! - `compile`: compile a request TOML into a timing plan (JSON)
//! - `run`: arm and run a request against the instrument, write the manifest
//! - `plate-positions`: expand a multiwell plate layout into stage positions
//! - `verify`: recompile a run manifest and check the plan reproduces
//!
//! ```bash
//! sols compile config/requests/eleven_slices.toml
//! sols run config/requests/eleven_slices.toml --mode realistic
//! sols plate-positions config/plates/phenoplate_384.toml
//! ```
//!
//! Without `--hardware-config` (or `hardware_config` in the settings file)
//! the simulated instrument is used.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sols_core::clock::{Clock, MonotonicClock};
use sols_core::config::Settings;
use sols_core::device::DeviceDescriptor;
use sols_core::request::{AcquisitionRequest, StagePosition};
use sols_experiment::{
    AcquisitionController, CorrelationIssue, PlanCompiler, PlateScan, RunManifest, RunState,
};
use sols_hardware::{DeviceRegistry, FactoryTable, HardwareConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sols")]
#[command(about = "Acquisition sequencer for single-objective light-sheet microscopes", long_about = None)]
struct Cli {
    /// Settings file (TOML); SOLS_* environment variables override it
    #[arg(long, global = true, default_value = "config/sols.toml")]
    config: PathBuf,

    /// Hardware inventory; the simulated instrument when omitted
    #[arg(long, global = true)]
    hardware_config: Option<PathBuf>,

    /// Mock timing mode for the simulated instrument
    #[arg(long, global = true, default_value = "realistic")]
    mode: String,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a request into a timing plan
    Compile {
        /// Acquisition request (TOML)
        request: PathBuf,

        /// Write the plan here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Arm and run a request, then write the run manifest
    Run {
        /// Acquisition request (TOML)
        request: PathBuf,

        /// Manifest directory (overrides the settings file)
        #[arg(long)]
        manifest_dir: Option<PathBuf>,
    },

    /// List the stage positions of a multiwell plate layout
    PlatePositions {
        /// Plate layout (TOML)
        plate: PathBuf,
    },

    /// Check that a run manifest's plan recompiles identically
    Verify {
        /// Run manifest (JSON)
        manifest: PathBuf,
    },
}

#[derive(Serialize)]
struct CompiledPlan<'a> {
    fingerprint: String,
    plan: &'a sols_core::plan::TimingPlan,
}

#[derive(Serialize)]
struct PositionList {
    positions: Vec<StagePosition>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(Some(&cli.config))?;

    let level = if cli.verbose {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let hardware = cli
        .hardware_config
        .clone()
        .or_else(|| settings.hardware_config.clone());

    match cli.command {
        Commands::Compile { request, output } => {
            compile(&settings, hardware.as_deref(), &cli.mode, &request, output.as_deref()).await
        }
        Commands::Run {
            request,
            manifest_dir,
        } => {
            let dir = manifest_dir.unwrap_or_else(|| settings.manifest_dir.clone());
            run(&settings, hardware.as_deref(), &cli.mode, &request, &dir).await
        }
        Commands::PlatePositions { plate } => plate_positions(&plate),
        Commands::Verify { manifest } => verify(&manifest),
    }
}

fn load_request(path: &Path) -> Result<AcquisitionRequest> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request {}", path.display()))?;
    AcquisitionRequest::from_toml_str(&text)
        .with_context(|| format!("Invalid request {}", path.display()))
}

async fn build_registry(
    settings: &Settings,
    hardware: Option<&Path>,
    mode: &str,
) -> Result<DeviceRegistry> {
    let config = match hardware {
        Some(path) => HardwareConfig::from_file(path)?,
        None => HardwareConfig::sols_mock(mode)?,
    };
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    DeviceRegistry::from_config(
        &config,
        &FactoryTable::with_mock_drivers(),
        clock,
        settings.queues,
    )
    .await
}

async fn compile(
    settings: &Settings,
    hardware: Option<&Path>,
    mode: &str,
    request: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let request = load_request(request)?;
    let registry = build_registry(settings, hardware, mode).await?;
    let descriptors: Vec<DeviceDescriptor> = registry.descriptors();

    let plan = PlanCompiler::new(settings.compiler).compile(&request, &descriptors)?;
    let json = serde_json::to_string_pretty(&CompiledPlan {
        fingerprint: plan.fingerprint()?,
        plan: &plan,
    })?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(
                path = %path.display(),
                steps = plan.len(),
                duration = ?plan.duration,
                "Plan written"
            );
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn run(
    settings: &Settings,
    hardware: Option<&Path>,
    mode: &str,
    request: &Path,
    manifest_dir: &Path,
) -> Result<()> {
    let request = load_request(request)?;
    let registry = build_registry(settings, hardware, mode).await?;
    let controller = AcquisitionController::from_settings(registry, settings)?;

    let plan = controller.arm(request).await?;
    println!(
        "Armed: {} steps, {:.3} s",
        plan.len(),
        plan.duration.as_secs_f64()
    );

    let mut frames = controller
        .take_frames()
        .context("Correlated frame stream unavailable")?;
    controller.start()?;

    let mut interrupted = false;
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => match (&frame.issue, frame.coordinate) {
                    (None, Some(coordinate)) => {
                        info!(sequence = frame.frame.sequence, "Frame {}", coordinate);
                    }
                    (Some(CorrelationIssue::Preframe), _) => {
                        debug!(sequence = frame.frame.sequence, "Preframe");
                    }
                    (issue, _) => {
                        warn!(sequence = frame.frame.sequence, ?issue, "Frame not labelled");
                    }
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                println!("Interrupted, stopping after in-flight commands...");
                interrupted = true;
                if let Err(e) = controller.stop().await {
                    warn!("Stop rejected: {}", e);
                }
            }
        }
    }

    let manifest = controller.wait().await?;
    let path = manifest.write_to_dir(manifest_dir)?;
    println!(
        "Run {} {}: {}/{} steps, {} frames ({} confident)",
        manifest.run_id,
        manifest.final_state,
        manifest.steps_completed,
        manifest.plan.len(),
        manifest.frames.total,
        manifest.frames.confident
    );
    println!("Manifest: {}", path.display());

    if manifest.final_state == RunState::Faulted {
        for fault in &manifest.faults {
            eprintln!("Fault: {}", fault);
        }
        bail!("Run faulted");
    }
    Ok(())
}

fn plate_positions(plate: &Path) -> Result<()> {
    let text = std::fs::read_to_string(plate)
        .with_context(|| format!("Failed to read plate layout {}", plate.display()))?;
    let scan: PlateScan =
        toml::from_str(&text).with_context(|| format!("Invalid plate layout {}", plate.display()))?;
    let positions = scan.positions()?;
    info!(count = positions.len(), "Plate positions");
    print!("{}", toml::to_string(&PositionList { positions })?);
    Ok(())
}

fn verify(path: &Path) -> Result<()> {
    let manifest = RunManifest::read(path)?;
    if manifest.verify_reproducible()? {
        println!("Run {}: plan reproduces ({})", manifest.run_id, manifest.fingerprint);
        Ok(())
    } else {
        bail!(
            "Run {}: recompiled plan differs from the recorded one",
            manifest.run_id
        )
    }
}
