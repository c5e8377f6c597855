//! Command-line front end running the engine against the synthetic rig.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use smartpatch::autofocus::FocusSearch;
use smartpatch::calibration::{CalibrationMode, CoordinateCalibrator};
use smartpatch::cancel::CancellationToken;
use smartpatch::config::{RigConfig, SimulationConfig};
use smartpatch::events::{Outcome, ProgressEvent, ProgressSender};
use smartpatch::geometry::{PixelPoint, Pose};
use smartpatch::hardware::mock::{
    rotated_tip_model, MockCamera, MockManipulator, MockRig, SyntheticLocalizer,
};
use smartpatch::pipette::PipetteGeometry;
use smartpatch::storage::{JsonResultsStore, NullStore, ResultsStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Manipulator calibration and autofocus on a simulated rig")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Expected pipette tip diameter in microns
    #[arg(long, default_value_t = 16.0)]
    diameter: f64,

    /// Pipette orientation in radians
    #[arg(long, default_value_t = 0.0)]
    orientation: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sweep the manipulator axes and estimate rotation or pixel size
    HardCalibrate {
        /// xy, xyz or pixel-size
        #[arg(short, long, default_value = "xy")]
        mode: String,
    },
    /// Pair the reference pose with the averaged tip pixel
    SoftCalibrate {
        /// Pixel bias added to the averaged tip, overrides the configured one
        #[arg(long, num_args = 2, value_names = ["X", "Y"], allow_negative_numbers = true)]
        bias: Option<Vec<f64>>,
    },
    /// Search the sharpness peak along z
    Autofocus,
}

#[derive(Serialize)]
#[serde(tag = "status", content = "result", rename_all = "lowercase")]
enum Report<T> {
    Completed(T),
    Cancelled(Option<T>),
}

impl<T> From<Outcome<T>> for Report<T> {
    fn from(outcome: Outcome<T>) -> Self {
        match outcome {
            Outcome::Completed(value) => Report::Completed(value),
            Outcome::Cancelled { partial } => Report::Cancelled(partial),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RigConfig::load(args.config.as_deref()).context("loading configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!(name = %config.application.name, "configuration loaded");

    let mock = simulated_rig(&config.simulation);
    let store = results_store(&config)?;
    let pipette = PipetteGeometry::new(args.diameter, args.orientation)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            ctrl_c.cancel();
        }
    });

    let (events, rx) = ProgressSender::channel();
    let logger = tokio::spawn(log_events(rx));

    let json = match args.command {
        Command::HardCalibrate { mode } => {
            let mode: CalibrationMode = mode.parse()?;
            let calibrator = CoordinateCalibrator::new(mock.rig(), config.calibration.clone())?
                .with_store(store)
                .with_events(events);
            let outcome = calibrator.hard_calibrate(mode, pipette, &cancel).await?;
            serde_json::to_string_pretty(&Report::from(outcome))?
        }
        Command::SoftCalibrate { bias } => {
            let bias = match bias.as_deref() {
                Some([x, y]) => PixelPoint::new(*x, *y),
                _ => config.calibration.soft_bias(),
            };
            let calibrator = CoordinateCalibrator::new(mock.rig(), config.calibration.clone())?
                .with_store(store)
                .with_events(events);
            let outcome = calibrator.soft_calibrate(pipette, bias, &cancel).await?;
            serde_json::to_string_pretty(&Report::from(outcome))?
        }
        Command::Autofocus => {
            let search = FocusSearch::new(mock.rig(), config.autofocus.clone())?
                .with_store(store)
                .with_events(events);
            let outcome = search.run(&cancel).await?;
            serde_json::to_string_pretty(&Report::from(outcome))?
        }
    };

    // The engine owned the last sender; the logger drains and exits.
    logger.await?;
    println!("{json}");
    Ok(())
}

fn simulated_rig(sim: &SimulationConfig) -> MockRig {
    let [x, y, z] = sim.start_um;
    let manipulator = MockManipulator::at(Pose::new(x, y, z));
    let camera = MockCamera::new(manipulator.clone(), sim.frame_width, sim.frame_height);
    let peak = sim.focus_peak_um;
    let localizer = SyntheticLocalizer::new(camera.log())
        .with_tip_model(rotated_tip_model(
            PixelPoint::new(sim.tip_origin_px[0], sim.tip_origin_px[1]),
            sim.pixels_per_um,
            sim.rotation_deg.to_radians(),
        ))
        .with_sharpness(move |z| 1e4 - (z - peak).powi(2))
        .with_pixel_noise(sim.pixel_noise, sim.seed);
    MockRig::from_parts(manipulator, camera, localizer)
}

fn results_store(config: &RigConfig) -> Result<Arc<dyn ResultsStore>> {
    if !config.storage.enabled {
        return Ok(Arc::new(NullStore));
    }
    let dir = match &config.application.data_dir {
        Some(data_dir) => data_dir.join(&config.storage.output_dir),
        None => config.storage.output_dir.clone(),
    };
    let store = JsonResultsStore::new(&dir)
        .with_context(|| format!("creating results directory {}", dir.display()))?;
    Ok(Arc::new(store))
}

async fn log_events(mut rx: UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ProgressEvent::TipSampled { pose, point } => info!(%pose, %point, "tip sampled"),
            ProgressEvent::TipMissed { pose } => warn!(%pose, "tip missed"),
            ProgressEvent::CalibrationDegraded { missed, total } => {
                warn!(missed, total, "calibration degraded")
            }
            ProgressEvent::AngleComputed(angles) => info!(%angles, "angles computed"),
            ProgressEvent::TraceUpdated(trace) => {
                if let Some((z, score)) = trace.max() {
                    debug!(samples = trace.len(), best_z = z, best_score = score, "trace updated");
                }
            }
            ProgressEvent::Completed(_) => info!("run completed"),
            ProgressEvent::Failed(kind) => warn!(?kind, "run failed"),
            ProgressEvent::Cancelled => info!("run cancelled"),
        }
    }
}
