mod sensors;
mod sink;

use anyhow::Context;
use clap::Parser;
use geobox::acquisition::READ_RETRY_BACKOFF;
use geobox::core_modules::terrain_match::TargetTerrain;
use geobox::{AcquisitionWorker, CalibrationFile, CycleControl, FrameCycle, FramePipeline, SandboxConfig};
use log::{info, warn};
use sensors::{ReplaySensor, SyntheticSensor};
use sink::PngSink;
use std::path::PathBuf;
use std::time::Duration;

/// Runs the sandbox frame cycle against a recorded or synthetic depth stream
/// and writes PNG snapshots of what the projector would show.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON configuration file. Missing keys use their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Calibration file produced by a calibration session.
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Directory of 16-bit PNG depth frames to replay. Without it a synthetic
    /// dune field is generated.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Seed for the synthetic sensor.
    #[arg(long)]
    seed: Option<u64>,

    /// Frames to present before stopping.
    #[arg(long, default_value_t = 300)]
    frames: u64,

    /// Sensor frame rate.
    #[arg(long, default_value_t = 30.0)]
    fps: f64,

    /// Where snapshots are written.
    #[arg(long, default_value = "snapshots")]
    output: PathBuf,

    /// Write a snapshot every N presented frames.
    #[arg(long, default_value_t = 30)]
    snapshot_every: u64,

    /// Turn rain on regardless of the configuration file.
    #[arg(long)]
    rain: bool,

    /// Score every frame against this target terrain.
    #[arg(long)]
    target: Option<PathBuf>,

    /// Save the final height map as a target terrain.
    #[arg(long)]
    save_target: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SandboxConfig::default(),
    };
    if args.rain {
        config.rain_enabled = true;
    }
    info!("effective configuration: {config:?}");

    let mut pipeline = FramePipeline::new(config.clone())?;
    if let Some(path) = &args.calibration {
        let file = CalibrationFile::load(path)
            .with_context(|| format!("loading calibration from {}", path.display()))?;
        pipeline.apply_calibration(&file)?;
    } else {
        warn!("no calibration given, using the full sensor frame unwarped");
    }
    if let Some(path) = &args.target {
        let target = TargetTerrain::load(path)
            .with_context(|| format!("loading target terrain from {}", path.display()))?;
        pipeline.set_target(Some(target));
    }

    let control = CycleControl::new();
    let frame_interval = Duration::from_secs_f64(1.0 / args.fps.max(1.0));
    let (width, height) = (config.sensor_width, config.sensor_height);
    let (worker, latest) = match &args.replay {
        Some(dir) => AcquisitionWorker::spawn(
            ReplaySensor::new(dir, width, height, frame_interval),
            &control,
            READ_RETRY_BACKOFF,
        )?,
        None => AcquisitionWorker::spawn(
            SyntheticSensor::new(width, height, frame_interval, args.seed),
            &control,
            READ_RETRY_BACKOFF,
        )?,
    };

    let interrupt = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing the current frame");
            interrupt.stop();
        }
    });

    let sink = PngSink::new(&args.output, args.snapshot_every)?;
    let cycle_control = control.clone();
    let frames = args.frames;
    let (summary, sink) = tokio::task::spawn_blocking(move || {
        let mut cycle = FrameCycle::new(pipeline, sink, latest, cycle_control).with_frame_limit(frames);
        let summary = cycle.run();
        let (_, sink) = cycle.into_parts();
        (summary, sink)
    })
    .await?;

    control.stop();
    let published = tokio::task::spawn_blocking(move || worker.join()).await?;
    let summary = summary.context("frame cycle stopped")?;
    info!(
        "{} frames presented from {published} acquired ({} stale, {} skipped on error), {} snapshots in {}",
        sink.presented(),
        summary.stale_frames,
        summary.contained_errors,
        sink.written(),
        args.output.display()
    );

    if let Some(path) = &args.save_target {
        match sink.last_height() {
            Some(height) => {
                TargetTerrain::capture(height).save(path)?;
                info!("saved target terrain to {}", path.display());
            }
            None => warn!("no frame was presented, nothing to save as a target"),
        }
    }
    if let Some(rmse) = sink.last_rmse() {
        info!("final terrain match rmse {rmse:.4}");
    }
    Ok(())
}
