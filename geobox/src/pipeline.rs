// THEORY:
// The `pipeline` module is the top-level API of the engine. `FramePipeline`
// runs the per-frame stages in a fixed order:
//
//     raw depth -> warp -> crop ROI -> normalize -> fluid step -> (contour)
//
// and `FrameCycle` drives it from the acquisition slot, once per iteration,
// handing every result to a `FrameSink`.
//
// Key architectural principles:
// 1.  **One Owner**: The normalizer accumulator and the fluid state belong to
//     the pipeline alone. Nothing else mutates them, so the cycle needs no
//     locking beyond the latest-frame slot.
// 2.  **Contain, Don't Crash**: A failed stage costs one frame. The error is
//     logged with the frame id and the cycle moves on. Only errors that make
//     further progress impossible (the sensor is gone, or silent for longer
//     than the acquisition timeout) end the cycle.
// 3.  **Never Starve The Water**: When no new frame has arrived the last one is
//     processed again. The terrain is unchanged but the fluid keeps flowing.
// 4.  **Always A ROI**: Uncalibrated, the whole sensor frame is the sandbox.

use crate::acquisition::{CycleControl, LatestFrame};
use crate::calibration_store::CalibrationFile;
use crate::config::SandboxConfig;
use crate::core_modules::contour::contour_layer;
use crate::core_modules::fluid::FluidEngine;
use crate::core_modules::frame::{NormalizedHeightMap, RawDepthFrame, Roi};
use crate::core_modules::grid::Grid;
use crate::core_modules::normalizer::FrameNormalizer;
use crate::core_modules::terrain_match::{TargetTerrain, TerrainComparison};
use crate::core_modules::warper::{CalibrationMatrix, GeometricWarper};
use crate::error::{GeoboxError, Result};
use image::GrayImage;
use log::{debug, info, warn};
use std::time::{Duration, Instant};

/// Wall-clock cost of each stage for one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub warp: Duration,
    pub normalize: Duration,
    pub simulate: Duration,
    pub overlay: Duration,
}

impl StageTimings {
    pub fn total(&self) -> Duration {
        self.warp + self.normalize + self.simulate + self.overlay
    }
}

/// Everything the renderer needs for one frame.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    pub frame_id: u64,
    /// True when the depth frame was already processed on an earlier iteration.
    pub stale: bool,
    pub height: NormalizedHeightMap,
    /// Water depth at the height map's resolution.
    pub water: Grid<f32>,
    pub contour: Option<GrayImage>,
    /// Present while a terrain target is set.
    pub terrain_match: Option<TerrainComparison>,
    pub timings: StageTimings,
}

/// The rendering boundary.
pub trait FrameSink {
    fn present(&mut self, output: &FrameOutput) -> Result<()>;
}

/// The synchronous per-frame stage sequence and the state it owns.
pub struct FramePipeline {
    config: SandboxConfig,
    warper: GeometricWarper,
    normalizer: FrameNormalizer,
    fluid: FluidEngine,
    target: Option<TargetTerrain>,
    /// ROI the normalizer accumulator was built for.
    accumulator_roi: Option<Roi>,
}

impl FramePipeline {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            warper: GeometricWarper::new(config.sensor_width, config.sensor_height),
            normalizer: FrameNormalizer::new(config.normalizer_settings()),
            fluid: FluidEngine::new(config.simulation_parameters(), config.rain_seed),
            target: None,
            accumulator_roi: None,
            config,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn warper(&self) -> &GeometricWarper {
        &self.warper
    }

    pub fn warper_mut(&mut self) -> &mut GeometricWarper {
        &mut self.warper
    }

    pub fn normalizer(&self) -> &FrameNormalizer {
        &self.normalizer
    }

    pub fn fluid(&self) -> &FluidEngine {
        &self.fluid
    }

    pub fn fluid_mut(&mut self) -> &mut FluidEngine {
        &mut self.fluid
    }

    /// The sandbox region: the calibrated ROI, or the full sensor frame.
    pub fn active_roi(&self) -> Roi {
        self.warper
            .roi()
            .unwrap_or_else(|| Roi::full(self.config.sensor_width, self.config.sensor_height))
    }

    pub fn set_calibration(&mut self, roi: Roi, matrix: CalibrationMatrix) -> Result<()> {
        self.warper.set_calibration(roi, matrix)
    }

    /// Installs a stored calibration, including its depth range.
    pub fn apply_calibration(&mut self, file: &CalibrationFile) -> Result<()> {
        let mut config = self.config.clone();
        file.apply(&mut self.warper, &mut config)?;
        self.normalizer.set_settings(config.normalizer_settings());
        self.config = config;
        info!(
            "calibration applied: roi {:?}, depth range {:?}",
            file.roi, file.depth_range
        );
        Ok(())
    }

    pub fn clear_calibration(&mut self) {
        self.warper.clear_calibration();
    }

    /// Replaces the tunable parameters. Sensor resolution cannot change.
    pub fn set_config(&mut self, config: SandboxConfig) -> Result<()> {
        config.validate()?;
        let expected = (self.config.sensor_width, self.config.sensor_height);
        if (config.sensor_width, config.sensor_height) != expected {
            return Err(GeoboxError::ShapeMismatch {
                expected,
                actual: (config.sensor_width, config.sensor_height),
            });
        }
        self.normalizer.set_settings(config.normalizer_settings());
        self.fluid.set_parameters(config.simulation_parameters())?;
        self.config = config;
        Ok(())
    }

    /// Sets or removes the terrain the live height map is scored against.
    pub fn set_target(&mut self, target: Option<TargetTerrain>) {
        self.target = target;
    }

    /// Runs every stage on one depth frame.
    pub fn process(&mut self, frame: &RawDepthFrame) -> Result<FrameOutput> {
        frame
            .depth
            .ensure_shape((self.config.sensor_width, self.config.sensor_height))?;
        let mut timings = StageTimings::default();

        let start = Instant::now();
        let warped = self.warper.warp(frame)?;
        timings.warp = start.elapsed();

        let start = Instant::now();
        let roi = self.active_roi();
        if self.accumulator_roi != Some(roi) {
            if self.accumulator_roi.is_some() {
                info!("roi changed to {roi:?}, resetting the terrain average");
            }
            self.normalizer.reset();
            self.accumulator_roi = Some(roi);
        }
        let cropped = warped.depth.crop(&roi)?;
        let height = self.normalizer.normalize(&cropped)?;
        timings.normalize = start.elapsed();

        let start = Instant::now();
        let water = self.fluid.step(&height)?;
        timings.simulate = start.elapsed();

        let start = Instant::now();
        let contour = match self.config.contour_interval {
            Some(interval) => Some(contour_layer(&height, interval)?),
            None => None,
        };
        let terrain_match = match &self.target {
            Some(target) => Some(target.compare(&height)?),
            None => None,
        };
        timings.overlay = start.elapsed();

        if timings.total() > self.config.frame_budget() {
            debug!(
                "frame {} over budget ({:?} > {:?}): {:?}",
                frame.frame_id,
                timings.total(),
                self.config.frame_budget(),
                timings
            );
        }

        Ok(FrameOutput {
            frame_id: frame.frame_id,
            stale: false,
            height,
            water,
            contour,
            terrain_match,
            timings,
        })
    }
}

/// Counters reported when a cycle ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub presented: u64,
    pub new_frames: u64,
    pub stale_frames: u64,
    pub contained_errors: u64,
}

/// Drives a `FramePipeline` from the latest-frame slot until stopped.
pub struct FrameCycle<S: FrameSink> {
    pipeline: FramePipeline,
    sink: S,
    latest: LatestFrame,
    control: CycleControl,
    frame_limit: Option<u64>,
    poll_interval: Duration,
}

impl<S: FrameSink> FrameCycle<S> {
    pub fn new(pipeline: FramePipeline, sink: S, latest: LatestFrame, control: CycleControl) -> Self {
        Self {
            pipeline,
            sink,
            latest,
            control,
            frame_limit: None,
            poll_interval: Duration::from_millis(5),
        }
    }

    /// Stops after `limit` presented frames.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut FramePipeline {
        &mut self.pipeline
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_parts(self) -> (FramePipeline, S) {
        (self.pipeline, self.sink)
    }

    /// Runs until the control flag clears or the frame limit is reached.
    /// Returns early only on a fatal error.
    pub fn run(&mut self) -> Result<CycleSummary> {
        let timeout = self.pipeline.config().acquisition_timeout();
        let budget = self.pipeline.config().frame_budget();
        let mut summary = CycleSummary::default();
        let mut last_id: Option<u64> = None;
        let mut last_fresh = Instant::now();

        while self.control.is_running() {
            if self.frame_limit.is_some_and(|limit| summary.presented >= limit) {
                break;
            }
            let iteration = Instant::now();

            let Some(frame) = self.latest.latest() else {
                if self.latest.is_closed() {
                    return Err(GeoboxError::AcquisitionClosed);
                }
                if last_fresh.elapsed() > timeout {
                    return Err(GeoboxError::AcquisitionTimeout(timeout));
                }
                std::thread::sleep(self.poll_interval);
                continue;
            };

            let fresh = last_id != Some(frame.frame_id);
            if fresh {
                last_id = Some(frame.frame_id);
                last_fresh = Instant::now();
                summary.new_frames += 1;
            } else {
                if self.latest.is_closed() {
                    return Err(GeoboxError::AcquisitionClosed);
                }
                if last_fresh.elapsed() > timeout {
                    return Err(GeoboxError::AcquisitionTimeout(timeout));
                }
                summary.stale_frames += 1;
            }

            match self.pipeline.process(&frame) {
                Ok(mut output) => {
                    output.stale = !fresh;
                    match self.sink.present(&output) {
                        Ok(()) => summary.presented += 1,
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => {
                            warn!("frame {}: sink failed: {e}", frame.frame_id);
                            summary.contained_errors += 1;
                        }
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("frame {}: {e}", frame.frame_id);
                    summary.contained_errors += 1;
                }
            }

            // Reprocessing a stale frame faster than the frame budget only
            // speeds up the water.
            if !fresh {
                std::thread::sleep(budget.saturating_sub(iteration.elapsed()));
            }
        }

        info!(
            "frame cycle finished: {} presented ({} new, {} stale), {} contained errors",
            summary.presented, summary.new_frames, summary.stale_frames, summary.contained_errors
        );
        Ok(summary)
    }
}
