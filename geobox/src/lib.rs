// THEORY:
// This file is the entry point of the `geobox` library crate, the engine of an
// augmented-reality sandbox. A depth sensor looks down at a box of sand, a
// projector looks down at the same box, and every frame the engine turns the
// sensor's view into a stable terrain and advances water flowing over it.
//
// The public surface is deliberately small: `FramePipeline` for one-frame
// processing, `FrameCycle` for the continuous loop, the `DepthSensor` and
// `FrameSink` traits at the hardware and rendering boundaries, and
// `SandboxConfig` for tuning. The stage modules under `core_modules` are public
// so that tools (calibration, benchmarks) can use them on their own.

pub mod acquisition;
pub mod calibration_store;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod pipeline;

pub use acquisition::{AcquisitionWorker, CycleControl, DepthSensor, LatestFrame};
pub use calibration_store::CalibrationFile;
pub use config::SandboxConfig;
pub use core_modules::frame::{NormalizedHeightMap, RawDepthFrame, Roi, TaggedFrame};
pub use core_modules::grid::Grid;
pub use error::{GeoboxError, Result};
pub use pipeline::{FrameCycle, FrameOutput, FramePipeline, FrameSink};
