// THEORY:
// One error type for the whole crate. Configuration misuse (bad shapes,
// out-of-bounds ROIs, too few calibration samples) and fatal startup failures
// are reported through `GeoboxError`. Per-frame failures use the same type but
// are contained by the frame cycle; `is_fatal` tells the two apart.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeoboxError>;

#[derive(Debug, Error)]
pub enum GeoboxError {
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("roi {roi:?} does not fit inside a {width}x{height} sensor frame")]
    RoiOutOfBounds {
        roi: (u32, u32, u32, u32),
        width: usize,
        height: usize,
    },

    #[error("calibration needs at least {required} samples, got {actual}")]
    InsufficientSamples { required: usize, actual: usize },

    #[error("calibration sample lists differ in length ({inputs} inputs, {outputs} outputs)")]
    SampleCountMismatch { inputs: usize, outputs: usize },

    #[error("calibration samples are degenerate (rank {rank} < 4)")]
    DegenerateCalibration { rank: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sensor failed to initialize: {0}")]
    SensorInit(String),

    #[error("sensor read failed: {0}")]
    SensorRead(String),

    #[error("no new frame acquired for {0:?}")]
    AcquisitionTimeout(std::time::Duration),

    #[error("acquisition channel closed")]
    AcquisitionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl GeoboxError {
    /// Errors after which the frame cycle must stop instead of skipping a frame.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GeoboxError::SensorInit(_)
                | GeoboxError::AcquisitionTimeout(_)
                | GeoboxError::AcquisitionClosed
        )
    }
}
