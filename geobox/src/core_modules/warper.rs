// THEORY:
// The `GeometricWarper` aligns what the depth sensor sees with what the
// projector draws. The two devices look at the sandbox from different places,
// so a sensor pixel (u, v) at depth d lands on projector pixel (x, y) through a
// "2.5-D" affine mapping:
//
//     x = m00*u + m01*v + m02*d + m03
//     y = m10*u + m11*v + m12*d + m13
//
// Key architectural principles:
// 1.  **Regression, Not Geometry**: The eight coefficients are fitted by linear
//     least squares over matched calibration samples. The solve goes through an
//     SVD so that a degenerate sample set (every sample at one depth, all on a
//     line) is detected by its rank and rejected instead of producing garbage.
// 2.  **Static + Dynamic Split**: Everything that depends only on (u, v) is
//     computed once per matrix change over the full sensor grid. Per frame only
//     the depth term is added, which keeps the warp a couple of multiply-adds
//     per pixel.
// 3.  **Nearest Neighbor**: Depth values are resampled, never blended. Mixing
//     the depth of a dune crest with the floor behind it would invent terrain.
// 4.  **Optional Stage**: Until a matrix exists the warp is the identity. The
//     simulation is meaningful without alignment, only the projection is off.

use crate::core_modules::frame::{ColorFrame, RawDepthFrame, Roi, TaggedFrame};
use crate::core_modules::grid::Grid;
use crate::error::{GeoboxError, Result};
use log::{info, warn};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Fewer samples than this leave the regression under-determined in practice.
pub const MIN_CALIBRATION_SAMPLES: usize = 20;
/// Singular values below `largest * RANK_TOLERANCE` count as zero.
const RANK_TOLERANCE: f64 = 1e-9;

/// The 2x4 coefficient matrix mapping `[u, v, d, 1]` to `[x, y]`.
/// Serialized as a flat row-major list of 8 numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 8]", into = "[f64; 8]")]
pub struct CalibrationMatrix {
    rows: [[f64; 4]; 2],
}

impl CalibrationMatrix {
    pub fn new(rows: [[f64; 4]; 2]) -> Self {
        Self { rows }
    }

    /// x = u, y = v: the mapping of a projector that sees exactly what the
    /// sensor sees.
    pub fn identity() -> Self {
        Self::new([[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]])
    }

    pub fn rows(&self) -> &[[f64; 4]; 2] {
        &self.rows
    }

    pub fn to_flat(&self) -> [f64; 8] {
        let [r0, r1] = self.rows;
        [r0[0], r0[1], r0[2], r0[3], r1[0], r1[1], r1[2], r1[3]]
    }

    pub fn from_flat(v: [f64; 8]) -> Self {
        Self::new([[v[0], v[1], v[2], v[3]], [v[4], v[5], v[6], v[7]]])
    }

    /// Maps one sensor sample to display coordinates.
    pub fn project(&self, u: f64, v: f64, d: f64) -> (f64, f64) {
        let [r0, r1] = &self.rows;
        (
            r0[0] * u + r0[1] * v + r0[2] * d + r0[3],
            r1[0] * u + r1[1] * v + r1[2] * d + r1[3],
        )
    }
}

impl From<[f64; 8]> for CalibrationMatrix {
    fn from(v: [f64; 8]) -> Self {
        Self::from_flat(v)
    }
}

impl From<CalibrationMatrix> for [f64; 8] {
    fn from(m: CalibrationMatrix) -> Self {
        m.to_flat()
    }
}

/// A sensor-space calibration sample: pixel (u, v) and its depth.
pub type SensorSample = (f64, f64, f64);
/// The display-space position a sensor sample should land on.
pub type DisplaySample = (f64, f64);

/// Outcome of a successful fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFit {
    pub matrix: CalibrationMatrix,
    /// Root-mean-square distance between fitted and target display positions.
    pub rms_residual: f64,
}

/// The (u, v)-only part of the mapping, precomputed over the sensor grid.
struct StaticMaps {
    x: Grid<f32>,
    y: Grid<f32>,
}

/// Fits and applies the sensor-to-display mapping.
pub struct GeometricWarper {
    sensor_width: usize,
    sensor_height: usize,
    matrix: Option<CalibrationMatrix>,
    roi: Option<Roi>,
    static_maps: Option<StaticMaps>,
}

impl GeometricWarper {
    pub fn new(sensor_width: usize, sensor_height: usize) -> Self {
        Self {
            sensor_width,
            sensor_height,
            matrix: None,
            roi: None,
            static_maps: None,
        }
    }

    pub fn matrix(&self) -> Option<&CalibrationMatrix> {
        self.matrix.as_ref()
    }

    pub fn roi(&self) -> Option<Roi> {
        self.roi
    }

    pub fn is_calibrated(&self) -> bool {
        self.matrix.is_some()
    }

    /// Installs a matrix and ROI together. The ROI must fit the sensor.
    pub fn set_calibration(&mut self, roi: Roi, matrix: CalibrationMatrix) -> Result<()> {
        roi.validate(self.sensor_width, self.sensor_height)?;
        self.roi = Some(roi);
        self.install_matrix(matrix);
        Ok(())
    }

    pub fn clear_calibration(&mut self) {
        self.matrix = None;
        self.roi = None;
        self.static_maps = None;
    }

    /// Fits the mapping from matched samples. On any failure the previous
    /// matrix stays in place.
    pub fn fit(
        &mut self,
        samples_in: &[SensorSample],
        samples_out: &[DisplaySample],
    ) -> Result<CalibrationFit> {
        let fit = solve_least_squares(samples_in, samples_out)?;
        info!(
            "calibration fitted from {} samples, rms residual {:.3} px",
            samples_in.len(),
            fit.rms_residual
        );
        if self.roi.is_none() {
            self.roi = Some(Roi::full(self.sensor_width, self.sensor_height));
        }
        self.install_matrix(fit.matrix);
        Ok(fit)
    }

    fn install_matrix(&mut self, matrix: CalibrationMatrix) {
        let [r0, r1] = *matrix.rows();
        let (w, h) = (self.sensor_width, self.sensor_height);
        let mut x = Grid::new(w, h, 0.0f32);
        let mut y = Grid::new(w, h, 0.0f32);
        for v in 0..h {
            for u in 0..w {
                let (uf, vf) = (u as f64, v as f64);
                x.set(u, v, (r0[0] * uf + r0[1] * vf + r0[3]) as f32);
                y.set(u, v, (r1[0] * uf + r1[1] * vf + r1[3]) as f32);
            }
        }
        self.static_maps = Some(StaticMaps { x, y });
        self.matrix = Some(matrix);
    }

    /// Remaps a depth frame into display space. Uncalibrated warps return the
    /// frame unchanged.
    pub fn warp(&self, frame: &RawDepthFrame) -> Result<RawDepthFrame> {
        let (Some(matrix), Some(maps)) = (&self.matrix, &self.static_maps) else {
            return Ok(frame.clone());
        };
        frame
            .depth
            .ensure_shape((self.sensor_width, self.sensor_height))?;

        let (m02, m12) = (matrix.rows()[0][2] as f32, matrix.rows()[1][2] as f32);
        let src = frame.depth.data();
        let mut out = Grid::new(self.sensor_width, self.sensor_height, 0u16);
        for v in 0..self.sensor_height {
            for u in 0..self.sensor_width {
                let d = frame.depth.get(u, v) as f32;
                if let Some(i) = self.source_index(maps, u, v, m02 * d, m12 * d) {
                    out.set(u, v, src[i]);
                }
            }
        }
        Ok(RawDepthFrame {
            frame_id: frame.frame_id,
            timestamp: frame.timestamp,
            depth: out,
        })
    }

    /// Warps a tagged frame. Color frames are remapped through the same maps,
    /// taking the depth term from `depth`.
    pub fn warp_tagged(&self, frame: &TaggedFrame, depth: &RawDepthFrame) -> Result<TaggedFrame> {
        match frame {
            TaggedFrame::Depth(d) => Ok(TaggedFrame::Depth(self.warp(d)?)),
            TaggedFrame::Color(color) => Ok(TaggedFrame::Color(self.warp_color(color, depth)?)),
        }
    }

    fn warp_color(&self, color: &ColorFrame, depth: &RawDepthFrame) -> Result<ColorFrame> {
        let (Some(matrix), Some(maps)) = (&self.matrix, &self.static_maps) else {
            return Ok(color.clone());
        };
        let expected = (self.sensor_width, self.sensor_height);
        depth.depth.ensure_shape(expected)?;
        if (color.width, color.height) != expected {
            return Err(GeoboxError::ShapeMismatch {
                expected,
                actual: (color.width, color.height),
            });
        }

        let (m02, m12) = (matrix.rows()[0][2] as f32, matrix.rows()[1][2] as f32);
        let channels = color.channels as usize;
        let mut data = vec![0u8; color.data.len()];
        for v in 0..self.sensor_height {
            for u in 0..self.sensor_width {
                let d = depth.depth.get(u, v) as f32;
                if let Some(i) = self.source_index(maps, u, v, m02 * d, m12 * d) {
                    let dst = (v * self.sensor_width + u) * channels;
                    let src = i * channels;
                    data[dst..dst + channels].copy_from_slice(&color.data[src..src + channels]);
                }
            }
        }
        ColorFrame::new(color.width, color.height, color.channels, data)
    }

    #[inline]
    fn source_index(&self, maps: &StaticMaps, u: usize, v: usize, dx: f32, dy: f32) -> Option<usize> {
        let sx = (maps.x.get(u, v) + dx).round();
        let sy = (maps.y.get(u, v) + dy).round();
        if sx < 0.0 || sy < 0.0 || sx >= self.sensor_width as f32 || sy >= self.sensor_height as f32 {
            return None;
        }
        Some(sy as usize * self.sensor_width + sx as usize)
    }

    /// Evaluates the mapping for a single sample, if calibrated.
    pub fn project(&self, u: f64, v: f64, d: f64) -> Option<(f64, f64)> {
        self.matrix.map(|m| m.project(u, v, d))
    }
}

/// Solves `A * M^T = B` for the 2x4 matrix M in the least-squares sense.
fn solve_least_squares(
    samples_in: &[SensorSample],
    samples_out: &[DisplaySample],
) -> Result<CalibrationFit> {
    if samples_in.len() != samples_out.len() {
        return Err(GeoboxError::SampleCountMismatch {
            inputs: samples_in.len(),
            outputs: samples_out.len(),
        });
    }
    let n = samples_in.len();
    if n < MIN_CALIBRATION_SAMPLES {
        return Err(GeoboxError::InsufficientSamples {
            required: MIN_CALIBRATION_SAMPLES,
            actual: n,
        });
    }

    let a = DMatrix::<f64>::from_fn(n, 4, |r, c| {
        let (u, v, d) = samples_in[r];
        match c {
            0 => u,
            1 => v,
            2 => d,
            _ => 1.0,
        }
    });
    let b = DMatrix::<f64>::from_fn(n, 2, |r, c| {
        let (x, y) = samples_out[r];
        if c == 0 { x } else { y }
    });

    let svd = a.clone().svd(true, true);
    let largest = svd.singular_values.max();
    if !largest.is_finite() || largest <= 0.0 {
        return Err(GeoboxError::DegenerateCalibration { rank: 0 });
    }
    let tolerance = largest * RANK_TOLERANCE;
    let rank = svd.rank(tolerance);
    if rank < 4 {
        warn!("rejecting calibration: sample matrix has rank {rank}");
        return Err(GeoboxError::DegenerateCalibration { rank });
    }

    // 4x2: column 0 holds the x coefficients, column 1 the y coefficients.
    let solution = svd
        .solve(&b, tolerance)
        .map_err(|_| GeoboxError::DegenerateCalibration { rank })?;
    if solution.iter().any(|c| !c.is_finite()) {
        return Err(GeoboxError::DegenerateCalibration { rank });
    }

    let mut rows = [[0.0f64; 4]; 2];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, coeff) in row.iter_mut().enumerate() {
            *coeff = solution[(c, r)];
        }
    }

    let residual = &a * &solution - &b;
    let rms_residual = (residual.norm_squared() / n as f64).sqrt();

    Ok(CalibrationFit {
        matrix: CalibrationMatrix::new(rows),
        rms_residual,
    })
}
