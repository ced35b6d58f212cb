// THEORY:
// The `FrameNormalizer` turns the sensor's noisy millimeter readings into the
// terrain signal everything downstream works with: a unit-interval height map
// where 1.0 is the sand closest to the sensor and 0.0 is the floor of the box.
//
// Key architectural principles:
// 1.  **Shadows Are Not Terrain**: A depth sensor reports 0 (or its "no data"
//     code) wherever the projector pattern is occluded. Those cells are filled
//     from their valid neighbors by a few rounds of dilation before they touch
//     any other state, so a shadow can never drag the average toward zero.
// 2.  **Temporal Memory**: Sand barely moves between frames but the sensor
//     flickers. An exponential moving average over filled frames keeps the
//     surface still while letting real changes through at a rate set by alpha.
// 3.  **Bounded Output**: The averaged depth is clipped to the configured
//     working range and flipped so that closer means higher. The result is
//     always inside [0, 1], whatever the sensor sent.
// 4.  **Loud Shape Errors**: The accumulator's shape is fixed by the first
//     frame. A frame of any other shape is a configuration bug (a changed ROI
//     without a reset) and is rejected rather than resized.

use crate::core_modules::frame::{Millimeters, NormalizedHeightMap};
use crate::core_modules::grid::Grid;
use crate::error::Result;
use log::debug;

/// The normalizer's slice of the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerSettings {
    pub min_depth: f32,
    pub max_depth: f32,
    pub smoothing_alpha: f32,
    pub max_valid_depth: Millimeters,
    pub shadow_fill_iterations: usize,
}

/// Stateful depth-to-height converter with a temporal accumulator.
pub struct FrameNormalizer {
    settings: NormalizerSettings,
    /// Exponential moving average of shadow-filled depth, in millimeters.
    accumulator: Option<Grid<f32>>,
}

impl FrameNormalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self {
            settings,
            accumulator: None,
        }
    }

    pub fn settings(&self) -> &NormalizerSettings {
        &self.settings
    }

    /// Replaces the settings. The accumulator is kept, so a new depth range
    /// applies to the next frame without losing the smoothed surface.
    pub fn set_settings(&mut self, settings: NormalizerSettings) {
        self.settings = settings;
    }

    /// Drops the accumulator. The next frame establishes a new shape.
    pub fn reset(&mut self) {
        self.accumulator = None;
    }

    pub fn accumulator(&self) -> Option<&Grid<f32>> {
        self.accumulator.as_ref()
    }

    /// Converts one depth frame into a height map and folds it into the
    /// temporal average.
    pub fn normalize(&mut self, depth: &Grid<Millimeters>) -> Result<NormalizedHeightMap> {
        if let Some(acc) = &self.accumulator {
            depth.ensure_shape(acc.shape())?;
        }

        let filled = self.fill_shadows(depth);
        let alpha = self.settings.smoothing_alpha;
        match self.accumulator.as_mut() {
            None => self.accumulator = Some(filled),
            Some(acc) => {
                for (a, f) in acc.data_mut().iter_mut().zip(filled.data()) {
                    *a = alpha * f + (1.0 - alpha) * *a;
                }
            }
        }

        let (min, max) = (self.settings.min_depth, self.settings.max_depth);
        let span = (max - min).max(f32::EPSILON);
        let height = match &self.accumulator {
            Some(acc) => acc.map(|d| ((max - d.clamp(min, max)) / span).clamp(0.0, 1.0)),
            None => Grid::new(depth.width(), depth.height(), 0.0),
        };
        Ok(height)
    }

    fn is_valid(&self, sample: Millimeters) -> bool {
        sample != 0 && sample <= self.settings.max_valid_depth
    }

    /// Grows the valid region into shadow cells, one ring per iteration, using
    /// the mean of each cell's valid 8-neighbors.
    fn fill_shadows(&self, depth: &Grid<Millimeters>) -> Grid<f32> {
        let (width, height) = depth.shape();
        let mut values: Vec<f32> = depth.data().iter().map(|&d| d as f32).collect();
        let mut valid: Vec<bool> = depth.data().iter().map(|&d| self.is_valid(d)).collect();
        let mut remaining = valid.iter().filter(|v| !**v).count();

        for _ in 0..self.settings.shadow_fill_iterations {
            if remaining == 0 {
                break;
            }
            let prev_values = values.clone();
            let prev_valid = valid.clone();

            for y in 0..height {
                for x in 0..width {
                    let i = y * width + x;
                    if prev_valid[i] {
                        continue;
                    }
                    let mut sum = 0.0f32;
                    let mut count = 0u32;
                    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
                        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
                            let j = ny * width + nx;
                            if j != i && prev_valid[j] {
                                sum += prev_values[j];
                                count += 1;
                            }
                        }
                    }
                    if count > 0 {
                        values[i] = sum / count as f32;
                        valid[i] = true;
                        remaining -= 1;
                    }
                }
            }
        }

        if remaining > 0 {
            debug!("{remaining} shadow cells left after dilation, using fallback depth");
            for (i, ok) in valid.iter().enumerate() {
                if !ok {
                    values[i] = match &self.accumulator {
                        Some(acc) => acc.data()[i],
                        None => self.settings.max_depth,
                    };
                }
            }
        }

        Grid::from_vec(width, height, values).unwrap_or_else(|_| Grid::new(width, height, 0.0))
    }
}
