// THEORY:
// `SandboxConfig` is the single tunable surface of the engine. It is loaded
// from JSON, where missing keys fall back to their defaults, and validated
// once so the stages can trust their parameters. Each stage receives only its
// own slice (`normalizer_settings`, `simulation_parameters`).

use crate::core_modules::fluid::SimulationParameters;
use crate::core_modules::normalizer::NormalizerSettings;
use crate::error::{GeoboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the whole frame cycle, allowing for tunable behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Fixed width of the depth stream in pixels.
    pub sensor_width: usize,
    /// Fixed height of the depth stream in pixels.
    pub sensor_height: usize,
    /// Readings above this value are the sensor's "no data" code.
    pub max_valid_depth: u16,
    /// Closest distance to the sand in millimeters. Maps to height 1.0.
    pub min_depth: f32,
    /// Furthest distance (bottom of the box) in millimeters. Maps to height 0.0.
    pub max_depth: f32,
    /// Weight of the newest frame in the temporal average. Smaller is smoother
    /// but slower to follow the sand.
    pub smoothing_alpha: f32,
    /// Dilation passes used to fill sensor shadows.
    pub shadow_fill_iterations: usize,
    /// Fraction of the display resolution the fluid simulation runs at.
    pub physics_scale: f32,
    pub gravity: f32,
    /// Cross-section area of each virtual pipe (flow capacity).
    pub pipe_area: f32,
    /// Length of each virtual pipe (distance between cell centers).
    pub pipe_length: f32,
    /// Fraction of the previous step's flux kept each step. Lower values calm
    /// the water faster.
    pub flux_damping: f32,
    /// Simulation timestep per frame.
    pub timestep: f32,
    /// Water depth removed from every cell per step.
    pub evaporation_rate: f32,
    pub rain_enabled: bool,
    /// Depth added to a cell that receives rain in a step.
    pub rain_rate: f32,
    /// Chance that a given cell receives rain in a step.
    pub rain_probability: f32,
    /// Seed for reproducible rain. `None` seeds from entropy.
    pub rain_seed: Option<u64>,
    /// Spacing of contour lines in height units. `None` disables the overlay.
    pub contour_interval: Option<f32>,
    /// How long the cycle tolerates receiving no new frame before giving up.
    pub acquisition_timeout_ms: u64,
    /// Per-frame processing budget; slower frames are reported.
    pub frame_budget_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            sensor_width: 640,
            sensor_height: 480,
            max_valid_depth: 2047,
            min_depth: 600.0,
            max_depth: 1100.0,
            smoothing_alpha: 0.3,
            shadow_fill_iterations: 3,
            physics_scale: 0.25,
            gravity: 9.81,
            pipe_area: 0.5,
            pipe_length: 1.0,
            flux_damping: 0.7,
            timestep: 0.05,
            evaporation_rate: 0.001,
            rain_enabled: false,
            rain_rate: 0.01,
            rain_probability: 0.1,
            rain_seed: None,
            contour_interval: None,
            acquisition_timeout_ms: 5000,
            frame_budget_ms: 33,
        }
    }
}

impl SandboxConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: SandboxConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Rejects option values the stages cannot work with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(GeoboxError::InvalidConfig(msg));

        if self.sensor_width == 0 || self.sensor_height == 0 {
            return fail("sensor resolution must be non-zero".into());
        }
        if !(self.min_depth >= 0.0 && self.min_depth < self.max_depth) {
            return fail(format!(
                "min_depth ({}) must be >= 0 and below max_depth ({})",
                self.min_depth, self.max_depth
            ));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return fail(format!("smoothing_alpha {} outside (0, 1]", self.smoothing_alpha));
        }
        if !(self.physics_scale > 0.0 && self.physics_scale <= 1.0) {
            return fail(format!("physics_scale {} outside (0, 1]", self.physics_scale));
        }
        if !(self.timestep > 0.0 && self.pipe_length > 0.0 && self.pipe_area > 0.0 && self.gravity > 0.0) {
            return fail("timestep, pipe_length, pipe_area and gravity must be positive".into());
        }
        if !(self.flux_damping > 0.0 && self.flux_damping <= 1.0) {
            return fail(format!("flux_damping {} outside (0, 1]", self.flux_damping));
        }
        if self.evaporation_rate < 0.0 || self.rain_rate < 0.0 {
            return fail("evaporation_rate and rain_rate must be non-negative".into());
        }
        if !(0.0..=1.0).contains(&self.rain_probability) {
            return fail(format!("rain_probability {} outside [0, 1]", self.rain_probability));
        }
        if let Some(interval) = self.contour_interval {
            if !(interval > 0.0 && interval <= 1.0) {
                return fail(format!("contour_interval {interval} outside (0, 1]"));
            }
        }
        Ok(())
    }

    pub fn normalizer_settings(&self) -> NormalizerSettings {
        NormalizerSettings {
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            smoothing_alpha: self.smoothing_alpha,
            max_valid_depth: self.max_valid_depth,
            shadow_fill_iterations: self.shadow_fill_iterations,
        }
    }

    pub fn simulation_parameters(&self) -> SimulationParameters {
        SimulationParameters {
            gravity: self.gravity,
            pipe_area: self.pipe_area,
            pipe_length: self.pipe_length,
            flux_damping: self.flux_damping,
            timestep: self.timestep,
            evaporation_rate: self.evaporation_rate,
            rain_enabled: self.rain_enabled,
            rain_rate: self.rain_rate,
            rain_probability: self.rain_probability,
            physics_scale: self.physics_scale,
        }
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.acquisition_timeout_ms)
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_millis(self.frame_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SandboxConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{ "min_depth": 700.0, "rain_enabled": true }"#).unwrap();
        assert_eq!(config.min_depth, 700.0);
        assert!(config.rain_enabled);
        assert_eq!(config.max_depth, 1100.0);
        assert_eq!(config.physics_scale, 0.25);
    }

    #[test]
    fn rejects_inverted_depth_range() {
        let config = SandboxConfig {
            min_depth: 1200.0,
            ..SandboxConfig::default()
        };
        assert!(matches!(config.validate(), Err(GeoboxError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_out_of_range_alpha_and_scale() {
        let zero_alpha = SandboxConfig {
            smoothing_alpha: 0.0,
            ..SandboxConfig::default()
        };
        assert!(zero_alpha.validate().is_err());

        let big_scale = SandboxConfig {
            physics_scale: 1.5,
            ..SandboxConfig::default()
        };
        assert!(big_scale.validate().is_err());
    }

    #[test]
    fn damping_reaches_the_fluid_and_is_bounded() {
        let config = SandboxConfig::default();
        assert_eq!(config.simulation_parameters().flux_damping, 0.7);

        let undamped = SandboxConfig {
            flux_damping: 1.0,
            ..SandboxConfig::default()
        };
        assert!(undamped.validate().is_ok());
        for bad in [0.0, 1.2] {
            let config = SandboxConfig {
                flux_damping: bad,
                ..SandboxConfig::default()
            };
            assert!(matches!(config.validate(), Err(GeoboxError::InvalidConfig(_))));
        }
    }
}
