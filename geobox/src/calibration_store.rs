// THEORY:
// A calibration session produces three things that must travel together: the
// sandbox ROI, the 2x4 sensor-to-projector matrix and the depth range. They are
// stored as plain JSON, `{"roi":[x,y,w,h],"matrix":[8 numbers],"depth_range":[min,max]}`,
// with floats written so they read back bit-identical.

use crate::config::SandboxConfig;
use crate::core_modules::frame::Roi;
use crate::core_modules::warper::{CalibrationMatrix, GeometricWarper};
use crate::error::{GeoboxError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything a calibration session produces.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub roi: Roi,
    pub matrix: CalibrationMatrix,
    /// `[min_depth, max_depth]` in millimeters.
    pub depth_range: [f32; 2],
}

impl CalibrationFile {
    /// Snapshot of a calibrated warper and the configured depth range.
    pub fn capture(warper: &GeometricWarper, config: &SandboxConfig) -> Option<Self> {
        Some(Self {
            roi: warper.roi()?,
            matrix: *warper.matrix()?,
            depth_range: [config.min_depth, config.max_depth],
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let file: CalibrationFile = serde_json::from_str(&text)?;
        let [min, max] = file.depth_range;
        if !(min >= 0.0 && min < max) {
            return Err(GeoboxError::InvalidConfig(format!(
                "calibration depth range [{min}, {max}] is inverted"
            )));
        }
        info!("loaded calibration from {}", path.as_ref().display());
        Ok(file)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        info!("saved calibration to {}", path.as_ref().display());
        Ok(())
    }

    /// Installs the ROI and matrix on the warper and the depth range on the
    /// configuration. On error neither is touched.
    pub fn apply(&self, warper: &mut GeometricWarper, config: &mut SandboxConfig) -> Result<()> {
        let mut candidate = config.clone();
        candidate.min_depth = self.depth_range[0];
        candidate.max_depth = self.depth_range[1];
        candidate.validate()?;
        warper.set_calibration(self.roi, self.matrix)?;
        *config = candidate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CalibrationFile {
        CalibrationFile {
            roi: Roi::new(12, 34, 560, 410),
            matrix: CalibrationMatrix::new([
                [1.0000000000000002, 0.1 + 0.2, -3.3e-5, 17.123456789012345],
                [std::f64::consts::PI, 0.987654321, 1e-300, -250.5],
            ]),
            depth_range: [612.5, 1087.25],
        }
    }

    #[test]
    fn save_load_round_trips_exactly() {
        let path = std::env::temp_dir().join("geobox_calibration_round_trip.json");
        let original = sample();
        original.save(&path).unwrap();
        let loaded = CalibrationFile::load(&path).unwrap();
        assert_eq!(loaded, original);
        for (a, b) in loaded.matrix.to_flat().iter().zip(original.matrix.to_flat()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn file_layout_is_flat() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["roi"].as_array().unwrap().len(), 4);
        assert_eq!(json["matrix"].as_array().unwrap().len(), 8);
        assert_eq!(json["depth_range"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn apply_installs_calibration_and_range() {
        let mut warper = GeometricWarper::new(640, 480);
        let mut config = SandboxConfig::default();
        sample().apply(&mut warper, &mut config).unwrap();
        assert_eq!(warper.roi(), Some(Roi::new(12, 34, 560, 410)));
        assert_eq!(config.min_depth, 612.5);
        assert_eq!(config.max_depth, 1087.25);
        assert_eq!(CalibrationFile::capture(&warper, &config), Some(sample()));
    }

    #[test]
    fn apply_rejects_roi_outside_sensor() {
        let mut warper = GeometricWarper::new(320, 240);
        let mut config = SandboxConfig::default();
        assert!(sample().apply(&mut warper, &mut config).is_err());
        assert!(!warper.is_calibrated());
        assert_eq!(config.min_depth, 600.0);
    }

    #[test]
    fn apply_with_inverted_range_leaves_warper_untouched() {
        let mut warper = GeometricWarper::new(640, 480);
        let mut config = SandboxConfig::default();
        let file = CalibrationFile {
            depth_range: [900.0, 700.0],
            ..sample()
        };
        let err = file.apply(&mut warper, &mut config).unwrap_err();
        assert!(matches!(err, GeoboxError::InvalidConfig(_)));
        assert!(!warper.is_calibrated());
        assert_eq!(warper.roi(), None);
        assert_eq!((config.min_depth, config.max_depth), (600.0, 1100.0));
    }
}
