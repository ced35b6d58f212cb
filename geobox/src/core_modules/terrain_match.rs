// THEORY:
// Terrain matching is a game mode: a target landscape (a DEM) is captured or
// loaded, and the live height map is scored against it while people shape the
// sand. The signed difference tells the renderer where to add (negative) or
// remove (positive) sand; the RMSE is the single number shown as the score.

use crate::core_modules::frame::NormalizedHeightMap;
use crate::core_modules::grid::Grid;
use crate::error::{GeoboxError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A stored target landscape in normalized height units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetTerrain {
    pub width: usize,
    pub height: usize,
    pub heights: Vec<f32>,
}

/// Result of scoring the live terrain against a target.
#[derive(Debug, Clone)]
pub struct TerrainComparison {
    /// live - target, per cell.
    pub difference: Grid<f32>,
    pub rmse: f32,
}

impl TargetTerrain {
    /// Captures the current height map as the target.
    pub fn capture(height_map: &NormalizedHeightMap) -> Self {
        Self {
            width: height_map.width(),
            height: height_map.height(),
            heights: height_map.data().to_vec(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let target: TargetTerrain = serde_json::from_str(&text)?;
        if target.heights.len() != target.width * target.height {
            return Err(GeoboxError::InvalidConfig(format!(
                "target terrain has {} samples for a {}x{} grid",
                target.heights.len(),
                target.width,
                target.height
            )));
        }
        Ok(target)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Scores `live` against the target. Shapes must match.
    pub fn compare(&self, live: &NormalizedHeightMap) -> Result<TerrainComparison> {
        live.ensure_shape(self.shape())?;
        let diff: Vec<f32> = live
            .data()
            .iter()
            .zip(&self.heights)
            .map(|(l, t)| l - t)
            .collect();
        let rmse = if diff.is_empty() {
            0.0
        } else {
            let sq: f64 = diff.iter().map(|d| (*d as f64) * (*d as f64)).sum();
            (sq / diff.len() as f64).sqrt() as f32
        };
        Ok(TerrainComparison {
            difference: Grid::from_vec(self.width, self.height, diff)?,
            rmse,
        })
    }
}
