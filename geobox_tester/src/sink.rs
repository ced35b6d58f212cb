// THEORY:
// `PngSink` stands in for the projector. Instead of drawing every frame it
// writes periodic PNG snapshots (height, water, contour and a composite) and
// remembers the last height map so the run can end by saving it as a target.

use geobox::core_modules::utils::image_helper::{save_rgba, save_scalar_grid};
use geobox::{FrameOutput, FrameSink, NormalizedHeightMap, Result};
use log::{debug, info};
use std::path::PathBuf;

/// Water deeper than this renders as fully saturated blue.
const WATER_DISPLAY_DEPTH: f32 = 0.05;

pub struct PngSink {
    output_dir: PathBuf,
    every: u64,
    presented: u64,
    written: u64,
    last_height: Option<NormalizedHeightMap>,
    last_rmse: Option<f32>,
}

impl PngSink {
    pub fn new(output_dir: impl Into<PathBuf>, every: u64) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self {
            output_dir,
            every: every.max(1),
            presented: 0,
            written: 0,
            last_height: None,
            last_rmse: None,
        })
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn last_height(&self) -> Option<&NormalizedHeightMap> {
        self.last_height.as_ref()
    }

    pub fn last_rmse(&self) -> Option<f32> {
        self.last_rmse
    }

    fn write_snapshot(&self, output: &FrameOutput) -> Result<()> {
        let id = output.frame_id;
        save_scalar_grid(self.output_dir.join(format!("height_{id:06}.png")), &output.height, 1.0)?;
        save_scalar_grid(
            self.output_dir.join(format!("water_{id:06}.png")),
            &output.water,
            WATER_DISPLAY_DEPTH,
        )?;
        if let Some(contour) = &output.contour {
            contour.save(self.output_dir.join(format!("contour_{id:06}.png")))?;
        }

        let (width, height) = output.height.shape();
        let mut rgba = Vec::with_capacity(width * height * 4);
        for (i, h) in output.height.data().iter().enumerate() {
            let ground = (h * 200.0) as u8 + 30;
            let wet = (output.water.data()[i] / WATER_DISPLAY_DEPTH).clamp(0.0, 1.0);
            let on_line = output.contour.as_ref().is_some_and(|c| c.as_raw()[i] > 0);
            let shade = |base: u8, water: u8| (base as f32 * (1.0 - wet) + water as f32 * wet) as u8;
            if on_line {
                rgba.extend_from_slice(&[0, 0, 0, 255]);
            } else {
                rgba.extend_from_slice(&[shade(ground, 20), shade(ground, 90), shade(ground / 2, 220), 255]);
            }
        }
        save_rgba(
            self.output_dir.join(format!("composite_{id:06}.png")),
            width as u32,
            height as u32,
            &rgba,
        )?;
        debug!("wrote snapshot for frame {id}");
        Ok(())
    }
}

impl FrameSink for PngSink {
    fn present(&mut self, output: &FrameOutput) -> Result<()> {
        self.presented += 1;
        self.last_height = Some(output.height.clone());
        self.last_rmse = output.terrain_match.as_ref().map(|m| m.rmse);
        if self.presented % self.every == 0 {
            self.write_snapshot(output)?;
            self.written += 1;
            if let Some(rmse) = self.last_rmse {
                info!("frame {}: terrain match rmse {rmse:.4}", output.frame_id);
            }
        }
        Ok(())
    }
}
