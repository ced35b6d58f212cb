// THEORY:
// Stand-in depth sensors for running the frame cycle without hardware. The
// replay sensor loops over recorded 16-bit PNG frames; the synthetic sensor
// generates drifting dunes with noise and shadow pixels like a real device.

use geobox::core_modules::utils::image_helper::load_depth_png;
use geobox::{DepthSensor, GeoboxError, Grid, RawDepthFrame, Result};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kinect "no data" code, one above the largest valid reading.
const NO_DATA: u16 = 2048;

/// Replays a directory of 16-bit grayscale PNG depth frames in name order,
/// looping at the end.
pub struct ReplaySensor {
    dir: PathBuf,
    width: usize,
    height: usize,
    frame_interval: Duration,
    files: Vec<PathBuf>,
    cursor: usize,
    next_id: u64,
}

impl ReplaySensor {
    pub fn new(dir: impl AsRef<Path>, width: usize, height: usize, frame_interval: Duration) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            width,
            height,
            frame_interval,
            files: Vec::new(),
            cursor: 0,
            next_id: 0,
        }
    }
}

impl DepthSensor for ReplaySensor {
    fn open(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| GeoboxError::SensorInit(format!("{}: {e}", self.dir.display())))?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("png"))
            })
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(GeoboxError::SensorInit(format!(
                "no png depth frames in {}",
                self.dir.display()
            )));
        }
        info!("replaying {} depth frames from {}", files.len(), self.dir.display());
        self.files = files;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawDepthFrame> {
        std::thread::sleep(self.frame_interval);
        let path = self
            .files
            .get(self.cursor)
            .ok_or_else(|| GeoboxError::SensorRead("replay sensor is not open".into()))?;
        self.cursor = (self.cursor + 1) % self.files.len();

        let depth = load_depth_png(path)
            .map_err(|e| GeoboxError::SensorRead(format!("{}: {e}", path.display())))?;
        depth.ensure_shape((self.width, self.height))?;
        self.next_id += 1;
        Ok(RawDepthFrame::new(self.next_id, depth))
    }

    fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}

/// Generates slowly drifting dunes with sensor noise and shadow speckle.
pub struct SyntheticSensor {
    width: usize,
    height: usize,
    frame_interval: Duration,
    rng: StdRng,
    next_id: u64,
    /// Chance that a pixel comes back as a shadow.
    shadow_probability: f64,
}

impl SyntheticSensor {
    pub fn new(width: usize, height: usize, frame_interval: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            width,
            height,
            frame_interval,
            rng,
            next_id: 0,
            shadow_probability: 0.01,
        }
    }

    fn surface(&self, x: usize, y: usize, phase: f32) -> f32 {
        let (fx, fy) = (x as f32 / self.width as f32, y as f32 / self.height as f32);
        let dunes = (fx * 9.0 + phase).sin() * (fy * 6.0).cos();
        let mound = (-((fx - 0.5).powi(2) + (fy - 0.5).powi(2)) * 12.0).exp();
        1000.0 - 120.0 * dunes - 250.0 * mound
    }
}

impl DepthSensor for SyntheticSensor {
    fn open(&mut self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(GeoboxError::SensorInit("synthetic sensor has no pixels".into()));
        }
        Ok(())
    }

    fn read_frame(&mut self) -> Result<RawDepthFrame> {
        std::thread::sleep(self.frame_interval);
        self.next_id += 1;
        let phase = self.next_id as f32 * 0.01;
        let mut depth = Grid::new(self.width, self.height, 0u16);
        for y in 0..self.height {
            for x in 0..self.width {
                let sample = if self.rng.gen_bool(self.shadow_probability) {
                    if self.rng.gen_bool(0.5) { 0 } else { NO_DATA }
                } else {
                    let noise = self.rng.gen_range(-3.0f32..=3.0);
                    (self.surface(x, y, phase) + noise).round().clamp(1.0, 2047.0) as u16
                };
                depth.set(x, y, sample);
            }
        }
        Ok(RawDepthFrame::new(self.next_id, depth))
    }

    fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }
}
