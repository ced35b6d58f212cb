// THEORY:
// The `frame` module holds the "dumb" data containers that flow through the
// frame cycle: the raw depth frame coming off the sensor, the color frame used
// for alignment previews, and the region of interest that bounds the sandbox.
// None of these types know how to process themselves; they only carry data and
// enough identity (frame id, capture time, channel count) for the stages to
// make decisions without guessing from array shapes.

use crate::core_modules::grid::Grid;
use crate::error::{GeoboxError, Result};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Depth in millimeters.
pub type Millimeters = u16;

/// Unit-interval terrain height, 1.0 = closest to the sensor.
pub type NormalizedHeightMap = Grid<f32>;

/// Integer rectangle in sensor space. Serialized as `[x, y, width, height]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u32; 4]", into = "[u32; 4]")]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The ROI covering a whole `width` x `height` frame.
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width as u32, height as u32)
    }

    /// Checks that the ROI is non-empty and lies inside a `width` x `height` frame.
    pub fn validate(&self, width: usize, height: usize) -> Result<()> {
        let fits_x = (self.x as u64 + self.width as u64) <= width as u64;
        let fits_y = (self.y as u64 + self.height as u64) <= height as u64;
        if self.width == 0 || self.height == 0 || !fits_x || !fits_y {
            return Err(GeoboxError::RoiOutOfBounds {
                roi: (self.x, self.y, self.width, self.height),
                width,
                height,
            });
        }
        Ok(())
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.width as usize, self.height as usize)
    }
}

impl From<[u32; 4]> for Roi {
    fn from(v: [u32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<Roi> for [u32; 4] {
    fn from(roi: Roi) -> Self {
        [roi.x, roi.y, roi.width, roi.height]
    }
}

/// One depth frame as captured by the sensor driver.
#[derive(Debug, Clone)]
pub struct RawDepthFrame {
    /// Monotonic id assigned at capture; the frame cycle uses it to tell a new
    /// frame from a stale one.
    pub frame_id: u64,
    /// When the driver handed the frame over.
    pub timestamp: Instant,
    /// Depth samples in millimeters. 0 and values above the sensor's valid
    /// range mark shadows.
    pub depth: Grid<Millimeters>,
}

impl RawDepthFrame {
    pub fn new(frame_id: u64, depth: Grid<Millimeters>) -> Self {
        Self {
            frame_id,
            timestamp: Instant::now(),
            depth,
        }
    }

    pub fn width(&self) -> usize {
        self.depth.width()
    }

    pub fn height(&self) -> usize {
        self.depth.height()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.depth.shape()
    }
}

/// Interleaved 8-bit color image.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFrame {
    pub width: usize,
    pub height: usize,
    pub channels: u8,
    pub data: Vec<u8>,
}

impl ColorFrame {
    pub fn new(width: usize, height: usize, channels: u8, data: Vec<u8>) -> Result<Self> {
        if !matches!(channels, 1 | 3 | 4) {
            return Err(GeoboxError::InvalidConfig(format!(
                "unsupported channel count {channels}"
            )));
        }
        if data.len() != width * height * channels as usize {
            return Err(GeoboxError::InvalidConfig(format!(
                "color buffer of {} bytes does not match {}x{}x{}",
                data.len(),
                width,
                height,
                channels
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    /// The bytes of the pixel at (x, y).
    pub fn pixel(&self, x: usize, y: usize) -> &[u8] {
        let c = self.channels as usize;
        let start = (y * self.width + x) * c;
        &self.data[start..start + c]
    }
}

/// A frame tagged with its kind, replacing shape-based guessing.
#[derive(Debug, Clone)]
pub enum TaggedFrame {
    Depth(RawDepthFrame),
    Color(ColorFrame),
}

impl TaggedFrame {
    pub fn channels(&self) -> u8 {
        match self {
            TaggedFrame::Depth(_) => 1,
            TaggedFrame::Color(color) => color.channels,
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        match self {
            TaggedFrame::Depth(depth) => depth.shape(),
            TaggedFrame::Color(color) => (color.width, color.height),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roi_validation() {
        assert!(Roi::new(0, 0, 640, 480).validate(640, 480).is_ok());
        assert!(Roi::new(1, 0, 640, 480).validate(640, 480).is_err());
        assert!(Roi::new(0, 0, 0, 10).validate(640, 480).is_err());
        assert!(Roi::new(u32::MAX, 0, 2, 10).validate(640, 480).is_err());
    }

    #[test]
    fn roi_serializes_as_array() {
        let roi = Roi::new(10, 20, 300, 200);
        let json = serde_json::to_string(&roi).unwrap();
        assert_eq!(json, "[10,20,300,200]");
        let back: Roi = serde_json::from_str(&json).unwrap();
        assert_eq!(back, roi);
    }

    #[test]
    fn tagged_frame_reports_channels() {
        let depth = RawDepthFrame::new(0, Grid::new(4, 3, 800u16));
        assert_eq!(TaggedFrame::Depth(depth).channels(), 1);
        let color = ColorFrame::new(2, 2, 3, vec![0; 12]).unwrap();
        assert_eq!(TaggedFrame::Color(color).channels(), 3);
        assert!(ColorFrame::new(2, 2, 2, vec![0; 8]).is_err());
    }
}
