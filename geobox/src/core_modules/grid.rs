// THEORY:
// `Grid` is the single 2-D container shared by every stage of the frame cycle.
// Depth frames, height maps, water depth and the four flux fields are all the
// same shape of data: a row-major block of samples addressed by (x, y). Keeping
// one container means the stages agree on indexing and the shape checks
// between them are a single comparison.
//
// Key architectural principles:
// 1.  **Flat Storage**: Samples live in one `Vec<T>`, row after row. Index math
//     is `y * width + x`, the same layout the sensor driver hands us, so a raw
//     frame can be wrapped without copying.
// 2.  **Explicit Shape**: Width and height travel with the data. Any operation
//     combining two grids checks `shape()` first and reports a mismatch instead
//     of silently truncating.
// 3.  **Resampling Lives Here**: Area-averaging (for shrinking terrain onto the
//     physics grid) and bilinear interpolation (for growing water back to the
//     display) are properties of the container, not of the fluid model.

use crate::core_modules::frame::Roi;
use crate::error::{GeoboxError, Result};

/// A row-major 2-D grid of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Clone> Grid<T> {
    /// Creates a grid where every cell holds `fill`.
    pub fn new(width: usize, height: usize, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    /// Copies the rectangle described by `roi` into a new grid.
    pub fn crop(&self, roi: &Roi) -> Result<Grid<T>> {
        roi.validate(self.width, self.height)?;
        let (x0, y0) = (roi.x as usize, roi.y as usize);
        let (w, h) = (roi.width as usize, roi.height as usize);
        let mut data = Vec::with_capacity(w * h);
        for y in y0..y0 + h {
            let start = self.index(x0, y);
            data.extend_from_slice(&self.data[start..start + w]);
        }
        Ok(Grid {
            width: w,
            height: h,
            data,
        })
    }

    /// Resets every cell to `value` without reallocating.
    pub fn fill(&mut self, value: T) {
        for cell in self.data.iter_mut() {
            *cell = value.clone();
        }
    }
}

impl<T> Grid<T> {
    /// Wraps an existing buffer. The buffer length must equal `width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != width * height {
            return Err(GeoboxError::InvalidConfig(format!(
                "buffer of {} samples cannot form a {}x{} grid",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Fails with `ShapeMismatch` unless this grid is `expected` = (width, height).
    pub fn ensure_shape(&self, expected: (usize, usize)) -> Result<()> {
        if self.shape() != expected {
            return Err(GeoboxError::ShapeMismatch {
                expected,
                actual: self.shape(),
            });
        }
        Ok(())
    }

    /// Applies `f` to every sample, producing a grid of the same shape.
    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Grid<U> {
        Grid {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(f).collect(),
        }
    }
}

impl<T: Copy> Grid<T> {
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> T {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn get_mut(&mut self, x: usize, y: usize) -> &mut T {
        let i = self.index(x, y);
        &mut self.data[i]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: T) {
        let i = self.index(x, y);
        self.data[i] = value;
    }
}

impl Grid<f32> {
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|v| *v as f64).sum()
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::MIN, f32::max)
    }

    pub fn min_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::MAX, f32::min)
    }

    /// Shrinks (or keeps) the grid by averaging every source cell that overlaps
    /// each destination cell, weighted by the overlapping area.
    pub fn area_resample(&self, width: usize, height: usize) -> Grid<f32> {
        if (width, height) == self.shape() {
            return self.clone();
        }
        let x_weights = area_weights(self.width, width);
        let y_weights = area_weights(self.height, height);
        let mut out = Grid::new(width, height, 0.0f32);

        for (dy, row_weights) in y_weights.iter().enumerate() {
            for (dx, col_weights) in x_weights.iter().enumerate() {
                let mut acc = 0.0f64;
                let mut total = 0.0f64;
                for &(sy, wy) in row_weights {
                    for &(sx, wx) in col_weights {
                        let w = wx * wy;
                        acc += self.get(sx, sy) as f64 * w;
                        total += w;
                    }
                }
                let value = if total > 0.0 { acc / total } else { 0.0 };
                out.set(dx, dy, value as f32);
            }
        }
        out
    }

    /// Bilinear resize using pixel-center alignment. Resizing to the same shape
    /// returns an exact copy.
    pub fn bilinear_resample(&self, width: usize, height: usize) -> Grid<f32> {
        if (width, height) == self.shape() {
            return self.clone();
        }
        let mut out = Grid::new(width, height, 0.0f32);
        if self.is_empty() {
            return out;
        }
        let scale_x = self.width as f32 / width as f32;
        let scale_y = self.height as f32 / height as f32;
        let max_x = (self.width - 1) as f32;
        let max_y = (self.height - 1) as f32;

        for y in 0..height {
            let sy = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let fy = sy - y0 as f32;
            for x in 0..width {
                let sx = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let fx = sx - x0 as f32;

                let top = self.get(x0, y0) * (1.0 - fx) + self.get(x1, y0) * fx;
                let bottom = self.get(x0, y1) * (1.0 - fx) + self.get(x1, y1) * fx;
                out.set(x, y, top * (1.0 - fy) + bottom * fy);
            }
        }
        out
    }
}

/// For every destination index, the source indices it covers and the covered
/// fraction of each.
fn area_weights(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f64)>> {
    let scale = src_len as f64 / dst_len as f64;
    (0..dst_len)
        .map(|d| {
            let start = d as f64 * scale;
            let end = ((d + 1) as f64 * scale).min(src_len as f64);
            let first = start.floor() as usize;
            let last = (end.ceil() as usize).min(src_len);
            (first..last)
                .filter_map(|s| {
                    let overlap = end.min((s + 1) as f64) - start.max(s as f64);
                    (overlap > 1e-12).then_some((s, overlap))
                })
                .collect()
        })
        .collect()
}
