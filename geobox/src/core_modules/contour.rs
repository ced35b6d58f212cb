// THEORY:
// Contour lines are a rendering aid layered on top of the height map. The
// height map is smoothed first so the lines follow the shape of the sand rather
// than single-pixel sensor noise, then quantized into bands of `interval`
// height. A pixel is on a contour when its band differs from the band of its
// right or lower neighbor. The result is an 8-bit mask the renderer can draw
// in any color; nothing downstream of the normalizer reads it.

use crate::core_modules::frame::NormalizedHeightMap;
use crate::error::{GeoboxError, Result};
use image::{GrayImage, ImageBuffer, Luma, imageops};

/// Gaussian sigma applied before quantizing.
const CONTOUR_SMOOTHING_SIGMA: f32 = 1.5;
/// Mask value for contour pixels.
pub const CONTOUR_ON: u8 = 255;

/// Builds a mask marking iso-height steps every `interval` height units.
pub fn contour_layer(height_map: &NormalizedHeightMap, interval: f32) -> Result<GrayImage> {
    if !(interval > 0.0 && interval <= 1.0) {
        return Err(GeoboxError::InvalidConfig(format!(
            "contour interval {interval} outside (0, 1]"
        )));
    }
    let (width, height) = (height_map.width() as u32, height_map.height() as u32);
    if width == 0 || height == 0 {
        return Ok(GrayImage::new(width, height));
    }

    let source: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(width, height, height_map.data().to_vec()).ok_or_else(|| {
            GeoboxError::InvalidConfig("height map buffer does not match its shape".into())
        })?;
    let smoothed = imageops::blur(&source, CONTOUR_SMOOTHING_SIGMA);

    let band = |x: u32, y: u32| (smoothed.get_pixel(x, y).0[0] / interval).floor() as i32;

    let mut mask = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let here = band(x, y);
            let step_right = x + 1 < width && band(x + 1, y) != here;
            let step_down = y + 1 < height && band(x, y + 1) != here;
            if step_right || step_down {
                mask.put_pixel(x, y, Luma([CONTOUR_ON]));
            }
        }
    }
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::grid::Grid;

    #[test]
    fn flat_terrain_has_no_contours() {
        let map = Grid::new(32, 32, 0.4f32);
        let mask = contour_layer(&map, 0.1).unwrap();
        assert!(mask.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn ramp_produces_one_line_per_band_boundary() {
        let (w, h) = (100usize, 20usize);
        let mut map = Grid::new(w, h, 0.0f32);
        for y in 0..h {
            for x in 0..w {
                map.set(x, y, x as f32 / 100.0);
            }
        }
        let mask = contour_layer(&map, 0.25).unwrap();
        let marks = (0..w as u32)
            .filter(|&x| mask.get_pixel(x, 10).0[0] == CONTOUR_ON)
            .count();
        assert_eq!(marks, 3);
    }

    #[test]
    fn rejects_bad_interval() {
        let map = Grid::new(4, 4, 0.5f32);
        assert!(contour_layer(&map, 0.0).is_err());
        assert!(contour_layer(&map, 1.5).is_err());
    }
}
