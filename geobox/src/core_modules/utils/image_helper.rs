// THEORY:
// PNG in and out for depth frames and the grids the cycle produces. Depth is
// stored losslessly as 16-bit gray; height and water grids are scaled to
// 8-bit gray for inspection only.

use crate::core_modules::frame::Millimeters;
use crate::core_modules::grid::Grid;
use crate::error::{GeoboxError, Result};
use image::{GrayImage, ImageBuffer, ImageEncoder, Luma};
use std::path::Path;

/// Writes an interleaved RGBA8 buffer as a PNG.
pub fn save_rgba(path: impl AsRef<Path>, width: u32, height: u32, buffer: &[u8]) -> Result<()> {
    let output = std::fs::File::create(path)?;
    let encoder = image::codecs::png::PngEncoder::new(output);
    encoder.write_image(buffer, width, height, image::ExtendedColorType::Rgba8)?;
    Ok(())
}

/// Writes a grid of values in `[0, max]` as an 8-bit grayscale PNG.
pub fn save_scalar_grid(path: impl AsRef<Path>, grid: &Grid<f32>, max: f32) -> Result<()> {
    let image = scalar_grid_to_gray(grid, max)?;
    image.save(path)?;
    Ok(())
}

/// Scales a grid into 8-bit gray. Values at or above `max` become white.
pub fn scalar_grid_to_gray(grid: &Grid<f32>, max: f32) -> Result<GrayImage> {
    let max = if max > 0.0 { max } else { 1.0 };
    let bytes: Vec<u8> = grid
        .data()
        .iter()
        .map(|v| ((v / max).clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();
    GrayImage::from_raw(grid.width() as u32, grid.height() as u32, bytes)
        .ok_or_else(|| GeoboxError::InvalidConfig("grid buffer does not match its shape".into()))
}

/// Stores a depth grid losslessly as a 16-bit grayscale PNG.
pub fn save_depth_png(path: impl AsRef<Path>, depth: &Grid<Millimeters>) -> Result<()> {
    let image: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(depth.width() as u32, depth.height() as u32, depth.data().to_vec())
            .ok_or_else(|| {
                GeoboxError::InvalidConfig("depth buffer does not match its shape".into())
            })?;
    image.save(path)?;
    Ok(())
}

/// Reads a grayscale PNG as millimeter depth. 8-bit files are widened.
pub fn load_depth_png(path: impl AsRef<Path>) -> Result<Grid<Millimeters>> {
    let image = image::open(path)?.into_luma16();
    let (width, height) = image.dimensions();
    Grid::from_vec(width as usize, height as usize, image.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("geobox_image_helper");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn save_white_file() {
        let (width, height) = (64u32, 32u32);
        let buffer = vec![255u8; (width * height * 4) as usize];
        save_rgba(scratch("white_file.png"), width, height, &buffer).expect("Error Saving File.");
    }

    #[test]
    fn depth_png_round_trips() {
        let data: Vec<u16> = (0..48u16).map(|i| 600 + i * 11).collect();
        let depth = Grid::from_vec(8, 6, data).unwrap();
        let path = scratch("depth_round_trip.png");
        save_depth_png(&path, &depth).unwrap();
        assert_eq!(load_depth_png(&path).unwrap(), depth);
    }

    #[test]
    fn gray_conversion_saturates() {
        let grid = Grid::from_vec(3, 1, vec![0.0, 0.5, 2.0]).unwrap();
        let gray = scalar_grid_to_gray(&grid, 1.0).unwrap();
        assert_eq!(gray.as_raw(), &vec![0u8, 128, 255]);
    }
}
