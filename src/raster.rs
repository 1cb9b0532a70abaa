use std::path::Path;

use image::{DynamicImage, GenericImageView, RgbImage};
use ndarray::prelude::*;
use num_traits::ToPrimitive;

use crate::errors::{Result, SegError};

/// Decodes a raster into a `(height, width, 3)` 8-bit buffer.
///
/// Grayscale is replicated to three channels, alpha is dropped, and non-8-bit
/// samples are min-max rescaled to 0..=255 across the whole image.
pub fn load_image_buffer(path: &Path) -> Result<Array3<u8>> {
    let image = image::open(path).map_err(|e| SegError::ExportFailure {
        path: path.to_path_buf(),
        operation: "raster decode".to_string(),
        source: Box::new(e),
    })?;
    Ok(to_image_buffer(&image))
}

pub fn to_image_buffer(image: &DynamicImage) -> Array3<u8> {
    let (width, height) = image.dimensions();
    let shape = (height as usize, width as usize);
    match image {
        DynamicImage::ImageLuma8(buf) => select_channels(buf.as_raw(), shape, 1),
        DynamicImage::ImageLumaA8(buf) => select_channels(buf.as_raw(), shape, 2),
        DynamicImage::ImageRgb8(buf) => select_channels(buf.as_raw(), shape, 3),
        DynamicImage::ImageRgba8(buf) => select_channels(buf.as_raw(), shape, 4),
        DynamicImage::ImageLuma16(buf) => rescale(&select_channels(buf.as_raw(), shape, 1)),
        DynamicImage::ImageLumaA16(buf) => rescale(&select_channels(buf.as_raw(), shape, 2)),
        DynamicImage::ImageRgb16(buf) => rescale(&select_channels(buf.as_raw(), shape, 3)),
        DynamicImage::ImageRgba16(buf) => rescale(&select_channels(buf.as_raw(), shape, 4)),
        DynamicImage::ImageRgb32F(buf) => rescale(&select_channels(buf.as_raw(), shape, 3)),
        DynamicImage::ImageRgba32F(buf) => rescale(&select_channels(buf.as_raw(), shape, 4)),
        other => select_channels(other.to_rgb8().as_raw(), shape, 3),
    }
}

/// 1 and 2 channel samples replicate the first channel; 3 and 4 keep the
/// first three.
fn select_channels<S: Copy>(
    samples: &[S],
    (height, width): (usize, usize),
    channels: usize,
) -> Array3<S> {
    let source = if channels < 3 { [0, 0, 0] } else { [0, 1, 2] };
    Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        samples[(y * width + x) * channels + source[c]]
    })
}

/// `(v - min) / (max - min + 1e-8) * 255`, truncated to u8.
fn rescale<S: ToPrimitive + Copy>(samples: &Array3<S>) -> Array3<u8> {
    let values = samples.mapv(|v| v.to_f64().unwrap_or(0.0));
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min + 1e-8;
    values.mapv(|v| ((v - min) / range * 255.0).clamp(0.0, 255.0) as u8)
}

/// Wraps a normalized buffer as an RGB image for re-encoding.
pub fn to_rgb_image(buffer: ArrayView3<u8>) -> Option<RgbImage> {
    let (height, width, _) = buffer.dim();
    let raw = buffer.iter().copied().collect();
    RgbImage::from_raw(width as u32, height as u32, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, LumaA, Rgb, Rgba};

    #[test]
    fn grayscale_is_replicated() {
        let gray = ImageBuffer::from_fn(3, 2, |x, y| Luma([(x + 10 * y) as u8]));
        let buffer = to_image_buffer(&DynamicImage::ImageLuma8(gray));
        assert_eq!(buffer.dim(), (2, 3, 3));
        assert_eq!(buffer.slice(s![1, 2, ..]).to_vec(), vec![12, 12, 12]);
    }

    #[test]
    fn gray_alpha_keeps_luma_only() {
        let gray = ImageBuffer::from_pixel(2, 2, LumaA([7u8, 200]));
        let buffer = to_image_buffer(&DynamicImage::ImageLumaA8(gray));
        assert!(buffer.iter().all(|&v| v == 7));
    }

    #[test]
    fn alpha_channel_is_dropped() {
        let rgba = ImageBuffer::from_pixel(2, 2, Rgba([1u8, 2, 3, 4]));
        let buffer = to_image_buffer(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(buffer.slice(s![0, 0, ..]).to_vec(), vec![1, 2, 3]);
    }

    #[test]
    fn sixteen_bit_samples_are_min_max_rescaled() {
        let mut rgb = ImageBuffer::from_pixel(2, 1, Rgb([1000u16, 1000, 1000]));
        rgb.put_pixel(1, 0, Rgb([3000, 2000, 1000]));
        let buffer = to_image_buffer(&DynamicImage::ImageRgb16(rgb));
        assert_eq!(buffer.slice(s![0, 0, ..]).to_vec(), vec![0, 0, 0]);
        assert_eq!(buffer[[0, 1, 0]], 254);
        assert_eq!(buffer[[0, 1, 1]], 127);
    }

    #[test]
    fn constant_float_image_maps_to_zero() {
        let rgb = ImageBuffer::from_pixel(2, 2, Rgb([0.5f32, 0.5, 0.5]));
        let buffer = to_image_buffer(&DynamicImage::ImageRgb32F(rgb));
        assert!(buffer.iter().all(|&v| v == 0));
    }

    #[test]
    fn missing_file_is_an_export_failure() {
        assert!(matches!(
            load_image_buffer(Path::new("/definitely/not/here.tif")),
            Err(SegError::ExportFailure { .. })
        ));
    }

    #[test]
    fn buffer_round_trips_through_rgb_image() {
        let buffer = Array3::from_shape_fn((3, 4, 3), |(y, x, c)| (y * 20 + x * 3 + c) as u8);
        let image = to_rgb_image(buffer.view()).unwrap();
        assert_eq!(image.get_pixel(2, 1).0, [26, 27, 28]);
        assert_eq!(to_image_buffer(&DynamicImage::ImageRgb8(image)), buffer);
    }
}
