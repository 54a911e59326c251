//! Image files to and from `[1, 3, H, W]` tensors.

use std::path::Path;

use image::imageops::FilterType;
use image::{ImageBuffer, Rgb, RgbImage};

use crate::error::{DiffusionError, Result};
use crate::tensor::Tensor;

/// Value range an image is mapped to when loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageRange {
    /// VAE encoder input (init images).
    MinusOneToOne,
    /// ControlNet conditioning input.
    ZeroToOne,
}

/// Converts a `[1, 3, H, W]` tensor in `[0, 1]` to 8-bit RGB.
pub fn tensor_to_rgb(image: &Tensor) -> Result<RgbImage> {
    let shape = image.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] != 3 {
        return Err(DiffusionError::shape_mismatch(format!(
            "Expected an image of shape [1, 3, H, W], got {:?}",
            shape
        )));
    }
    let (height, width) = (shape[2], shape[3]);
    let plane = height * width;
    let data = image.to_vec();

    let mut pixels = Vec::with_capacity(plane * 3);
    for i in 0..plane {
        for c in 0..3 {
            let v = data[c * plane + i].clamp(0.0, 1.0);
            pixels.push((v * 255.0).round() as u8);
        }
    }

    ImageBuffer::<Rgb<u8>, _>::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| DiffusionError::image_io("Pixel buffer does not match image size"))
}

/// Converts RGB pixels to a `[1, 3, H, W]` tensor in `range`.
pub fn rgb_to_tensor(image: &RgbImage, range: ImageRange) -> Result<Tensor> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; plane * 3];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            data[c * plane + i] = match range {
                ImageRange::MinusOneToOne => v * 2.0 - 1.0,
                ImageRange::ZeroToOne => v,
            };
        }
    }
    Tensor::from_shape_vec(&[1, 3, height, width], data)
}

/// Writes a `[1, 3, H, W]` tensor in `[0, 1]`; the format follows the
/// extension.
pub fn save_image(image: &Tensor, path: &Path) -> Result<()> {
    let rgb = tensor_to_rgb(image)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            DiffusionError::image_io(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }
    rgb.save(path)
        .map_err(|e| DiffusionError::image_io(format!("Failed to save {}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), "Saved image");
    Ok(())
}

/// Reads an image, resizing it to `width` x `height` when it differs.
pub fn load_image(path: &Path, width: usize, height: usize, range: ImageRange) -> Result<Tensor> {
    if !path.exists() {
        return Err(DiffusionError::image_io(format!(
            "Image not found: {}",
            path.display()
        )));
    }
    let mut rgb = image::open(path)
        .map_err(|e| DiffusionError::image_io(format!("Failed to read {}: {}", path.display(), e)))?
        .to_rgb8();

    if rgb.width() as usize != width || rgb.height() as usize != height {
        tracing::info!(
            from = ?(rgb.width(), rgb.height()),
            to = ?(width, height),
            "Resizing input image"
        );
        rgb = image::imageops::resize(&rgb, width as u32, height as u32, FilterType::Triangle);
    }
    rgb_to_tensor(&rgb, range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn tensor_to_rgb_maps_unit_range_to_bytes() {
        // Red plane 1.0, green 0.5, blue out of range.
        let mut data = vec![1.0; 4];
        data.extend(vec![0.5; 4]);
        data.extend(vec![-3.0; 4]);
        let image = Tensor::from_shape_vec(&[1, 3, 2, 2], data).unwrap();
        let rgb = tensor_to_rgb(&image).unwrap();
        assert_eq!(rgb.dimensions(), (2, 2));
        assert_eq!(rgb.get_pixel(1, 1).0, [255, 128, 0]);
    }

    #[test]
    fn rgb_to_tensor_ranges() {
        let rgb = RgbImage::from_pixel(4, 2, Rgb([255, 0, 51]));
        let t = rgb_to_tensor(&rgb, ImageRange::MinusOneToOne).unwrap();
        assert_eq!(t.shape(), &[1, 3, 2, 4]);
        assert_eq!(t.get(0), Some(1.0));
        assert_eq!(t.get(8), Some(-1.0));

        let t = rgb_to_tensor(&rgb, ImageRange::ZeroToOne).unwrap();
        assert!((t.get(16).unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let err = tensor_to_rgb(&Tensor::zeros(&[3, 8, 8])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ShapeMismatch);
    }

    #[test]
    fn save_then_load_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("image.png");
        save_image(&Tensor::full(&[1, 3, 16, 8], 1.0), &path).unwrap();

        let same = load_image(&path, 8, 16, ImageRange::ZeroToOne).unwrap();
        assert_eq!(same.shape(), &[1, 3, 16, 8]);
        assert!(same.to_vec().iter().all(|&v| v == 1.0));

        let resized = load_image(&path, 32, 32, ImageRange::MinusOneToOne).unwrap();
        assert_eq!(resized.shape(), &[1, 3, 32, 32]);
    }

    #[test]
    fn missing_file_is_image_error() {
        let err = load_image(Path::new("/nonexistent/x.png"), 8, 8, ImageRange::ZeroToOne)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ImageIo);
    }
}
