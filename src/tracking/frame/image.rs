//! Image preparation: grayscale conversion and depth scaling.

use anyhow::{bail, Result};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};

/// Metric depth map, one f32 per pixel. Zero or negative means missing.
pub type DepthImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Convert an input image to 8-bit grayscale.
///
/// Three and four channel inputs are weighted with `rgb` telling the channel
/// order (true for RGB, false for BGR as written by most camera drivers).
pub fn to_grayscale(image: &DynamicImage, rgb: bool) -> GrayImage {
    match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => {
            let rgba = image.to_rgba8();
            let mut out = GrayImage::new(rgba.width(), rgba.height());
            for (x, y, px) in rgba.enumerate_pixels() {
                let [c0, c1, c2, _] = px.0;
                let (r, b) = if rgb { (c0, c2) } else { (c2, c0) };
                let luma = 0.299 * r as f32 + 0.587 * c1 as f32 + 0.114 * b as f32;
                out.put_pixel(x, y, Luma([luma.round().clamp(0.0, 255.0) as u8]));
            }
            out
        }
        other => other.to_luma8(),
    }
}

/// Read a depth image into raw f32 samples, in the units of the file.
pub fn depth_from_image(image: &DynamicImage) -> Result<DepthImage> {
    let out = match image {
        DynamicImage::ImageLuma16(raw) => DepthImage::from_fn(raw.width(), raw.height(), |x, y| {
            Luma([raw.get_pixel(x, y).0[0] as f32])
        }),
        DynamicImage::ImageLuma8(raw) => DepthImage::from_fn(raw.width(), raw.height(), |x, y| {
            Luma([raw.get_pixel(x, y).0[0] as f32])
        }),
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => {
            let rgb = image.to_rgb32f();
            DepthImage::from_fn(rgb.width(), rgb.height(), |x, y| Luma([rgb.get_pixel(x, y).0[0]]))
        }
        _ => bail!("unsupported depth image format {:?}", image.color()),
    };
    Ok(out)
}

/// Convert raw depth samples into metres.
///
/// Raw values are divided by `depth_map_factor` (e.g. 5000 for TUM 16-bit
/// PNGs). A factor of one leaves already-metric maps untouched.
pub fn depth_to_metric(depth: &DepthImage, depth_map_factor: f64) -> Result<DepthImage> {
    if depth_map_factor <= 0.0 {
        bail!("depth map factor must be positive, got {depth_map_factor}");
    }
    if depth_map_factor == 1.0 {
        return Ok(depth.clone());
    }
    let scale = (1.0 / depth_map_factor) as f32;
    Ok(DepthImage::from_fn(depth.width(), depth.height(), |x, y| {
        Luma([depth.get_pixel(x, y).0[0] * scale])
    }))
}
