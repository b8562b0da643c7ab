//! ORB keypoints, binary descriptors and the scale pyramid.

use anyhow::Result;
use image::GrayImage;

/// 256-bit ORB descriptor.
pub type Descriptor = [u8; 32];

/// Hamming distance between two ORB descriptors.
#[inline]
pub fn descriptor_distance(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f64,
    pub y: f64,
    /// Orientation in degrees, [0, 360).
    pub angle: f64,
    /// Pyramid level the keypoint was detected at.
    pub octave: i32,
    pub response: f64,
}

impl KeyPoint {
    pub fn new(x: f64, y: f64, octave: i32) -> Self {
        Self {
            x,
            y,
            angle: 0.0,
            octave,
            response: 0.0,
        }
    }

    pub fn with_angle(mut self, angle: f64) -> Self {
        self.angle = angle;
        self
    }
}

/// Keypoints and their descriptors, index aligned.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub keypoints: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }
}

/// Per-level scale factors and variances of the extractor pyramid.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    pub n_levels: usize,
    pub scale_factor: f64,
    pub log_scale_factor: f64,
    pub scale_factors: Vec<f64>,
    pub inv_scale_factors: Vec<f64>,
    pub level_sigma2: Vec<f64>,
    pub inv_level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: usize, scale_factor: f64) -> Self {
        let n_levels = n_levels.max(1);
        let scale_factors: Vec<f64> = (0..n_levels)
            .map(|i| scale_factor.powi(i as i32))
            .collect();
        let level_sigma2: Vec<f64> = scale_factors.iter().map(|s| s * s).collect();
        Self {
            n_levels,
            scale_factor,
            log_scale_factor: scale_factor.ln(),
            inv_scale_factors: scale_factors.iter().map(|s| 1.0 / s).collect(),
            inv_level_sigma2: level_sigma2.iter().map(|s| 1.0 / s).collect(),
            scale_factors,
            level_sigma2,
        }
    }

    /// Clamp an octave coming from an extractor to a valid level index.
    #[inline]
    pub fn level(&self, octave: i32) -> usize {
        (octave.max(0) as usize).min(self.n_levels - 1)
    }

    pub fn max_scale(&self) -> f64 {
        self.scale_factors[self.n_levels - 1]
    }
}

/// Source of ORB features for one image.
///
/// Tracking owns two extractors for stereo (left and right) and a third,
/// denser one used only while a monocular map is being initialized.
pub trait FeatureExtractor: Send {
    fn extract(&mut self, image: &GrayImage) -> Result<FeatureSet>;

    fn pyramid(&self) -> &ScalePyramid;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_descriptor_distance() {
        let a = [0u8; 32];
        let mut b = [0u8; 32];
        assert_eq!(descriptor_distance(&a, &b), 0);
        b[0] = 0b1011;
        b[31] = 0xff;
        assert_eq!(descriptor_distance(&a, &b), 11);
        assert_eq!(descriptor_distance(&a, &[0xff; 32]), 256);
    }

    #[test]
    fn test_scale_pyramid() {
        let p = ScalePyramid::new(8, 1.2);
        assert_eq!(p.scale_factors.len(), 8);
        assert_relative_eq!(p.scale_factors[2], 1.44, epsilon = 1e-12);
        assert_relative_eq!(p.level_sigma2[1], 1.44, epsilon = 1e-12);
        assert_relative_eq!(p.inv_level_sigma2[1] * p.level_sigma2[1], 1.0, epsilon = 1e-12);
        assert_eq!(p.level(12), 7);
        assert_eq!(p.level(-1), 0);
    }
}
