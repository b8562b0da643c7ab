//! Pinhole camera with radial-tangential distortion.

use nalgebra::{Matrix3, Vector2, Vector3};

/// Undistorted image extent used by the feature grid and frustum checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl ImageBounds {
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= self.min_x && u < self.max_x && v >= self.min_y && v < self.max_y
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Intrinsics plus stereo baseline.
///
/// `bf` is baseline times fx, the quantity stereo depth is derived from.
/// For RGB-D it is the virtual baseline used to synthesize a right
/// coordinate from depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub baseline: f64,
    /// k1, k2, p1, p2, k3
    pub distortion: [f64; 5],
}

impl CameraModel {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            baseline: 0.0,
            distortion: [0.0; 5],
        }
    }

    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_distortion(mut self, distortion: [f64; 5]) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn bf(&self) -> f64 {
        self.baseline * self.fx
    }

    pub fn k(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&d| d != 0.0)
    }

    /// Project a camera-frame point. Caller guarantees `p.z > 0`.
    #[inline]
    pub fn project(&self, p: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p.z;
        Vector2::new(self.fx * p.x * inv_z + self.cx, self.fy * p.y * inv_z + self.cy)
    }

    /// Back-project an undistorted pixel at depth `z` into the camera frame.
    #[inline]
    pub fn unproject(&self, u: f64, v: f64, z: f64) -> Vector3<f64> {
        Vector3::new((u - self.cx) * z / self.fx, (v - self.cy) * z / self.fy, z)
    }

    /// Apply the distortion model to an ideal pixel.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        let [k1, k2, p1, p2, k3] = self.distortion;
        let x = (u - self.cx) / self.fx;
        let y = (v - self.cy) / self.fy;
        let r2 = x * x + y * y;
        let radial = 1.0 + ((k3 * r2 + k2) * r2 + k1) * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
        (xd * self.fx + self.cx, yd * self.fy + self.cy)
    }

    /// Remove distortion from a pixel by fixed-point iteration.
    pub fn undistort_point(&self, u: f64, v: f64) -> (f64, f64) {
        if !self.has_distortion() {
            return (u, v);
        }
        let [k1, k2, p1, p2, k3] = self.distortion;
        let x0 = (u - self.cx) / self.fx;
        let y0 = (v - self.cy) / self.fy;
        let (mut x, mut y) = (x0, y0);
        for _ in 0..20 {
            let r2 = x * x + y * y;
            let icdist = 1.0 / (1.0 + ((k3 * r2 + k2) * r2 + k1) * r2);
            let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
            let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;
            x = (x0 - dx) * icdist;
            y = (y0 - dy) * icdist;
        }
        (x * self.fx + self.cx, y * self.fy + self.cy)
    }

    /// Bounds of the undistorted image for a `width` x `height` sensor.
    pub fn image_bounds(&self, width: u32, height: u32) -> ImageBounds {
        let (w, h) = (width as f64, height as f64);
        if !self.has_distortion() {
            return ImageBounds {
                min_x: 0.0,
                max_x: w,
                min_y: 0.0,
                max_y: h,
            };
        }
        let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .map(|(u, v)| self.undistort_point(u, v));
        ImageBounds {
            min_x: corners[0].0.min(corners[2].0),
            max_x: corners[1].0.max(corners[3].0),
            min_y: corners[0].1.min(corners[1].1),
            max_y: corners[2].1.max(corners[3].1),
        }
    }
}
