//! Tracking `Frame` representation.
//!
//! A `Frame` is what the Tracker operates on: undistorted keypoints and
//! their descriptors, optional per-keypoint stereo depth, a Bag-of-Words
//! vector and temporary associations to `MapPoint`s. Frames never enter the
//! map themselves; selected ones are promoted to KeyFrames.

use nalgebra::Vector3;

use crate::atlas::map::{KeyFrameId, MapPoint, MapPointId};
use crate::geometry::SE3;
use crate::tracking::frame::camera::{CameraModel, ImageBounds};
use crate::tracking::frame::features::{Descriptor, FeatureSet, KeyPoint, ScalePyramid};
use crate::tracking::frame::stereo::StereoDepth;
use crate::vocabulary::{BowVector, FeatureVector, OrbVocabulary};

/// Vocabulary level (counted up from the leaves) used to group features for
/// BoW-accelerated matching.
pub const BOW_LEVELS_UP: usize = 4;

/// Spatial grid for fast radius queries over undistorted keypoints.
///
/// Keypoints falling outside the image bounds after undistortion are not
/// indexed and can never be returned by an area query.
#[derive(Clone, Debug)]
pub struct FeatureGrid {
    /// Stored row-major: cell[row * GRID_COLS + col]
    cells: Vec<Vec<usize>>,
    grid_element_width_inv: f64,
    grid_element_height_inv: f64,
    min_x: f64,
    min_y: f64,
}

impl FeatureGrid {
    pub const GRID_COLS: usize = 64;
    pub const GRID_ROWS: usize = 48;

    pub fn new(keypoints: &[KeyPoint], bounds: &ImageBounds) -> Self {
        let grid_element_width_inv = Self::GRID_COLS as f64 / bounds.width();
        let grid_element_height_inv = Self::GRID_ROWS as f64 / bounds.height();

        let mut grid = Self {
            cells: vec![Vec::new(); Self::GRID_COLS * Self::GRID_ROWS],
            grid_element_width_inv,
            grid_element_height_inv,
            min_x: bounds.min_x,
            min_y: bounds.min_y,
        };

        for (idx, kp) in keypoints.iter().enumerate() {
            if let Some((cx, cy)) = grid.cell_of(kp) {
                grid.cells[cy * Self::GRID_COLS + cx].push(idx);
            }
        }
        grid
    }

    fn cell_of(&self, kp: &KeyPoint) -> Option<(usize, usize)> {
        let cx = ((kp.x - self.min_x) * self.grid_element_width_inv).round();
        let cy = ((kp.y - self.min_y) * self.grid_element_height_inv).round();
        if cx < 0.0 || cy < 0.0 || cx >= Self::GRID_COLS as f64 || cy >= Self::GRID_ROWS as f64 {
            return None;
        }
        Some((cx as usize, cy as usize))
    }

    /// Indices of keypoints inside the square of half-side `r` around
    /// `(x, y)`, optionally restricted to pyramid levels
    /// `[min_level, max_level]`.
    pub fn features_in_area(
        &self,
        keypoints: &[KeyPoint],
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        let mut indices = Vec::new();

        let min_cell_x = ((x - self.min_x - r) * self.grid_element_width_inv).floor();
        let max_cell_x = ((x - self.min_x + r) * self.grid_element_width_inv).ceil();
        let min_cell_y = ((y - self.min_y - r) * self.grid_element_height_inv).floor();
        let max_cell_y = ((y - self.min_y + r) * self.grid_element_height_inv).ceil();
        if min_cell_x >= Self::GRID_COLS as f64
            || max_cell_x < 0.0
            || min_cell_y >= Self::GRID_ROWS as f64
            || max_cell_y < 0.0
        {
            return indices;
        }

        let min_cell_x = min_cell_x.max(0.0) as usize;
        let max_cell_x = (max_cell_x as usize).min(Self::GRID_COLS - 1);
        let min_cell_y = min_cell_y.max(0.0) as usize;
        let max_cell_y = (max_cell_y as usize).min(Self::GRID_ROWS - 1);

        for cell_y in min_cell_y..=max_cell_y {
            for cell_x in min_cell_x..=max_cell_x {
                for &idx in &self.cells[cell_y * Self::GRID_COLS + cell_x] {
                    let kp = &keypoints[idx];
                    if min_level.is_some_and(|l| kp.octave < l)
                        || max_level.is_some_and(|l| kp.octave > l)
                    {
                        continue;
                    }
                    if (kp.x - x).abs() < r && (kp.y - y).abs() < r {
                        indices.push(idx);
                    }
                }
            }
        }

        indices
    }
}

/// Calibration shared by every frame of a sequence.
#[derive(Debug, Clone)]
pub struct FrameCalibration {
    pub camera: CameraModel,
    pub pyramid: ScalePyramid,
    /// Close/far depth threshold in metres.
    pub th_depth: f64,
    pub bounds: ImageBounds,
}

/// Where a map point lands in a frame, as computed by [`Frame::is_in_frustum`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrustumProjection {
    pub u: f64,
    pub v: f64,
    /// Predicted right-image coordinate for stereo matching.
    pub u_right: f64,
    pub level: i32,
    pub view_cos: f64,
}

/// A frame being tracked (not yet a KeyFrame).
#[derive(Clone, Debug)]
pub struct Frame {
    pub id: u64,
    /// Timestamp in seconds.
    pub timestamp: f64,
    /// Keypoints as detected, in distorted pixel coordinates.
    pub keypoints: Vec<KeyPoint>,
    /// Undistorted keypoints, used for every geometric computation.
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    /// Right-image coordinate per keypoint, negative when unknown.
    pub u_right: Vec<f64>,
    /// Depth per keypoint, negative when unknown.
    pub depth: Vec<f64>,
    /// map_points[i] = Some(mp) if feature i is associated.
    pub map_points: Vec<Option<MapPointId>>,
    /// Set by pose optimization for associations with a large residual.
    pub outliers: Vec<bool>,
    /// World-to-camera pose, unset until tracking assigns one.
    pub pose_cw: Option<SE3>,
    pub reference_kf: Option<KeyFrameId>,
    pub calib: FrameCalibration,
    pub bow: Option<BowVector>,
    pub feature_vector: Option<FeatureVector>,
    grid: FeatureGrid,
}

impl Frame {
    /// Build a frame from extracted features and optional stereo depth.
    pub fn new(
        id: u64,
        timestamp: f64,
        features: FeatureSet,
        stereo: Option<StereoDepth>,
        calib: &FrameCalibration,
    ) -> Self {
        let n = features.len();
        let keypoints_un: Vec<KeyPoint> = features
            .keypoints
            .iter()
            .map(|kp| {
                let (x, y) = calib.camera.undistort_point(kp.x, kp.y);
                KeyPoint { x, y, ..*kp }
            })
            .collect();
        let stereo = stereo.unwrap_or(StereoDepth {
            u_right: vec![-1.0; n],
            depth: vec![-1.0; n],
        });
        let grid = FeatureGrid::new(&keypoints_un, &calib.bounds);

        Self {
            id,
            timestamp,
            keypoints: features.keypoints,
            keypoints_un,
            descriptors: features.descriptors,
            u_right: stereo.u_right,
            depth: stereo.depth,
            map_points: vec![None; n],
            outliers: vec![false; n],
            pose_cw: None,
            reference_kf: None,
            calib: calib.clone(),
            bow: None,
            feature_vector: None,
            grid,
        }
    }

    pub fn num_features(&self) -> usize {
        self.keypoints_un.len()
    }

    pub fn camera(&self) -> &CameraModel {
        &self.calib.camera
    }

    pub fn pyramid(&self) -> &ScalePyramid {
        &self.calib.pyramid
    }

    pub fn set_pose(&mut self, pose_cw: SE3) {
        self.pose_cw = Some(pose_cw);
    }

    /// Camera center in world coordinates.
    pub fn camera_center(&self) -> Option<Vector3<f64>> {
        self.pose_cw.map(|p| p.camera_center())
    }

    /// Whether keypoint `i` carries a right-image coordinate.
    #[inline]
    pub fn has_stereo(&self, i: usize) -> bool {
        self.u_right[i] >= 0.0
    }

    pub fn features_in_area(
        &self,
        x: f64,
        y: f64,
        r: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        self.grid
            .features_in_area(&self.keypoints_un, x, y, r, min_level, max_level)
    }

    /// Project a map point and check it can be observed from this frame.
    ///
    /// Rejects points behind the camera, outside the image, beyond the
    /// scale-invariance distance range, or viewed at an angle whose cosine
    /// to the point's mean viewing direction is below `view_cos_limit`.
    pub fn is_in_frustum(&self, mp: &MapPoint, view_cos_limit: f64) -> Option<FrustumProjection> {
        let pose = self.pose_cw?;
        let pc = pose.transform_point(&mp.position);
        if pc.z < 0.0 {
            return None;
        }

        let cam = &self.calib.camera;
        let uv = cam.project(&pc);
        let b = &self.calib.bounds;
        if uv.x < b.min_x || uv.x > b.max_x || uv.y < b.min_y || uv.y > b.max_y {
            return None;
        }

        let po = mp.position - pose.camera_center();
        let dist = po.norm();
        if dist < mp.min_distance_invariance() || dist > mp.max_distance_invariance() {
            return None;
        }

        let view_cos = po.dot(&mp.normal) / dist;
        if view_cos < view_cos_limit {
            return None;
        }

        Some(FrustumProjection {
            u: uv.x,
            v: uv.y,
            u_right: uv.x - cam.bf() / pc.z,
            level: mp.predict_scale(dist, &self.calib.pyramid),
            view_cos,
        })
    }

    /// Back-project keypoint `i` to world coordinates using its depth.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(i)?;
        if z <= 0.0 {
            return None;
        }
        let pose = self.pose_cw?;
        let kp = &self.keypoints_un[i];
        let pc = self.calib.camera.unproject(kp.x, kp.y, z);
        Some(pose.inverse().transform_point(&pc))
    }

    /// Compute the BoW vector once. Later calls are no-ops.
    pub fn compute_bow(&mut self, vocabulary: &OrbVocabulary) {
        if self.bow.is_some() {
            return;
        }
        let (bow, fv) = vocabulary.transform(&self.descriptors, BOW_LEVELS_UP);
        self.bow = Some(bow);
        self.feature_vector = Some(fv);
    }

    /// Drop every association and outlier flag.
    pub fn clear_map_points(&mut self) {
        self.map_points.iter_mut().for_each(|m| *m = None);
        self.outliers.iter_mut().for_each(|o| *o = false);
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.iter().filter(|m| m.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn calib() -> FrameCalibration {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0).with_baseline(0.1);
        FrameCalibration {
            bounds: camera.image_bounds(640, 480),
            camera,
            pyramid: ScalePyramid::new(8, 1.2),
            th_depth: 4.0,
        }
    }

    fn frame_with(keypoints: Vec<KeyPoint>) -> Frame {
        let descriptors = vec![[0u8; 32]; keypoints.len()];
        Frame::new(
            0,
            0.0,
            FeatureSet {
                keypoints,
                descriptors,
            },
            None,
            &calib(),
        )
    }

    #[test]
    fn test_grid_area_query() {
        let f = frame_with(vec![
            KeyPoint::new(100.0, 100.0, 0),
            KeyPoint::new(103.0, 98.0, 2),
            KeyPoint::new(300.0, 300.0, 0),
            KeyPoint::new(-5.0, 10.0, 0),
        ]);
        let mut found = f.features_in_area(101.0, 99.0, 5.0, None, None);
        found.sort();
        assert_eq!(found, vec![0, 1]);
        assert_eq!(f.features_in_area(101.0, 99.0, 5.0, Some(1), None), vec![1]);
        assert_eq!(f.features_in_area(101.0, 99.0, 5.0, None, Some(0)), vec![0]);
        // Outside the image bounds, never indexed
        assert!(f.features_in_area(-5.0, 10.0, 3.0, None, None).is_empty());
    }

    #[test]
    fn test_frustum_check() {
        let mut f = frame_with(vec![]);
        f.set_pose(SE3::identity());
        let mut mp = MapPoint::new(
            MapPointId::new(0),
            Vector3::new(0.0, 0.0, 5.0),
            [0u8; 32],
            KeyFrameId::new(0),
        );
        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.min_distance = 1.0;
        mp.max_distance = 10.0;

        let proj = f.is_in_frustum(&mp, 0.5).unwrap();
        assert_relative_eq!(proj.u, 320.0, epsilon = 1e-9);
        assert_relative_eq!(proj.u_right, 320.0 - 50.0 / 5.0, epsilon = 1e-9);

        // Seen from behind its mean viewing direction
        mp.normal = Vector3::new(0.0, 0.0, -1.0);
        assert!(f.is_in_frustum(&mp, 0.5).is_none());

        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.position = Vector3::new(0.0, 0.0, -5.0);
        assert!(f.is_in_frustum(&mp, 0.5).is_none());
    }

    #[test]
    fn test_unproject_stereo() {
        let mut f = frame_with(vec![KeyPoint::new(420.0, 240.0, 0)]);
        f.depth[0] = 2.0;
        f.set_pose(SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, -1.0)));
        let pw = f.unproject_stereo(0).unwrap();
        assert_relative_eq!(pw, Vector3::new(0.4, 0.0, 3.0), epsilon = 1e-9);
    }
}
