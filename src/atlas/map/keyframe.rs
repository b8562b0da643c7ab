//! KeyFrame - A selected frame with map structure relationships.
//!
//! KeyFrames are the nodes of the map graph. They keep the feature data of
//! the frame they were promoted from, a world-to-camera pose, and two graph
//! structures over other KeyFrames:
//! - the covisibility graph, edges weighted by shared MapPoint count;
//! - the spanning tree, each KeyFrame hanging off its strongest covisible.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{Descriptor, KeyPoint};
use crate::tracking::tracking_frame::{Frame, FrameCalibration};
use crate::vocabulary::{BowVector, FeatureVector};

use super::types::{KeyFrameId, MapPointId};

#[derive(Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,

    /// Id of the frame this KeyFrame was created from.
    pub frame_id: u64,

    /// Timestamp in seconds.
    pub timestamp: f64,

    /// Pose: transform from world to camera (T_cw).
    pose_cw: SE3,

    // ─────────────────────────────────────────────────────────────────────────
    // Visual Features
    // ─────────────────────────────────────────────────────────────────────────
    pub keypoints: Vec<KeyPoint>,
    pub keypoints_un: Vec<KeyPoint>,
    pub descriptors: Vec<Descriptor>,
    pub u_right: Vec<f64>,
    pub depth: Vec<f64>,
    pub calib: FrameCalibration,

    pub bow_vector: Option<BowVector>,

    /// Groups feature indices by vocabulary node for BoW matching.
    pub feature_vector: Option<FeatureVector>,

    // ─────────────────────────────────────────────────────────────────────────
    // Map Associations
    // ─────────────────────────────────────────────────────────────────────────
    /// If map_point_ids[i] = Some(mp_id), feature i is associated with mp_id.
    pub map_point_ids: Vec<Option<MapPointId>>,

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────
    /// Connected KeyFrame → number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Connections sorted by descending weight, ties by ascending id.
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────
    /// None for the root KeyFrame (the first in the map).
    pub parent_id: Option<KeyFrameId>,
    pub children_ids: HashSet<KeyFrameId>,
}

impl KeyFrame {
    /// Promote a tracked frame. The frame must carry a pose.
    pub fn from_frame(id: KeyFrameId, frame: &Frame) -> Self {
        Self {
            id,
            frame_id: frame.id,
            timestamp: frame.timestamp,
            pose_cw: frame.pose_cw.unwrap_or_default(),
            keypoints: frame.keypoints.clone(),
            keypoints_un: frame.keypoints_un.clone(),
            descriptors: frame.descriptors.clone(),
            u_right: frame.u_right.clone(),
            depth: frame.depth.clone(),
            calib: frame.calib.clone(),
            bow_vector: frame.bow.clone(),
            feature_vector: frame.feature_vector.clone(),
            map_point_ids: vec![None; frame.num_features()],
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            parent_id: None,
            children_ids: HashSet::new(),
        }
    }

    pub fn pose(&self) -> SE3 {
        self.pose_cw
    }

    pub fn set_pose(&mut self, pose_cw: SE3) {
        self.pose_cw = pose_cw;
    }

    /// Camera-to-world transform.
    pub fn pose_wc(&self) -> SE3 {
        self.pose_cw.inverse()
    }

    /// Camera position in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose_cw.camera_center()
    }

    pub fn num_features(&self) -> usize {
        self.keypoints_un.len()
    }

    /// Observation weight of feature `idx`: stereo observations count twice.
    pub fn observation_weight(&self, idx: usize) -> usize {
        if self.u_right.get(idx).is_some_and(|&u| u >= 0.0) {
            2
        } else {
            1
        }
    }

    /// Back-project feature `i` to world coordinates using its depth.
    pub fn unproject_stereo(&self, i: usize) -> Option<Vector3<f64>> {
        let z = *self.depth.get(i)?;
        if z <= 0.0 {
            return None;
        }
        let kp = &self.keypoints_un[i];
        let pc = self.calib.camera.unproject(kp.x, kp.y, z);
        Some(self.pose_wc().transform_point(&pc))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn get_map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get(feature_idx).copied().flatten()
    }

    /// Returns the previous MapPoint ID if there was one.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let slot = self.map_point_ids.get_mut(feature_idx)?;
        slot.replace(mp_id)
    }

    pub fn erase_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_point_ids.get_mut(feature_idx)?.take()
    }

    /// All associated MapPoint IDs with their feature indices.
    pub fn map_point_indices(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_ids
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_point_ids.iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    pub fn add_connection(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        if self.covisibility_weights.insert(kf_id, weight) != Some(weight) {
            self.sort_covisibles();
        }
    }

    /// Replace every connection at once.
    pub fn set_connections(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
        self.sort_covisibles();
    }

    pub fn erase_connection(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.sort_covisibles();
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// All covisible KeyFrames, strongest first.
    pub fn covisibles(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.ordered_covisibles.iter().map(|(id, _)| *id)
    }

    /// The N best covisible KeyFrames (most shared points first).
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        self.covisibles().take(n).collect()
    }

    /// Covisible KeyFrames with at least `min_weight` shared points.
    pub fn covisibles_by_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    fn sort_covisibles(&mut self) {
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent_id = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children_ids.remove(&child_id);
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("frame_id", &self.frame_id)
            .field("num_features", &self.num_features())
            .field("num_map_points", &self.num_map_points())
            .field("covisibles", &self.covisibility_weights.len())
            .field("parent", &self.parent_id)
            .field("num_children", &self.children_ids.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::{CameraModel, FeatureSet, ScalePyramid};

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let calib = FrameCalibration {
            bounds: camera.image_bounds(640, 480),
            camera,
            pyramid: ScalePyramid::new(8, 1.2),
            th_depth: 3.0,
        };
        let features = FeatureSet {
            keypoints: (0..num_features)
                .map(|i| KeyPoint::new(10.0 * i as f64, 20.0, 0))
                .collect(),
            descriptors: vec![[0u8; 32]; num_features],
        };
        let mut frame = Frame::new(id, id as f64, features, None, &calib);
        frame.set_pose(SE3::identity());
        KeyFrame::from_frame(KeyFrameId::new(id), &frame)
    }

    #[test]
    fn test_map_point_association() {
        let mut kf = create_keyframe_with_features(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.get_map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.get_map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        assert_eq!(kf.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(kf.get_map_point(3), None);
        assert_eq!(kf.set_map_point(99, MapPointId::new(1)), None);
    }

    #[test]
    fn test_covisibility_graph() {
        let mut kf = create_keyframe_with_features(1, 0);

        kf.add_connection(KeyFrameId::new(2), 50);
        kf.add_connection(KeyFrameId::new(3), 100);
        kf.add_connection(KeyFrameId::new(4), 25);
        kf.add_connection(KeyFrameId::new(1), 500);

        assert_eq!(kf.covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(1)), 0);
        assert_eq!(
            kf.best_covisibles(2),
            vec![KeyFrameId::new(3), KeyFrameId::new(2)]
        );
        assert_eq!(kf.covisibles_by_weight(30).len(), 2);

        kf.erase_connection(KeyFrameId::new(3));
        assert_eq!(kf.best_covisibles(1), vec![KeyFrameId::new(2)]);
    }

    #[test]
    fn test_observation_weight() {
        let mut kf = create_keyframe_with_features(1, 2);
        kf.u_right[1] = 12.0;
        assert_eq!(kf.observation_weight(0), 1);
        assert_eq!(kf.observation_weight(1), 2);
    }
}
