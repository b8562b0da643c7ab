//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the arena that owns the SLAM graph. Everything else refers to
//! its entities by id, and an id whose entity was erased simply resolves to
//! `None`. It provides:
//! - creation and removal of KeyFrames and MapPoints;
//! - bidirectional associations (KF ↔ MP);
//! - covisibility and spanning-tree maintenance;
//! - point replacement with forwarding for stale references;
//! - tombstones so poses of erased KeyFrames stay reconstructible.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::tracking::frame::{descriptor_distance, Descriptor};
use crate::tracking::tracking_frame::Frame;

use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Minimum shared points for a covisibility edge.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// What is left of an erased KeyFrame: where it hung in the spanning tree
/// and its pose relative to that parent (T_cp).
#[derive(Debug, Clone, Copy)]
pub struct Tombstone {
    pub parent: Option<KeyFrameId>,
    pub relative_pose: SE3,
}

/// The SLAM map containing KeyFrames and MapPoints.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    next_kf_id: u64,
    next_mp_id: u64,

    tombstones: HashMap<KeyFrameId, Tombstone>,

    /// Erased point → point that absorbed its observations.
    replaced: HashMap<MapPointId, MapPointId>,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            next_kf_id: 0,
            next_mp_id: 0,
            tombstones: HashMap::new(),
            replaced: HashMap::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Promote a frame to a KeyFrame. Associations are not copied; callers
    /// add them with [`Map::associate`].
    pub fn insert_keyframe(&mut self, frame: &Frame) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes.insert(id, KeyFrame::from_frame(id, frame));
        id
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    /// Highest KeyFrame id handed out so far.
    pub fn max_keyframe_id(&self) -> Option<KeyFrameId> {
        self.next_kf_id.checked_sub(1).map(KeyFrameId::new)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    pub fn create_map_point(
        &mut self,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_kf: KeyFrameId,
    ) -> MapPointId {
        let id = self.next_map_point_id();
        self.map_points
            .insert(id, MapPoint::new(id, position, descriptor, ref_kf));
        id
    }

    /// Create a point backed by a frame observation only.
    ///
    /// Its normal and distance range are derived from the frame, since no
    /// keyframe will ever observe it.
    pub fn create_temporal_point(&mut self, position: Vector3<f64>, frame: &Frame, idx: usize) -> MapPointId {
        let id = self.next_map_point_id();
        let center = frame.camera_center().unwrap_or_else(Vector3::zeros);
        let po = position - center;
        let dist = po.norm();
        let normal = if dist > 0.0 { po / dist } else { Vector3::zeros() };
        let pyramid = frame.pyramid();
        let level = pyramid.level(frame.keypoints_un[idx].octave);
        let max_distance = dist * pyramid.scale_factors[level];
        let min_distance = max_distance / pyramid.max_scale();
        self.map_points.insert(
            id,
            MapPoint::new_temporal(
                id,
                position,
                frame.descriptors[idx],
                normal,
                (min_distance, max_distance),
            ),
        );
        id
    }

    fn next_map_point_id(&mut self) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        id
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    /// Resolve a possibly stale id: live points resolve to themselves,
    /// replaced points to their (transitive) replacement, erased ones to None.
    pub fn resolve(&self, mut id: MapPointId) -> Option<MapPointId> {
        for _ in 0..=self.replaced.len() {
            if self.map_points.contains_key(&id) {
                return Some(id);
            }
            id = *self.replaced.get(&id)?;
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Association (KF ↔ MP)
    // ─────────────────────────────────────────────────────────────────────────

    /// Link a KeyFrame feature and a MapPoint in both directions.
    ///
    /// Covisibility is not touched; call [`Map::update_connections`] once
    /// all associations of a KeyFrame are in place.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let Some(kf) = self.keyframes.get_mut(&kf_id) else {
            return false;
        };
        if feature_idx >= kf.num_features() || !self.map_points.contains_key(&mp_id) {
            return false;
        }
        kf.set_map_point(feature_idx, mp_id);
        let weight = kf.observation_weight(feature_idx);
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx, weight);
        }
        true
    }

    /// Remove the association of a KeyFrame feature, returning the MapPoint
    /// it pointed at.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let kf = self.keyframes.get_mut(&kf_id)?;
        let mp_id = kf.erase_map_point(feature_idx)?;
        let weight = kf.observation_weight(feature_idx);
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id, weight);
        }
        Some(mp_id)
    }

    /// Recompute the covisibility edges of a KeyFrame from its MapPoints.
    ///
    /// Edges need [`COVISIBILITY_THRESHOLD`] shared points; when none
    /// qualifies the single strongest edge is kept. Counterpart KeyFrames are
    /// updated symmetrically. A KeyFrame without a parent (other than the
    /// first one) gets its strongest neighbour as spanning-tree parent.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.map_point_indices() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            for &other in mp.observations.keys() {
                if other != kf_id {
                    *counter.entry(other).or_insert(0) += 1;
                }
            }
        }

        let Some((&best_id, &best_w)) = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
        else {
            return;
        };

        let mut weights: HashMap<KeyFrameId, usize> = counter
            .into_iter()
            .filter(|(_, w)| *w >= COVISIBILITY_THRESHOLD)
            .collect();
        if weights.is_empty() {
            weights.insert(best_id, best_w);
        }

        for (&other, &w) in &weights {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.add_connection(kf_id, w);
            }
        }

        let parent = {
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                return;
            };
            kf.set_connections(weights);
            if kf.parent_id.is_some() || kf_id.0 == 0 {
                return;
            }
            let Some(parent) = kf.best_covisibles(1).first().copied() else {
                return;
            };
            kf.set_parent(parent);
            parent
        };
        if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
            parent_kf.add_child(kf_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Removal and Replacement
    // ─────────────────────────────────────────────────────────────────────────

    /// Fully remove a MapPoint, cleaning up all associations.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.remove(&mp_id) else {
            return;
        };
        for (kf_id, feat_idx) in mp.observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.get_map_point(feat_idx) == Some(mp_id) {
                    kf.erase_map_point(feat_idx);
                }
            }
        }
    }

    /// Merge `old` into `new`: observations move over (or are dropped when
    /// the KeyFrame already sees `new`), counters are summed, and `old` is
    /// erased with a forward link so stale ids resolve to `new`.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let Some(old_mp) = self.map_points.remove(&old) else {
            return;
        };

        for (&kf_id, &idx) in &old_mp.observations {
            let already_seen = self
                .map_points
                .get(&new)
                .is_some_and(|mp| mp.observations.contains_key(&kf_id));
            let Some(kf) = self.keyframes.get_mut(&kf_id) else {
                continue;
            };
            if already_seen {
                kf.erase_map_point(idx);
            } else {
                kf.set_map_point(idx, new);
                let weight = kf.observation_weight(idx);
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, idx, weight);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&new) {
            mp.increase_visible(old_mp.visible_count);
            mp.increase_found(old_mp.found_count);
        }
        self.replaced.insert(old, new);
        self.compute_distinctive_descriptor(new);
    }

    /// Fully remove a KeyFrame, cleaning up associations and graph edges and
    /// leaving a tombstone. The first KeyFrame of the map is never erased.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) {
        if kf_id.0 == 0 {
            return;
        }
        let Some(kf) = self.keyframes.remove(&kf_id) else {
            return;
        };

        let mut degenerate = Vec::new();
        for (idx, mp_id) in kf.map_point_indices() {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id, kf.observation_weight(idx));
                if mp.num_observations() <= 2 {
                    degenerate.push(mp_id);
                }
            }
        }
        for mp_id in degenerate {
            self.erase_map_point(mp_id);
        }

        for other in kf.covisibles() {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_connection(kf_id);
            }
        }

        // Children move up to the grandparent
        if let Some(parent) = kf.parent_id {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                parent_kf.erase_child(kf_id);
                parent_kf.children_ids.extend(kf.children_ids.iter().copied());
            }
            for child_id in &kf.children_ids {
                if let Some(child_kf) = self.keyframes.get_mut(child_id) {
                    child_kf.set_parent(parent);
                }
            }
        }

        let relative_pose = kf
            .parent_id
            .and_then(|p| self.keyframe_pose(p))
            .map(|parent_pose| kf.pose() * parent_pose.inverse())
            .unwrap_or_else(|| kf.pose());
        self.tombstones.insert(
            kf_id,
            Tombstone {
                parent: kf.parent_id,
                relative_pose,
            },
        );
    }

    /// World-to-camera pose of a KeyFrame, following tombstones for erased
    /// ones. None only for ids this map never issued.
    pub fn keyframe_pose(&self, kf_id: KeyFrameId) -> Option<SE3> {
        let mut rel = SE3::identity();
        let mut id = kf_id;
        for _ in 0..=self.tombstones.len() {
            if let Some(kf) = self.keyframes.get(&id) {
                return Some(rel * kf.pose());
            }
            let tomb = self.tombstones.get(&id)?;
            rel = rel * tomb.relative_pose;
            match tomb.parent {
                Some(parent) => id = parent,
                None => return Some(rel),
            }
        }
        None
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute the mean viewing direction and the scale-invariance range.
    ///
    /// The range comes from the reference KeyFrame: the distance at which it
    /// observes the point, scaled by the octave of that observation.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let Some(ref_kf) = mp.ref_kf.and_then(|id| self.keyframes.get(&id)) else {
            return;
        };
        let Some(ref_idx) = mp.index_in_keyframe(ref_kf.id) else {
            return;
        };

        let mut normal = Vector3::zeros();
        let mut n = 0usize;
        for kf_id in mp.observations.keys() {
            if let Some(kf) = self.keyframes.get(kf_id) {
                let dir = mp.position - kf.camera_center();
                let norm = dir.norm();
                if norm > 0.0 {
                    normal += dir / norm;
                    n += 1;
                }
            }
        }

        let dist = (mp.position - ref_kf.camera_center()).norm();
        let pyramid = &ref_kf.calib.pyramid;
        let level = pyramid.level(ref_kf.keypoints_un[ref_idx].octave);
        let max_distance = dist * pyramid.scale_factors[level];
        let min_distance = max_distance / pyramid.max_scale();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if n > 0 {
                mp.normal = normal / n as f64;
            }
            mp.max_distance = max_distance;
            mp.min_distance = min_distance;
        }
    }

    /// Pick the observed descriptor with the least median distance to the
    /// other observations.
    pub fn compute_distinctive_descriptor(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let mut obs: Vec<(KeyFrameId, usize)> =
            mp.observations.iter().map(|(k, i)| (*k, *i)).collect();
        obs.sort();
        let descriptors: Vec<Descriptor> = obs
            .iter()
            .filter_map(|(kf_id, idx)| {
                self.keyframes.get(kf_id)?.descriptors.get(*idx).copied()
            })
            .collect();
        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let mut best = (u32::MAX, 0usize);
        for i in 0..n {
            let mut dists: Vec<u32> = (0..n)
                .map(|j| descriptor_distance(&descriptors[i], &descriptors[j]))
                .collect();
            dists.sort_unstable();
            let median = dists[(n - 1) / 2];
            if median < best.0 {
                best = (median, i);
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best.1];
        }
    }

    /// Depth of the KeyFrame's points at quantile `1/q` (q = 2 is the median).
    pub fn scene_median_depth(&self, kf_id: KeyFrameId, q: usize) -> Option<f64> {
        let kf = self.keyframes.get(&kf_id)?;
        let pose = kf.pose();
        let mut depths: Vec<f64> = kf
            .map_point_indices()
            .filter_map(|(_, id)| self.map_points.get(&id))
            .map(|mp| pose.transform_point(&mp.position).z)
            .collect();
        if depths.is_empty() {
            return None;
        }
        depths.sort_by(|a, b| a.total_cmp(b));
        Some(depths[(depths.len() - 1) / q.max(1)])
    }

    /// Points of a KeyFrame with at least `min_obs` observations.
    pub fn tracked_map_points(&self, kf_id: KeyFrameId, min_obs: usize) -> usize {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return 0;
        };
        kf.map_point_indices()
            .filter_map(|(_, id)| self.map_points.get(&id))
            .filter(|mp| mp.num_observations() >= min_obs)
            .count()
    }

    /// Empty the map and restart the id counters.
    pub fn clear(&mut self) {
        self.keyframes.clear();
        self.map_points.clear();
        self.tombstones.clear();
        self.replaced.clear();
        self.next_kf_id = 0;
        self.next_mp_id = 0;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("num_keyframes", &self.keyframes.len())
            .field("num_map_points", &self.map_points.len())
            .field("num_tombstones", &self.tombstones.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::frame::{CameraModel, FeatureSet, KeyPoint, ScalePyramid};
    use crate::tracking::tracking_frame::FrameCalibration;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn frame(id: u64, n: usize, pose: SE3) -> Frame {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let calib = FrameCalibration {
            bounds: camera.image_bounds(640, 480),
            camera,
            pyramid: ScalePyramid::new(8, 1.2),
            th_depth: 3.0,
        };
        let features = FeatureSet {
            keypoints: (0..n)
                .map(|i| KeyPoint::new(5.0 + i as f64, 20.0, (i % 3) as i32))
                .collect(),
            descriptors: (0..n).map(|i| [i as u8; 32]).collect(),
        };
        let mut f = Frame::new(id, id as f64, features, None, &calib);
        f.set_pose(pose);
        f
    }

    fn keyframe(map: &mut Map, n: usize) -> KeyFrameId {
        let f = frame(map.num_keyframes() as u64, n, SE3::identity());
        map.insert_keyframe(&f)
    }

    /// Two keyframes sharing `shared` points.
    fn connected_pair(shared: usize) -> (Map, KeyFrameId, KeyFrameId) {
        let mut map = Map::new();
        let kf1 = keyframe(&mut map, 40);
        let kf2 = keyframe(&mut map, 40);
        for i in 0..shared {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf1);
            assert!(map.associate(kf1, i, mp));
            assert!(map.associate(kf2, i, mp));
        }
        map.update_connections(kf1);
        map.update_connections(kf2);
        (map, kf1, kf2)
    }

    #[test]
    fn test_associate_and_connections_are_symmetric() {
        let (map, kf1, kf2) = connected_pair(20);
        let a = map.get_keyframe(kf1).unwrap();
        let b = map.get_keyframe(kf2).unwrap();
        assert_eq!(a.covisibility_weight(kf2), 20);
        assert_eq!(b.covisibility_weight(kf1), 20);
        // First keyframe stays root, the second hangs off it
        assert_eq!(a.parent_id, None);
        assert_eq!(b.parent_id, Some(kf1));
        assert!(a.children_ids.contains(&kf2));
    }

    #[test]
    fn test_weak_connection_falls_back_to_best() {
        let (map, kf1, kf2) = connected_pair(3);
        assert_eq!(map.get_keyframe(kf2).unwrap().covisibility_weight(kf1), 3);
    }

    #[test]
    fn test_erase_map_point_invalidates_references() {
        let (mut map, kf1, kf2) = connected_pair(5);
        let mp = map.get_keyframe(kf1).unwrap().get_map_point(0).unwrap();
        map.erase_map_point(mp);
        assert!(map.get_map_point(mp).is_none());
        assert_eq!(map.resolve(mp), None);
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(0), None);
        assert_eq!(map.get_keyframe(kf2).unwrap().get_map_point(0), None);
    }

    #[test]
    fn test_replace_forwards_ids() {
        let mut map = Map::new();
        let kf1 = keyframe(&mut map, 10);
        let kf2 = keyframe(&mut map, 10);
        let old = map.create_map_point(Vector3::zeros(), [1u8; 32], kf1);
        let new = map.create_map_point(Vector3::zeros(), [2u8; 32], kf2);
        map.associate(kf1, 0, old);
        map.associate(kf2, 1, new);

        map.replace_map_point(old, new);

        assert_eq!(map.resolve(old), Some(new));
        assert_eq!(map.get_keyframe(kf1).unwrap().get_map_point(0), Some(new));
        let mp = map.get_map_point(new).unwrap();
        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.visible_count, 2);
    }

    #[test]
    fn test_erased_keyframe_pose_from_tombstone() {
        let mut map = Map::new();
        let f0 = frame(0, 30, SE3::identity());
        let pose1 = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            Vector3::new(0.3, 0.0, 0.1),
        );
        let f1 = frame(1, 30, pose1);
        let kf0 = map.insert_keyframe(&f0);
        let kf1 = map.insert_keyframe(&f1);
        for i in 0..20 {
            let mp = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf0);
            map.associate(kf0, i, mp);
            map.associate(kf1, i, mp);
        }
        map.update_connections(kf1);

        map.erase_keyframe(kf1);
        assert!(map.get_keyframe(kf1).is_none());
        let pose = map.keyframe_pose(kf1).unwrap();
        assert_relative_eq!(pose.translation, pose1.translation, epsilon = 1e-12);
        // Points seen by only two keyframes drop with one of them
        assert_eq!(map.num_map_points(), 0);

        // The first keyframe is never erased
        map.erase_keyframe(kf0);
        assert!(map.get_keyframe(kf0).is_some());
    }

    #[test]
    fn test_normal_depth_and_median() {
        let mut map = Map::new();
        let kf = keyframe(&mut map, 10);
        // Keypoint 2 sits at octave 2
        let mp = map.create_map_point(Vector3::new(0.0, 0.0, 4.0), [0u8; 32], kf);
        map.associate(kf, 2, mp);
        map.update_normal_and_depth(mp);
        let p = map.get_map_point(mp).unwrap();
        assert_relative_eq!(p.normal, Vector3::z(), epsilon = 1e-12);
        assert_relative_eq!(p.max_distance, 4.0 * 1.44, epsilon = 1e-9);
        assert_relative_eq!(p.min_distance, 4.0 * 1.44 / 1.2f64.powi(7), epsilon = 1e-9);

        let mp2 = map.create_map_point(Vector3::new(0.0, 0.0, 2.0), [0u8; 32], kf);
        map.associate(kf, 3, mp2);
        assert_eq!(map.scene_median_depth(kf, 2), Some(2.0));
        assert_eq!(map.tracked_map_points(kf, 1), 2);
        assert_eq!(map.tracked_map_points(kf, 2), 0);
    }

    #[test]
    fn test_distinctive_descriptor() {
        let mut map = Map::new();
        let kfs: Vec<_> = (0..3).map(|_| keyframe(&mut map, 5)).collect();
        let mp = map.create_map_point(Vector3::zeros(), [9u8; 32], kfs[0]);
        // Descriptors of features 0, 1, 4 are [0;32], [1;32], [4;32]
        map.associate(kfs[0], 0, mp);
        map.associate(kfs[1], 1, mp);
        map.associate(kfs[2], 4, mp);
        map.compute_distinctive_descriptor(mp);
        assert_eq!(map.get_map_point(mp).unwrap().descriptor, [0u8; 32]);
    }

    #[test]
    fn test_clear_restarts_ids() {
        let (mut map, _, _) = connected_pair(2);
        map.clear();
        assert_eq!(map.num_keyframes(), 0);
        assert_eq!(map.max_keyframe_id(), None);
        assert_eq!(keyframe(&mut map, 1), KeyFrameId::new(0));
    }
}
