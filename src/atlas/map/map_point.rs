//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! MapPoints track which KeyFrames observe them, keep the visibility
//! counters tracking feeds, and store the viewing-geometry constraints used
//! to predict at which pyramid level they should be re-detected.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::tracking::frame::{Descriptor, ScalePyramid};

use super::types::{KeyFrameId, MapPointId};

/// A 3D map point (landmark) observed by one or more KeyFrames.
#[derive(Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// 3D position in world frame.
    pub position: Vector3<f64>,

    /// Representative descriptor: the observation with the least median
    /// distance to all the others.
    pub descriptor: Descriptor,

    /// observation[kf_id] = feature_idx means keyframe kf_id sees this point
    /// at feature_idx.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Observation count where stereo observations weigh two.
    num_obs: usize,

    /// Mean viewing direction (unit vector, world frame).
    pub normal: Vector3<f64>,

    /// Scale-invariance distance range.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Frames where the point was inside the frustum.
    pub visible_count: u32,

    /// Frames where the point was matched and survived pose optimization.
    pub found_count: u32,

    /// KeyFrame the distance range is derived from. None for the
    /// temporary points created for visual odometry.
    pub ref_kf: Option<KeyFrameId>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        ref_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            descriptor,
            observations: HashMap::new(),
            num_obs: 0,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            visible_count: 1,
            found_count: 1,
            ref_kf: Some(ref_kf),
        }
    }

    /// A point that no keyframe observes. Its geometry is taken from the
    /// frame that created it.
    pub fn new_temporal(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        normal: Vector3<f64>,
        (min_distance, max_distance): (f64, f64),
    ) -> Self {
        Self {
            normal,
            min_distance,
            max_distance,
            ref_kf: None,
            ..Self::new(id, position, descriptor, KeyFrameId::new(0))
        }
    }

    /// Add an observation from a KeyFrame. `weight` is 2 for stereo
    /// observations and 1 otherwise. Re-adding an existing one is a no-op.
    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize, weight: usize) {
        if self.observations.contains_key(&kf_id) {
            return;
        }
        self.observations.insert(kf_id, feature_idx);
        self.num_obs += weight;
    }

    /// Remove an observation. Returns true if it existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId, weight: usize) -> bool {
        if self.observations.remove(&kf_id).is_none() {
            return false;
        }
        self.num_obs = self.num_obs.saturating_sub(weight);
        if self.ref_kf == Some(kf_id) {
            self.ref_kf = self.observations.keys().min().copied();
        }
        true
    }

    /// Weighted observation count (stereo counts twice).
    pub fn num_observations(&self) -> usize {
        self.num_obs
    }

    pub fn is_temporal(&self) -> bool {
        self.ref_kf.is_none()
    }

    pub fn index_in_keyframe(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf_id).copied()
    }

    /// found_count / visible_count.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// Lower end of the distance range with a 20% margin.
    pub fn min_distance_invariance(&self) -> f64 {
        0.8 * self.min_distance
    }

    /// Upper end of the distance range with a 20% margin.
    pub fn max_distance_invariance(&self) -> f64 {
        1.2 * self.max_distance
    }

    /// Pyramid level this point is expected at when seen from `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> i32 {
        let ratio = self.max_distance / distance;
        let level = (ratio.ln() / pyramid.log_scale_factor).ceil();
        if !level.is_finite() || level < 0.0 {
            return 0;
        }
        (level as i32).min(pyramid.n_levels as i32 - 1)
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("observations", &self.num_obs)
            .field("visible_count", &self.visible_count)
            .field("found_count", &self.found_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_mappoint() -> MapPoint {
        MapPoint::new(
            MapPointId::new(1),
            Vector3::new(1.0, 2.0, 3.0),
            [0u8; 32],
            KeyFrameId::new(0),
        )
    }

    #[test]
    fn test_add_remove_observation() {
        let mut mp = create_test_mappoint();

        mp.add_observation(KeyFrameId::new(1), 5, 2);
        mp.add_observation(KeyFrameId::new(2), 10, 1);
        mp.add_observation(KeyFrameId::new(2), 11, 1);

        assert_eq!(mp.num_observations(), 3);
        assert_eq!(mp.index_in_keyframe(KeyFrameId::new(2)), Some(10));

        assert!(mp.erase_observation(KeyFrameId::new(1), 2));
        assert_eq!(mp.num_observations(), 1);
        assert!(!mp.erase_observation(KeyFrameId::new(1), 2));
    }

    #[test]
    fn test_reference_moves_when_observation_erased() {
        let mut mp = create_test_mappoint();
        mp.add_observation(KeyFrameId::new(0), 0, 1);
        mp.add_observation(KeyFrameId::new(4), 0, 1);
        mp.add_observation(KeyFrameId::new(3), 0, 1);
        mp.erase_observation(KeyFrameId::new(0), 1);
        assert_eq!(mp.ref_kf, Some(KeyFrameId::new(3)));
    }

    #[test]
    fn test_found_ratio() {
        let mut mp = create_test_mappoint();
        assert_eq!(mp.found_ratio(), 1.0);

        mp.increase_visible(2);
        assert!((mp.found_ratio() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_predict_scale() {
        let pyramid = ScalePyramid::new(8, 1.2);
        let mut mp = create_test_mappoint();
        mp.max_distance = 10.0;
        assert_eq!(mp.predict_scale(10.0, &pyramid), 0);
        assert_eq!(mp.predict_scale(10.0 / 1.4, &pyramid), 2);
        assert_eq!(mp.predict_scale(0.01, &pyramid), 7);
        assert_eq!(mp.predict_scale(20.0, &pyramid), 0);
    }

    #[test]
    fn test_temporal_point() {
        let mp = MapPoint::new_temporal(
            MapPointId::new(9),
            Vector3::zeros(),
            [1u8; 32],
            Vector3::z(),
            (0.5, 4.0),
        );
        assert!(mp.is_temporal());
        assert_eq!(mp.num_observations(), 0);
        assert_eq!(mp.max_distance_invariance(), 4.8);
    }
}
