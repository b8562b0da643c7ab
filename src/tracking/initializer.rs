//! Map initialization.
//!
//! Depth sensors bootstrap from a single frame: every keypoint with a depth
//! becomes a point. A monocular camera needs two views with enough parallax;
//! the first acceptable frame is kept as reference and every following frame
//! is matched against it until two-view reconstruction succeeds.

use nalgebra::{Rotation3, UnitQuaternion, Vector2};
use tracing::{debug, info};

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::TrackingParams;
use crate::geometry::two_view::TwoViewReconstructor;
use crate::geometry::SE3;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::OrbVocabulary;

const INIT_NN_RATIO: f64 = 0.9;

/// KeyFrames and points created by a successful initialization.
#[derive(Debug, Clone)]
pub struct InitializedMap {
    /// In creation order; the last one is the new reference.
    pub keyframes: Vec<KeyFrameId>,
    pub points: Vec<MapPointId>,
}

impl InitializedMap {
    pub fn reference(&self) -> Option<KeyFrameId> {
        self.keyframes.last().copied()
    }
}

/// Build the first map from a single stereo or RGB-D frame at the origin.
///
/// Returns None, leaving the map untouched, when the frame has too few
/// keypoints.
pub fn initialize_stereo(
    frame: &mut Frame,
    map: &mut Map,
    vocabulary: &OrbVocabulary,
    params: &TrackingParams,
) -> Option<InitializedMap> {
    if frame.num_features() <= params.stereo_init_min_features {
        debug!(
            "Stereo initialization: {} keypoints, need more than {}",
            frame.num_features(),
            params.stereo_init_min_features
        );
        return None;
    }

    frame.set_pose(SE3::identity());
    frame.compute_bow(vocabulary);
    let kf_id = map.insert_keyframe(frame);

    let mut points = Vec::new();
    for i in 0..frame.num_features() {
        let Some(x3d) = frame.unproject_stereo(i) else {
            continue;
        };
        let mp_id = map.create_map_point(x3d, frame.descriptors[i], kf_id);
        map.associate(kf_id, i, mp_id);
        map.compute_distinctive_descriptor(mp_id);
        map.update_normal_and_depth(mp_id);
        frame.map_points[i] = Some(mp_id);
        points.push(mp_id);
    }
    frame.reference_kf = Some(kf_id);

    info!("New map created with {} points", points.len());
    Some(InitializedMap {
        keyframes: vec![kf_id],
        points,
    })
}

/// Two-view bootstrapping state for a monocular camera.
#[derive(Default)]
pub struct MonocularInitializer {
    reference: Option<Frame>,
    /// Last position each reference keypoint was matched at.
    prev_matched: Vec<Vector2<f64>>,
}

impl MonocularInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a reference frame is waiting for its second view.
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Id of the frame waiting for its second view.
    pub fn reference_id(&self) -> Option<u64> {
        self.reference.as_ref().map(|f| f.id)
    }

    pub fn reset(&mut self) {
        self.reference = None;
        self.prev_matched.clear();
    }

    fn set_reference(&mut self, frame: &Frame, params: &TrackingParams) {
        if frame.num_features() > params.mono_init_min_features {
            self.prev_matched = frame
                .keypoints_un
                .iter()
                .map(|kp| Vector2::new(kp.x, kp.y))
                .collect();
            self.reference = Some(frame.clone());
        } else {
            self.reset();
        }
    }

    /// Feed a frame. Returns the new map once two views reconstruct.
    ///
    /// A frame with too few keypoints or matches replaces the reference; a
    /// failed reconstruction keeps it and waits for more parallax.
    pub fn try_initialize(
        &mut self,
        frame: &mut Frame,
        map: &mut Map,
        vocabulary: &OrbVocabulary,
        params: &TrackingParams,
    ) -> Option<InitializedMap> {
        let Some(reference) = self.reference.as_ref() else {
            self.set_reference(frame, params);
            return None;
        };

        if frame.num_features() <= params.mono_init_min_features {
            self.reset();
            return None;
        }

        let matcher = OrbMatcher::new(INIT_NN_RATIO, true);
        let (n, matches12) = matcher.search_for_initialization(
            reference,
            frame,
            &mut self.prev_matched,
            params.mono_init_window,
        );
        if n < params.mono_init_min_matches {
            debug!("Monocular initialization: {} matches, restarting from frame {}", n, frame.id);
            self.set_reference(frame, params);
            return None;
        }

        let kps1: Vec<Vector2<f64>> = reference
            .keypoints_un
            .iter()
            .map(|kp| Vector2::new(kp.x, kp.y))
            .collect();
        let kps2: Vec<Vector2<f64>> = frame
            .keypoints_un
            .iter()
            .map(|kp| Vector2::new(kp.x, kp.y))
            .collect();
        let reconstructor = TwoViewReconstructor::new(frame.camera().k(), params.two_view.clone());
        let (model, recon) = reconstructor.reconstruct(&kps1, &kps2, &matches12)?;
        debug!("Monocular initialization from {:?} with {} matches", model, n);

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(recon.r21));
        let pose = SE3::new(rotation, recon.t21);

        let points: Vec<_> = recon
            .points
            .iter()
            .zip(&recon.triangulated)
            .map(|(p, ok)| if *ok { *p } else { None })
            .collect();

        let mut reference = self.reference.take()?;
        self.prev_matched.clear();
        let result =
            create_monocular_map(&mut reference, frame, pose, &matches12, &points, map, vocabulary, params);
        if result.is_none() {
            map.clear();
        }
        result
    }
}

/// Two KeyFrames and the triangulated points, scaled to unit median depth.
#[allow(clippy::too_many_arguments)]
fn create_monocular_map(
    reference: &mut Frame,
    current: &mut Frame,
    pose21: SE3,
    matches12: &[Option<usize>],
    points: &[Option<nalgebra::Vector3<f64>>],
    map: &mut Map,
    vocabulary: &OrbVocabulary,
    params: &TrackingParams,
) -> Option<InitializedMap> {
    reference.set_pose(SE3::identity());
    current.set_pose(pose21);
    reference.compute_bow(vocabulary);
    current.compute_bow(vocabulary);

    let kf_ini = map.insert_keyframe(reference);
    let kf_cur = map.insert_keyframe(current);
    current.clear_map_points();

    let mut created = Vec::new();
    for (i1, m) in matches12.iter().enumerate() {
        let (Some(i2), Some(Some(x3d))) = (m, points.get(i1)) else {
            continue;
        };
        let mp_id = map.create_map_point(*x3d, current.descriptors[*i2], kf_cur);
        map.associate(kf_ini, i1, mp_id);
        map.associate(kf_cur, *i2, mp_id);
        map.compute_distinctive_descriptor(mp_id);
        map.update_normal_and_depth(mp_id);
        current.map_points[*i2] = Some(mp_id);
        created.push(mp_id);
    }
    map.update_connections(kf_ini);
    map.update_connections(kf_cur);

    let median_depth = map.scene_median_depth(kf_ini, 2).unwrap_or(-1.0);
    let tracked = map.tracked_map_points(kf_cur, 1);
    if median_depth <= 0.0 || tracked < params.mono_init_min_tracked {
        info!(
            "Wrong initialization (median depth {:.3}, {} tracked points), resetting",
            median_depth, tracked
        );
        return None;
    }

    let inv_median = 1.0 / median_depth;
    let scaled = SE3::new(pose21.rotation, pose21.translation * inv_median);
    if let Some(kf) = map.get_keyframe_mut(kf_cur) {
        kf.set_pose(scaled);
    }
    for mp_id in &created {
        if let Some(mp) = map.get_map_point_mut(*mp_id) {
            mp.position *= inv_median;
        }
    }
    for mp_id in &created {
        map.update_normal_and_depth(*mp_id);
    }
    current.set_pose(scaled);
    current.reference_kf = Some(kf_cur);

    info!("New map created with {} points", created.len());
    Some(InitializedMap {
        keyframes: vec![kf_ini, kf_cur],
        points: created,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_stereo_initialization_creates_one_keyframe() {
        let scene = SyntheticScene::new(700, 61);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let mut frame = scene.frame(0, &SE3::identity(), true);
        let with_depth = frame.depth.iter().filter(|&&z| z > 0.0).count();

        let params = TrackingParams::default();
        let init = initialize_stereo(&mut frame, &mut map, &vocabulary, &params).unwrap();

        assert_eq!(map.num_keyframes(), 1);
        assert_eq!(init.points.len(), with_depth);
        assert_eq!(map.num_map_points(), with_depth);
        assert_eq!(frame.reference_kf, init.reference());
        assert_eq!(frame.num_map_points(), with_depth);
    }

    #[test]
    fn test_stereo_initialization_needs_features() {
        let scene = SyntheticScene::new(200, 62);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let mut frame = scene.frame(0, &SE3::identity(), true);
        let params = TrackingParams::default();
        assert!(initialize_stereo(&mut frame, &mut map, &vocabulary, &params).is_none());
        assert_eq!(map.num_keyframes(), 0);
    }

    #[test]
    fn test_monocular_needs_two_views() {
        let scene = SyntheticScene::new(300, 63);
        let vocabulary = scene.vocabulary();
        let params = TrackingParams::default();
        let mut map = Map::new();
        let mut initializer = MonocularInitializer::new();

        let mut first = scene.frame(0, &SE3::identity(), false);
        assert!(initializer
            .try_initialize(&mut first, &mut map, &vocabulary, &params)
            .is_none());
        assert_eq!(initializer.reference_id(), Some(0));

        let truth = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.3, 0.02, 0.0));
        let mut second = scene.frame(1, &truth, false);
        let init = initializer
            .try_initialize(&mut second, &mut map, &vocabulary, &params)
            .unwrap();

        assert_eq!(init.keyframes.len(), 2);
        assert_eq!(map.num_keyframes(), 2);
        assert!(init.points.len() >= params.mono_init_min_tracked);
        assert!(!initializer.has_reference());

        let median = map.scene_median_depth(init.keyframes[0], 2).unwrap();
        assert_relative_eq!(median, 1.0, epsilon = 1e-9);
        let pose = second.pose_cw.unwrap();
        assert_relative_eq!(
            pose.translation.normalize(),
            truth.translation.normalize(),
            epsilon = 1e-4
        );
        assert_eq!(second.reference_kf, init.reference());
    }

    #[test]
    fn test_monocular_too_few_matches_replaces_reference() {
        let scene = SyntheticScene::new(300, 65);
        let unrelated = SyntheticScene::new(300, 66);
        let vocabulary = scene.vocabulary();
        let params = TrackingParams::default();
        let mut map = Map::new();
        let mut initializer = MonocularInitializer::new();

        let mut first = unrelated.frame(0, &SE3::identity(), false);
        initializer.try_initialize(&mut first, &mut map, &vocabulary, &params);
        assert_eq!(initializer.reference_id(), Some(0));

        let mut second = scene.frame(1, &SE3::identity(), false);
        assert!(initializer
            .try_initialize(&mut second, &mut map, &vocabulary, &params)
            .is_none());
        assert_eq!(initializer.reference_id(), Some(1));
        assert_eq!(map.num_keyframes(), 0);

        // A sparse frame drops the reference altogether
        let (mut features, _) = scene.stereo_features(&SE3::identity());
        features.keypoints.truncate(50);
        features.descriptors.truncate(50);
        let mut sparse = Frame::new(2, 0.1, features, None, &scene.calib);
        assert!(initializer
            .try_initialize(&mut sparse, &mut map, &vocabulary, &params)
            .is_none());
        assert!(!initializer.has_reference());
    }

    #[test]
    fn test_monocular_rejects_pure_rotation() {
        let scene = SyntheticScene::new(300, 64);
        let vocabulary = scene.vocabulary();
        let params = TrackingParams::default();
        let mut map = Map::new();
        let mut initializer = MonocularInitializer::new();

        let mut first = scene.frame(0, &SE3::identity(), false);
        initializer.try_initialize(&mut first, &mut map, &vocabulary, &params);

        let rotated = SE3::new(UnitQuaternion::from_euler_angles(0.0, 0.03, 0.0), Vector3::zeros());
        let mut second = scene.frame(1, &rotated, false);
        assert!(initializer
            .try_initialize(&mut second, &mut map, &vocabulary, &params)
            .is_none());
        assert_eq!(map.num_keyframes(), 0);
        // Still waiting on the same reference
        assert!(initializer.has_reference());
    }
}
