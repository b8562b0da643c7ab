//! Frame-to-frame pose estimation.
//!
//! Two strategies give the tracker a first pose for the current frame:
//! - the motion model, projecting the last frame's points through the
//!   predicted pose;
//! - the reference KeyFrame, matching BoW groups when no prediction is
//!   available or the prediction failed.
//!
//! Both end with a pose optimization and drop the matches it rejected.

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::TrackingParams;
use crate::geometry::SE3;
use crate::optimizer::optimize_frame_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::OrbVocabulary;

/// Matches left on a frame after outlier removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchSummary {
    /// All matches, including temporary points.
    pub matches: usize,
    /// Matches to points observed by KeyFrames.
    pub map_matches: usize,
}

/// Unmatch every feature flagged as outlier and count what is left.
pub fn discard_outliers(frame: &mut Frame, map: &Map) -> MatchSummary {
    let mut summary = MatchSummary::default();
    for i in 0..frame.num_features() {
        let Some(mp_id) = frame.map_points[i] else {
            continue;
        };
        if frame.outliers[i] {
            frame.map_points[i] = None;
            frame.outliers[i] = false;
            continue;
        }
        summary.matches += 1;
        if map
            .get_map_point(mp_id)
            .is_some_and(|mp| mp.num_observations() > 0)
        {
            summary.map_matches += 1;
        }
    }
    summary
}

/// Match the frame against the reference KeyFrame's points and optimize
/// starting from `initial_pose`.
///
/// Returns None when BoW matching finds too few correspondences.
pub fn track_reference_keyframe(
    frame: &mut Frame,
    reference: KeyFrameId,
    initial_pose: SE3,
    map: &Map,
    vocabulary: &OrbVocabulary,
    params: &TrackingParams,
) -> Option<MatchSummary> {
    frame.compute_bow(vocabulary);
    let kf = map.get_keyframe(reference)?;

    let matcher = OrbMatcher::new(params.ref_kf_nn_ratio, true);
    let (n, matches) = matcher.search_by_bow(kf, frame, map);
    if n < params.min_bow_matches {
        debug!("Reference keyframe {}: only {} BoW matches", reference, n);
        return None;
    }

    frame.map_points = matches;
    frame.outliers.iter_mut().for_each(|o| *o = false);
    frame.set_pose(initial_pose);
    optimize_frame_pose(frame, map);
    Some(discard_outliers(frame, map))
}

/// Predict the pose with `velocity`, project the last frame's points and
/// optimize.
///
/// Returns None when projection finds too few correspondences, even with a
/// doubled search window.
pub fn track_with_motion_model(
    frame: &mut Frame,
    last: &Frame,
    velocity: &SE3,
    monocular: bool,
    map: &Map,
    params: &TrackingParams,
) -> Option<MatchSummary> {
    let last_pose = last.pose_cw?;
    let matcher = OrbMatcher::new(params.motion_nn_ratio, true);

    frame.set_pose(*velocity * last_pose);
    frame.clear_map_points();

    let th = if monocular { 15.0 } else { 7.0 };
    let mut n = matcher.search_by_projection_last_frame(frame, last, th, monocular, map);
    if n < params.min_projection_matches {
        frame.clear_map_points();
        n = matcher.search_by_projection_last_frame(frame, last, 2.0 * th, monocular, map);
    }
    if n < params.min_projection_matches {
        debug!("Motion model: only {} projection matches", n);
        return None;
    }

    optimize_frame_pose(frame, map);
    Some(discard_outliers(frame, map))
}

/// Recompute the last frame's pose from its reference KeyFrame, which the
/// mapping worker may have moved since the frame was tracked.
pub fn update_last_frame_pose(last: &mut Frame, reference: KeyFrameId, relative_pose: &SE3, map: &Map) {
    if let Some(reference_pose) = map.keyframe_pose(reference) {
        last.set_pose(*relative_pose * reference_pose);
    }
}

/// Give the last frame temporary points for its close features so the
/// motion model has something to project when the map is out of sight.
///
/// Features are visited by increasing depth; existing matches to mapped
/// points are kept and counted. The walk stops once past `th_depth` with
/// more than `max_points` points. The created ids are returned so the caller
/// can erase them after the frame.
pub fn create_temporal_points(last: &mut Frame, map: &mut Map, max_points: usize) -> Vec<MapPointId> {
    let mut by_depth: Vec<(f64, usize)> = last
        .depth
        .iter()
        .enumerate()
        .filter(|(_, &z)| z > 0.0)
        .map(|(i, &z)| (z, i))
        .collect();
    if by_depth.is_empty() {
        return Vec::new();
    }
    by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));

    let th_depth = last.calib.th_depth;
    let mut created = Vec::new();
    let mut n_points = 0;
    for (z, i) in by_depth {
        let mapped = last.map_points[i]
            .and_then(|id| map.get_map_point(id))
            .is_some_and(|mp| mp.num_observations() >= 1);
        if !mapped {
            if let Some(x3d) = last.unproject_stereo(i) {
                let mp_id = map.create_temporal_point(x3d, last, i);
                last.map_points[i] = Some(mp_id);
                created.push(mp_id);
            }
        }
        n_points += 1;

        if z > th_depth && n_points > max_points {
            break;
        }
    }
    created
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn moved_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.005, -0.01, 0.0),
            Vector3::new(0.02, -0.01, 0.03),
        )
    }

    #[test]
    fn test_motion_model_recovers_known_motion() {
        let scene = SyntheticScene::new(300, 21);
        let mut map = Map::new();
        let last = scene.frame_with_map_points(0, &SE3::identity(), &mut map);

        let truth = moved_pose();
        let mut current = scene.frame(1, &truth, true);
        let params = TrackingParams::default();

        // Zero velocity: the prediction is the last pose
        let summary =
            track_with_motion_model(&mut current, &last, &SE3::identity(), false, &map, &params).unwrap();
        assert!(summary.map_matches >= params.min_map_matches);
        assert_eq!(summary.matches, summary.map_matches);

        let pose = current.pose_cw.unwrap();
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
        assert_relative_eq!(pose.rotation.angle_to(&truth.rotation), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_reference_keyframe_tracking() {
        let scene = SyntheticScene::new(300, 22);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let last = scene.frame_with_map_points(0, &SE3::identity(), &mut map);
        let reference = last.reference_kf.unwrap();

        let truth = moved_pose();
        let mut current = scene.frame(1, &truth, false);
        let params = TrackingParams::default();
        let summary =
            track_reference_keyframe(&mut current, reference, SE3::identity(), &map, &vocabulary, &params)
                .unwrap();
        assert!(summary.map_matches > 100);
        let pose = current.pose_cw.unwrap();
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_reference_keyframe_needs_matches() {
        let scene = SyntheticScene::new(300, 23);
        let other = SyntheticScene::new(300, 24);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let last = scene.frame_with_map_points(0, &SE3::identity(), &mut map);

        // A frame of an unrelated scene shares no descriptors
        let mut current = other.frame(1, &SE3::identity(), false);
        let params = TrackingParams::default();
        let result = track_reference_keyframe(
            &mut current,
            last.reference_kf.unwrap(),
            SE3::identity(),
            &map,
            &vocabulary,
            &params,
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_temporal_points_cover_close_features() {
        let scene = SyntheticScene::new(200, 25);
        let mut map = Map::new();
        let mut last = scene.frame(0, &SE3::identity(), true);
        last.set_pose(SE3::identity());

        let created = create_temporal_points(&mut last, &mut map, 100);
        assert!(!created.is_empty());
        for id in &created {
            let mp = map.get_map_point(*id).unwrap();
            assert!(mp.is_temporal());
            assert_eq!(mp.num_observations(), 0);
        }
        // Every close feature got a point
        for i in 0..last.num_features() {
            if last.depth[i] > 0.0 && last.depth[i] <= last.calib.th_depth {
                assert!(last.map_points[i].is_some());
            }
        }
    }
}
