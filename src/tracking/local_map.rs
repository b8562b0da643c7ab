//! Track Local Map: projection-based search over the covisible neighbourhood.
//!
//! Given a frame with a first pose estimate and some matches, the local map
//! is rebuilt around those matches, every local point that should be
//! visible is projected and searched for, and the pose is optimized again
//! with the enlarged set. The resulting inlier count decides whether the
//! frame is tracked.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::optimizer::optimize_frame_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::{Frame, FrustumProjection};

/// Minimum cosine between the viewing ray and a point's mean normal.
const VIEW_COS_LIMIT: f64 = 0.5;
const LOCAL_MAP_NN_RATIO: f64 = 0.8;
/// Best covisibles explored per local KeyFrame.
const NEIGHBOUR_COVISIBLES: usize = 10;

/// How aggressively unmatched local points are searched for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSearchParams {
    /// Radius multiplier, 1 for the default window.
    pub th: f64,
    /// In localization, inliers count whether or not KeyFrames observe them.
    pub only_tracking: bool,
    /// Unmatch outliers after optimization (stereo input).
    pub drop_outliers: bool,
}

/// Outcome of a local map step.
#[derive(Debug, Clone, Default)]
pub struct LocalMapResult {
    pub inliers: usize,
    /// KeyFrame sharing the most points with the frame.
    pub reference: Option<KeyFrameId>,
    /// Points whose visible counter must grow.
    pub visible: Vec<MapPointId>,
    /// Points whose found counter must grow.
    pub found: Vec<MapPointId>,
}

/// The transient neighbourhood of the current frame.
#[derive(Debug, Default)]
pub struct LocalMapTracker {
    local_keyframes: Vec<KeyFrameId>,
    local_points: Vec<MapPointId>,
    max_keyframes: usize,
}

impl LocalMapTracker {
    pub fn new(max_keyframes: usize) -> Self {
        Self {
            local_keyframes: Vec::new(),
            local_points: Vec::new(),
            max_keyframes,
        }
    }

    pub fn local_keyframes(&self) -> &[KeyFrameId] {
        &self.local_keyframes
    }

    pub fn local_points(&self) -> &[MapPointId] {
        &self.local_points
    }

    /// Seed the local map directly, as map initialization does.
    pub fn set(&mut self, keyframes: Vec<KeyFrameId>, points: Vec<MapPointId>) {
        self.local_keyframes = keyframes;
        self.local_points = points;
    }

    pub fn clear(&mut self) {
        self.local_keyframes.clear();
        self.local_points.clear();
    }

    /// Run the whole step against one consistent view of the map.
    ///
    /// The map is only read; the visible/found counters to apply are
    /// returned so the caller can write them under a short exclusive scope.
    pub fn track(&mut self, frame: &mut Frame, map: &Map, params: &LocalSearchParams) -> LocalMapResult {
        let reference = self.update_local_keyframes(frame, map);
        self.update_local_points(map);

        let mut visible = self.search_local_points(frame, map, params.th);

        optimize_frame_pose(frame, map);

        let mut found = Vec::new();
        let mut inliers = 0;
        for i in 0..frame.num_features() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            if !frame.outliers[i] {
                let observed = map
                    .get_map_point(mp_id)
                    .is_some_and(|mp| mp.num_observations() > 0);
                found.push(mp_id);
                if observed || params.only_tracking {
                    inliers += 1;
                }
            } else if params.drop_outliers {
                frame.map_points[i] = None;
            }
        }
        visible.sort_unstable();

        debug!(
            "Local map: {} keyframes, {} points, {} inliers",
            self.local_keyframes.len(),
            self.local_points.len(),
            inliers
        );

        LocalMapResult {
            inliers,
            reference,
            visible,
            found,
        }
    }

    /// Collect the KeyFrames observing the frame's points, then grow the set
    /// through covisibility, children and parents.
    ///
    /// Returns the KeyFrame sharing the most points with the frame.
    pub fn update_local_keyframes(&mut self, frame: &mut Frame, map: &Map) -> Option<KeyFrameId> {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for slot in frame.map_points.iter_mut() {
            let Some(mp_id) = *slot else {
                continue;
            };
            match map.get_map_point(mp_id) {
                Some(mp) => {
                    for kf_id in mp.observations.keys() {
                        *counter.entry(*kf_id).or_insert(0) += 1;
                    }
                }
                None => *slot = None,
            }
        }
        if counter.is_empty() {
            self.local_keyframes.clear();
            return None;
        }

        let reference = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, _)| *id);

        let mut initial: Vec<KeyFrameId> = counter
            .keys()
            .copied()
            .filter(|id| map.get_keyframe(*id).is_some())
            .collect();
        initial.sort_unstable();

        let mut in_set: HashSet<KeyFrameId> = initial.iter().copied().collect();
        let mut local = initial.clone();

        for kf_id in initial {
            if local.len() >= self.max_keyframes {
                break;
            }
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };

            let is_new = |id: &KeyFrameId, in_set: &HashSet<KeyFrameId>| {
                !in_set.contains(id) && map.get_keyframe(*id).is_some()
            };

            if let Some(n) = kf
                .best_covisibles(NEIGHBOUR_COVISIBLES)
                .into_iter()
                .find(|id| is_new(id, &in_set))
            {
                in_set.insert(n);
                local.push(n);
            }

            let mut children: Vec<KeyFrameId> = kf.children_ids.iter().copied().collect();
            children.sort_unstable();
            if let Some(c) = children.into_iter().find(|id| is_new(id, &in_set)) {
                in_set.insert(c);
                local.push(c);
            }

            if let Some(p) = kf.parent_id.filter(|id| is_new(id, &in_set)) {
                in_set.insert(p);
                local.push(p);
            }
        }

        self.local_keyframes = local;
        reference
    }

    /// Union of the points of the local KeyFrames.
    pub fn update_local_points(&mut self, map: &Map) {
        let mut seen = HashSet::new();
        self.local_points.clear();
        for kf_id in &self.local_keyframes {
            let Some(kf) = map.get_keyframe(*kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.map_point_indices() {
                if map.get_map_point(mp_id).is_some() && seen.insert(mp_id) {
                    self.local_points.push(mp_id);
                }
            }
        }
    }

    /// Project local points not matched yet and search for them.
    ///
    /// Returns the points that count as visible in this frame: the ones
    /// already matched plus the ones passing the frustum test.
    fn search_local_points(&self, frame: &mut Frame, map: &Map, th: f64) -> Vec<MapPointId> {
        let mut visible = Vec::new();
        let mut matched = HashSet::new();
        for mp_id in frame.map_points.iter().flatten() {
            if map.get_map_point(*mp_id).is_some() {
                visible.push(*mp_id);
                matched.insert(*mp_id);
            }
        }

        let candidates: Vec<(MapPointId, FrustumProjection)> = self
            .local_points
            .iter()
            .filter(|id| !matched.contains(id))
            .filter_map(|id| {
                let mp = map.get_map_point(*id)?;
                let proj = frame.is_in_frustum(mp, VIEW_COS_LIMIT)?;
                Some((*id, proj))
            })
            .collect();
        visible.extend(candidates.iter().map(|(id, _)| *id));

        if !candidates.is_empty() {
            let matcher = OrbMatcher::new(LOCAL_MAP_NN_RATIO, false);
            let n = matcher.search_by_projection_local(frame, &candidates, th, map);
            debug!("Local map search: {} candidates, {} matches", candidates.len(), n);
        }
        visible
    }
}

/// Apply the counters gathered by [`LocalMapTracker::track`].
pub fn apply_counters(map: &mut Map, result: &LocalMapResult) {
    for id in &result.visible {
        if let Some(mp) = map.get_map_point_mut(*id) {
            mp.increase_visible(1);
        }
    }
    for id in &result.found {
        if let Some(mp) = map.get_map_point_mut(*id) {
            mp.increase_found(1);
        }
    }
}

/// Whether a frame with `inliers` local-map inliers is tracked.
///
/// Right after a relocalization more support is demanded.
pub fn is_tracked(
    inliers: usize,
    frame_id: u64,
    last_reloc_frame_id: Option<u64>,
    max_frames: u64,
    min_inliers: usize,
    min_inliers_after_reloc: usize,
) -> bool {
    let recently_relocalized = last_reloc_frame_id.is_some_and(|r| frame_id < r + max_frames);
    if recently_relocalized && inliers < min_inliers_after_reloc {
        return false;
    }
    inliers >= min_inliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::test_support::SyntheticScene;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_inlier_decision() {
        assert!(is_tracked(30, 100, None, 30, 30, 50));
        assert!(!is_tracked(29, 100, None, 30, 30, 50));
        // Within max_frames of a relocalization
        assert!(!is_tracked(40, 100, Some(90), 30, 30, 50));
        assert!(is_tracked(50, 100, Some(90), 30, 30, 50));
        assert!(is_tracked(40, 130, Some(90), 30, 30, 50));
    }

    #[test]
    fn test_local_map_adds_matches() {
        let scene = SyntheticScene::new(300, 31);
        let mut map = Map::new();
        let first = scene.frame_with_map_points(0, &SE3::identity(), &mut map);
        let kf = first.reference_kf.unwrap();

        let truth = SE3::new(UnitQuaternion::identity(), Vector3::new(0.02, 0.0, 0.0));
        let mut frame = scene.frame(1, &truth, true);
        frame.set_pose(truth);
        // Seed a handful of matches, as frame-to-frame tracking would
        let mut seeded = 0;
        for i in 0..frame.num_features() {
            if seeded == 20 {
                break;
            }
            if let Some(j) = (0..first.num_features())
                .find(|&j| scene.landmark_of(&first, j) == scene.landmark_of(&frame, i))
            {
                frame.map_points[i] = first.map_points[j];
                seeded += 1;
            }
        }

        let mut tracker = LocalMapTracker::new(80);
        let params = LocalSearchParams {
            th: 3.0,
            only_tracking: false,
            drop_outliers: true,
        };
        let result = tracker.track(&mut frame, &map, &params);

        assert_eq!(result.reference, Some(kf));
        assert_eq!(tracker.local_keyframes(), &[kf]);
        assert_eq!(tracker.local_points().len(), map.num_map_points());
        assert!(result.inliers > 150);
        assert!(result.visible.len() >= result.inliers);

        let before = map.get_map_point(result.found[0]).unwrap().found_count;
        apply_counters(&mut map, &result);
        assert_eq!(map.get_map_point(result.found[0]).unwrap().found_count, before + 1);
    }
}
