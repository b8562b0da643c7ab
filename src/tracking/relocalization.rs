//! Relocalization against the KeyFrame database.
//!
//! Candidates come from BoW place recognition. Each one that shares enough
//! matches with the frame gets its own PnP RANSAC solver; the solvers advance
//! a few iterations per round so that no single candidate eats the whole
//! budget. A hypothesis is accepted once pose optimization, helped by a
//! guided search over the candidate's points, keeps enough inliers.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::config::TrackingParams;
use crate::geometry::pnp::{PnpCorrespondence, PnpSolver, PnpStep};
use crate::optimizer::optimize_frame_pose;
use crate::tracking::matching::OrbMatcher;
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::OrbVocabulary;

/// RANSAC iterations granted to each candidate per round.
const ITERATIONS_PER_ROUND: usize = 5;
/// Below this many inliers a hypothesis is dropped right away.
const MIN_HYPOTHESIS_INLIERS: usize = 10;
/// Above this many inliers the second, tighter guided search is worth it.
const TIGHT_SEARCH_MIN_INLIERS: usize = 30;

const WIDE_SEARCH_TH: f64 = 10.0;
const WIDE_SEARCH_ORB_DIST: u32 = 100;
const TIGHT_SEARCH_TH: f64 = 3.0;
const TIGHT_SEARCH_ORB_DIST: u32 = 64;

struct Candidate {
    kf_id: KeyFrameId,
    /// BoW matches, indexed by frame feature.
    matches: Vec<Option<MapPointId>>,
    /// Frame feature behind each PnP correspondence.
    feature_of: Vec<usize>,
    solver: PnpSolver,
}

pub struct Relocalizer<'a> {
    params: &'a TrackingParams,
}

impl<'a> Relocalizer<'a> {
    pub fn new(params: &'a TrackingParams) -> Self {
        Self { params }
    }

    /// Try to recover the pose of `frame` from the map.
    ///
    /// On success the frame carries the pose and its inlier matches, and the
    /// KeyFrame that relocalized it is returned. On failure the frame's
    /// matches are cleared.
    pub fn relocalize(
        &self,
        frame: &mut Frame,
        map: &Map,
        keyframe_db: &KeyFrameDatabase,
        vocabulary: &OrbVocabulary,
    ) -> Option<KeyFrameId> {
        frame.compute_bow(vocabulary);
        let bow = frame.bow.as_ref()?;
        let candidate_ids = keyframe_db.detect_relocalization_candidates(bow, map);
        if candidate_ids.is_empty() {
            debug!("Relocalization: no candidates for frame {}", frame.id);
            return None;
        }

        let mut candidates = self.prepare_candidates(frame, map, &candidate_ids);
        debug!(
            "Relocalization: {} of {} candidates kept for frame {}",
            candidates.len(),
            candidate_ids.len(),
            frame.id
        );

        while !candidates.is_empty() {
            let mut i = 0;
            while i < candidates.len() {
                match candidates[i].solver.iterate(ITERATIONS_PER_ROUND) {
                    PnpStep::Exhausted => {
                        candidates.swap_remove(i);
                        continue;
                    }
                    PnpStep::Continue => {}
                    PnpStep::Found { pose, inliers } => {
                        frame.set_pose(pose);
                        frame.clear_map_points();
                        let candidate = &candidates[i];
                        for (j, inlier) in inliers.iter().enumerate() {
                            if *inlier {
                                let feat = candidate.feature_of[j];
                                frame.map_points[feat] = candidate.matches[feat];
                            }
                        }
                        if self.refine(frame, candidate.kf_id, map) {
                            info!(
                                "Relocalized frame {} against keyframe {}",
                                frame.id, candidate.kf_id
                            );
                            return Some(candidate.kf_id);
                        }
                    }
                }
                i += 1;
            }
        }

        frame.clear_map_points();
        None
    }

    /// BoW-match every candidate and set up a solver for the ones with
    /// enough matches.
    fn prepare_candidates(&self, frame: &Frame, map: &Map, candidate_ids: &[KeyFrameId]) -> Vec<Candidate> {
        let matcher = OrbMatcher::new(self.params.reloc_nn_ratio, true);
        let k = frame.camera().k();
        let pyramid = frame.pyramid();

        let mut candidates = Vec::new();
        for &kf_id in candidate_ids {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let (n, matches) = matcher.search_by_bow(kf, frame, map);
            if n < self.params.min_bow_matches {
                continue;
            }

            let mut correspondences = Vec::with_capacity(n);
            let mut feature_of = Vec::with_capacity(n);
            for (i, m) in matches.iter().enumerate() {
                let Some(mp) = m.and_then(|id| map.get_map_point(id)) else {
                    continue;
                };
                let kp = &frame.keypoints_un[i];
                correspondences.push(PnpCorrespondence {
                    point_world: mp.position,
                    pixel: nalgebra::Vector2::new(kp.x, kp.y),
                    sigma2: pyramid.level_sigma2[pyramid.level(kp.octave)],
                });
                feature_of.push(i);
            }

            let seed = frame.id.wrapping_mul(31).wrapping_add(kf_id.0);
            let solver = PnpSolver::new(correspondences, k, &self.params.pnp, seed);
            candidates.push(Candidate {
                kf_id,
                matches,
                feature_of,
                solver,
            });
        }
        candidates
    }

    /// Optimize a PnP hypothesis, growing its support with guided searches
    /// over the candidate's points when it falls short.
    fn refine(&self, frame: &mut Frame, kf_id: KeyFrameId, map: &Map) -> bool {
        let target = self.params.reloc_min_inliers;
        let Some(kf) = map.get_keyframe(kf_id) else {
            return false;
        };
        let matcher = OrbMatcher::new(0.9, true);

        let mut good = optimize_frame_pose(frame, map);
        if good < MIN_HYPOTHESIS_INLIERS {
            return false;
        }
        drop_outliers(frame);

        if good < target {
            let found = matched_points(frame);
            let additional = matcher.search_by_projection_keyframe(
                frame,
                kf,
                &found,
                WIDE_SEARCH_TH,
                WIDE_SEARCH_ORB_DIST,
                map,
            );
            if good + additional >= target {
                good = optimize_frame_pose(frame, map);

                if good > TIGHT_SEARCH_MIN_INLIERS && good < target {
                    let found = inlier_points(frame);
                    let additional = matcher.search_by_projection_keyframe(
                        frame,
                        kf,
                        &found,
                        TIGHT_SEARCH_TH,
                        TIGHT_SEARCH_ORB_DIST,
                        map,
                    );
                    if good + additional >= target {
                        good = optimize_frame_pose(frame, map);
                        drop_outliers(frame);
                    }
                }
            }
        }

        good >= target
    }
}

fn drop_outliers(frame: &mut Frame) {
    for i in 0..frame.num_features() {
        if frame.outliers[i] {
            frame.map_points[i] = None;
            frame.outliers[i] = false;
        }
    }
}

fn matched_points(frame: &Frame) -> HashSet<MapPointId> {
    frame.map_points.iter().flatten().copied().collect()
}

fn inlier_points(frame: &Frame) -> HashSet<MapPointId> {
    frame
        .map_points
        .iter()
        .zip(&frame.outliers)
        .filter_map(|(m, outlier)| if *outlier { None } else { *m })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::test_support::SyntheticScene;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn database_of(map: &Map) -> KeyFrameDatabase {
        let mut db = KeyFrameDatabase::new();
        for kf in map.keyframes() {
            if let Some(bow) = &kf.bow_vector {
                db.add(kf.id, bow);
            }
        }
        db
    }

    #[test]
    fn test_relocalizes_against_known_place() {
        let scene = SyntheticScene::new(300, 51);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let first = scene.frame_with_map_points(0, &SE3::identity(), &mut map);
        let db = database_of(&map);

        let truth = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.05, 0.0),
            Vector3::new(0.1, 0.0, -0.05),
        );
        let mut frame = scene.frame(7, &truth, false);
        let params = TrackingParams::default();
        let kf = Relocalizer::new(&params).relocalize(&mut frame, &map, &db, &vocabulary);

        assert_eq!(kf, first.reference_kf);
        let pose = frame.pose_cw.unwrap();
        assert_relative_eq!(pose.translation, truth.translation, epsilon = 1e-5);
        assert!(frame.num_map_points() >= params.reloc_min_inliers);
    }

    #[test]
    fn test_unknown_place_fails() {
        let scene = SyntheticScene::new(300, 52);
        let other = SyntheticScene::new(300, 53);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        scene.frame_with_map_points(0, &SE3::identity(), &mut map);
        let db = database_of(&map);

        let mut frame = other.frame(3, &SE3::identity(), false);
        let params = TrackingParams::default();
        let kf = Relocalizer::new(&params).relocalize(&mut frame, &map, &db, &vocabulary);
        assert!(kf.is_none());
        assert_eq!(frame.num_map_points(), 0);
    }
}
