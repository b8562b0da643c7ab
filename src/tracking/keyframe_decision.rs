//! KeyFrame decision and creation.
//!
//! The decision is a pure function of counters the tracker gathers, so each
//! condition can be checked in isolation. Creation promotes the current
//! frame, links its matches and, for depth sensors, seeds points for close
//! features that are not matched yet.

use tracing::debug;

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::{KeyFrameId, Map, MapPointId};
use crate::tracking::tracking_frame::Frame;
use crate::vocabulary::OrbVocabulary;

/// Close points tracked below this count, while...
const CLOSE_TRACKED_LIMIT: usize = 100;
/// ...more than this many close points are untracked, call for a KeyFrame.
const CLOSE_UNTRACKED_LIMIT: usize = 70;
/// Below this many inliers no KeyFrame is created.
const MIN_INLIERS_FOR_KEYFRAME: usize = 15;
/// A busy mapper still takes a depth KeyFrame while its queue is shorter.
const MAX_QUEUED_FOR_FORCED_INSERT: usize = 3;

/// Everything the decision depends on, snapshotted by the tracker.
#[derive(Debug, Clone, Default)]
pub struct KeyFrameDecisionInput {
    pub frame_id: u64,
    /// Frame id the last KeyFrame was created from.
    pub last_keyframe_frame_id: u64,
    pub last_reloc_frame_id: Option<u64>,
    pub min_frames: u64,
    pub max_frames: u64,

    pub num_keyframes: usize,
    /// Inliers of the last local map step.
    pub matches_inliers: usize,
    /// Points of the reference KeyFrame seen by enough KeyFrames.
    pub ref_matches: usize,
    /// Close features matched and not outliers.
    pub tracked_close: usize,
    pub untracked_close: usize,

    pub monocular: bool,
    pub only_tracking: bool,

    pub mapper_stopped: bool,
    pub mapper_stop_requested: bool,
    pub mapper_accepting: bool,
    pub mapper_queue_len: usize,
}

/// What the tracker should do with the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyFrameVerdict {
    pub insert: bool,
    /// Ask the mapper to abort its bundle adjustment so it becomes free.
    pub interrupt_ba: bool,
}

pub struct KeyFrameDecision;

impl KeyFrameDecision {
    /// Minimum observations a reference point needs to count as tracked.
    pub fn min_observations(num_keyframes: usize) -> usize {
        if num_keyframes <= 2 {
            2
        } else {
            3
        }
    }

    /// Close features of a frame, split into tracked and untracked.
    pub fn count_close_points(frame: &Frame) -> (usize, usize) {
        let th_depth = frame.calib.th_depth;
        let mut tracked = 0;
        let mut untracked = 0;
        for i in 0..frame.num_features() {
            let z = frame.depth[i];
            if z > 0.0 && z < th_depth {
                if frame.map_points[i].is_some() && !frame.outliers[i] {
                    tracked += 1;
                } else {
                    untracked += 1;
                }
            }
        }
        (tracked, untracked)
    }

    pub fn need_new_keyframe(input: &KeyFrameDecisionInput) -> KeyFrameVerdict {
        let refuse = KeyFrameVerdict::default();
        if input.only_tracking || input.mapper_stopped || input.mapper_stop_requested {
            return refuse;
        }

        let recently_relocalized = input
            .last_reloc_frame_id
            .is_some_and(|r| input.frame_id < r + input.max_frames);
        if recently_relocalized && input.num_keyframes as u64 > input.max_frames {
            return refuse;
        }

        let need_close = !input.monocular
            && input.tracked_close < CLOSE_TRACKED_LIMIT
            && input.untracked_close > CLOSE_UNTRACKED_LIMIT;

        let th_ref_ratio = if input.monocular {
            0.9
        } else if input.num_keyframes < 2 {
            0.4
        } else {
            0.75
        };

        let inliers = input.matches_inliers as f64;
        let ref_matches = input.ref_matches as f64;

        let c1a = input.frame_id >= input.last_keyframe_frame_id + input.max_frames;
        let c1b = input.frame_id >= input.last_keyframe_frame_id + input.min_frames
            && input.mapper_accepting;
        let c1c = !input.monocular && (inliers < ref_matches * 0.25 || need_close);
        let c2 = (inliers < ref_matches * th_ref_ratio || need_close)
            && input.matches_inliers > MIN_INLIERS_FOR_KEYFRAME;

        if !((c1a || c1b || c1c) && c2) {
            return refuse;
        }

        if input.mapper_accepting {
            return KeyFrameVerdict {
                insert: true,
                interrupt_ba: false,
            };
        }
        KeyFrameVerdict {
            insert: !input.monocular && input.mapper_queue_len < MAX_QUEUED_FOR_FORCED_INSERT,
            interrupt_ba: true,
        }
    }
}

/// Promote `frame` to a KeyFrame of `map`.
///
/// Every match of the frame becomes an observation. For depth sensors,
/// close features without a mapped point get a new one, nearest first;
/// the walk stops once past the close threshold with more than
/// `max_near_points` features visited. The frame's reference becomes the new
/// KeyFrame.
pub fn create_keyframe(
    frame: &mut Frame,
    map: &mut Map,
    keyframe_db: &mut KeyFrameDatabase,
    vocabulary: &OrbVocabulary,
    monocular: bool,
    max_near_points: usize,
) -> KeyFrameId {
    frame.compute_bow(vocabulary);
    let kf_id = map.insert_keyframe(frame);
    frame.reference_kf = Some(kf_id);

    for i in 0..frame.num_features() {
        if let Some(mp_id) = frame.map_points[i] {
            if !map.associate(kf_id, i, mp_id) {
                frame.map_points[i] = None;
            }
        }
    }

    let mut created: Vec<MapPointId> = Vec::new();
    if !monocular {
        let mut by_depth: Vec<(f64, usize)> = frame
            .depth
            .iter()
            .enumerate()
            .filter(|(_, &z)| z > 0.0)
            .map(|(i, &z)| (z, i))
            .collect();
        by_depth.sort_by(|a, b| a.0.total_cmp(&b.0));

        let th_depth = frame.calib.th_depth;
        let mut n_points = 0;
        for (z, i) in by_depth {
            let observed = frame.map_points[i]
                .and_then(|id| map.get_map_point(id))
                .is_some_and(|mp| mp.observations.keys().any(|k| *k != kf_id));
            if !observed {
                if let Some(stale) = frame.map_points[i].take() {
                    map.disassociate(kf_id, i);
                    debug!("Replacing unobserved point {} at feature {}", stale, i);
                }
                if let Some(x3d) = frame.unproject_stereo(i) {
                    let mp_id = map.create_map_point(x3d, frame.descriptors[i], kf_id);
                    map.associate(kf_id, i, mp_id);
                    frame.map_points[i] = Some(mp_id);
                    created.push(mp_id);
                }
            }
            n_points += 1;

            if z > th_depth && n_points > max_near_points {
                break;
            }
        }
    }

    for mp_id in &created {
        map.compute_distinctive_descriptor(*mp_id);
        map.update_normal_and_depth(*mp_id);
    }
    map.update_connections(kf_id);

    if let Some(bow) = map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector.as_ref()) {
        keyframe_db.add(kf_id, bow);
    }

    debug!(
        "KeyFrame {} from frame {}: {} new close points",
        kf_id,
        frame.id,
        created.len()
    );
    kf_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::test_support::SyntheticScene;

    fn healthy() -> KeyFrameDecisionInput {
        KeyFrameDecisionInput {
            frame_id: 40,
            last_keyframe_frame_id: 30,
            last_reloc_frame_id: None,
            min_frames: 0,
            max_frames: 20,
            num_keyframes: 10,
            matches_inliers: 200,
            ref_matches: 220,
            tracked_close: 150,
            untracked_close: 20,
            monocular: false,
            only_tracking: false,
            mapper_stopped: false,
            mapper_stop_requested: false,
            mapper_accepting: true,
            mapper_queue_len: 0,
        }
    }

    #[test]
    fn test_no_keyframe_while_tracking_well() {
        let verdict = KeyFrameDecision::need_new_keyframe(&healthy());
        assert!(!verdict.insert);
        assert!(!verdict.interrupt_ba);
    }

    #[test]
    fn test_weak_tracking_triggers_keyframe() {
        // c1b (idle mapper) and c2 (ratio below 0.75)
        let input = KeyFrameDecisionInput {
            matches_inliers: 100,
            ..healthy()
        };
        assert!(KeyFrameDecision::need_new_keyframe(&input).insert);

        // c2 alone is not enough when the mapper is busy and the queue full
        let busy = KeyFrameDecisionInput {
            mapper_accepting: false,
            mapper_queue_len: 3,
            ..input.clone()
        };
        let verdict = KeyFrameDecision::need_new_keyframe(&busy);
        assert!(!verdict.insert);
        assert!(!verdict.interrupt_ba);

        // ...but max_frames since the last keyframe (c1a) interrupts BA
        let due = KeyFrameDecisionInput {
            frame_id: 50,
            ..busy
        };
        let verdict = KeyFrameDecision::need_new_keyframe(&due);
        assert!(!verdict.insert);
        assert!(verdict.interrupt_ba);
    }

    #[test]
    fn test_busy_mapper_takes_depth_keyframe_with_short_queue() {
        let input = KeyFrameDecisionInput {
            frame_id: 50,
            matches_inliers: 100,
            mapper_accepting: false,
            mapper_queue_len: 1,
            ..healthy()
        };
        let verdict = KeyFrameDecision::need_new_keyframe(&input);
        assert!(verdict.insert);
        assert!(verdict.interrupt_ba);

        let mono = KeyFrameDecisionInput {
            monocular: true,
            ..input
        };
        assert!(!KeyFrameDecision::need_new_keyframe(&mono).insert);
    }

    #[test]
    fn test_close_points_trigger_keyframe() {
        let input = KeyFrameDecisionInput {
            tracked_close: 60,
            untracked_close: 90,
            ..healthy()
        };
        assert!(KeyFrameDecision::need_new_keyframe(&input).insert);
    }

    #[test]
    fn test_refusals() {
        let weak = KeyFrameDecisionInput {
            matches_inliers: 100,
            ..healthy()
        };
        for input in [
            KeyFrameDecisionInput {
                only_tracking: true,
                ..weak.clone()
            },
            KeyFrameDecisionInput {
                mapper_stopped: true,
                ..weak.clone()
            },
            KeyFrameDecisionInput {
                mapper_stop_requested: true,
                ..weak.clone()
            },
            KeyFrameDecisionInput {
                num_keyframes: 30,
                last_reloc_frame_id: Some(35),
                ..weak.clone()
            },
            KeyFrameDecisionInput {
                matches_inliers: 15,
                ..weak.clone()
            },
        ] {
            assert_eq!(KeyFrameDecision::need_new_keyframe(&input), KeyFrameVerdict::default());
        }
    }

    #[test]
    fn test_min_observations() {
        assert_eq!(KeyFrameDecision::min_observations(1), 2);
        assert_eq!(KeyFrameDecision::min_observations(2), 2);
        assert_eq!(KeyFrameDecision::min_observations(3), 3);
    }

    #[test]
    fn test_create_keyframe_links_matches_and_close_points() {
        let scene = SyntheticScene::new(250, 41);
        let vocabulary = scene.vocabulary();
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let first = scene.frame_with_map_points(0, &SE3::identity(), &mut map);
        let first_kf = first.reference_kf.unwrap();

        let mut frame = scene.frame(1, &SE3::identity(), true);
        frame.set_pose(SE3::identity());
        // Half of the features keep their match to the first keyframe
        let n = frame.num_features();
        for i in 0..n / 2 {
            frame.map_points[i] = first.map_points[i];
        }

        let before = map.num_map_points();
        let kf_id = create_keyframe(&mut frame, &mut map, &mut db, &vocabulary, false, 100);

        assert_eq!(frame.reference_kf, Some(kf_id));
        let kf = map.get_keyframe(kf_id).unwrap();
        for i in 0..n / 2 {
            assert_eq!(kf.get_map_point(i), first.map_points[i]);
        }
        assert!(map.num_map_points() > before);
        assert!(kf.covisibility_weight(first_kf) >= n / 2);
        assert_eq!(kf.parent_id, Some(first_kf));
        assert!(!db.is_empty());
    }
}
