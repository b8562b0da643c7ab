//! ORB descriptor matching for tracking.
//!
//! Four flavours are used by the tracker:
//! - projection of local map points into the current frame;
//! - projection of the last frame's points (motion model);
//! - BoW-grouped matching against a KeyFrame (reference/relocalization);
//! - projection of a KeyFrame's points for relocalization refinement;
//!
//! plus the windowed frame-to-frame search of monocular initialization.
//! All of them optionally filter matches whose keypoint orientation change
//! disagrees with the dominant rotation.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector2;

use crate::atlas::map::{KeyFrame, Map, MapPointId};
use crate::tracking::frame::{descriptor_distance, KeyPoint};
use crate::tracking::tracking_frame::{Frame, FrustumProjection};

/// Max descriptor distance for acceptance.
pub const TH_HIGH: u32 = 100;
/// Stricter threshold for BoW and initialization matching.
pub const TH_LOW: u32 = 50;
pub const HISTO_LENGTH: usize = 30;

/// Histogram of keypoint orientation differences.
///
/// Only the three most populated bins survive, and the second and third
/// only when they hold at least a tenth of the first.
struct RotationHistogram {
    bins: Vec<Vec<usize>>,
}

impl RotationHistogram {
    fn new() -> Self {
        Self {
            bins: vec![Vec::new(); HISTO_LENGTH],
        }
    }

    fn add(&mut self, kp1: &KeyPoint, kp2: &KeyPoint, idx: usize) {
        let mut rot = kp1.angle - kp2.angle;
        if rot < 0.0 {
            rot += 360.0;
        }
        let mut bin = (rot / HISTO_LENGTH as f64).round() as usize;
        if bin >= HISTO_LENGTH {
            bin = 0;
        }
        self.bins[bin].push(idx);
    }

    fn three_maxima(&self) -> [Option<usize>; 3] {
        let mut order: Vec<usize> = (0..HISTO_LENGTH).collect();
        // Stable: ties keep the lower bin first
        order.sort_by(|&a, &b| self.bins[b].len().cmp(&self.bins[a].len()));
        let max1 = self.bins[order[0]].len();
        let keep = |bin: usize| {
            let n = self.bins[bin].len();
            (n > 0 && n as f64 >= 0.1 * max1 as f64).then_some(bin)
        };
        [keep(order[0]), keep(order[1]), keep(order[2])]
    }

    /// Indices recorded outside the dominant bins.
    fn inconsistent(&self) -> Vec<usize> {
        let maxima = self.three_maxima();
        (0..HISTO_LENGTH)
            .filter(|bin| !maxima.contains(&Some(*bin)))
            .flat_map(|bin| self.bins[bin].iter().copied())
            .collect()
    }
}

/// Search radius factor from the viewing angle of a point.
fn radius_by_viewing_cos(view_cos: f64) -> f64 {
    if view_cos > 0.998 {
        2.5
    } else {
        4.0
    }
}

/// Whether feature `idx` already holds a match to a point that keyframes
/// observe. Matches to erased or temporal points may be overwritten.
fn is_taken(frame: &Frame, idx: usize, map: &Map) -> bool {
    frame.map_points[idx]
        .and_then(|id| map.get_map_point(id))
        .is_some_and(|mp| mp.num_observations() > 0)
}

pub struct OrbMatcher {
    nn_ratio: f64,
    check_orientation: bool,
}

impl OrbMatcher {
    pub fn new(nn_ratio: f64, check_orientation: bool) -> Self {
        Self {
            nn_ratio,
            check_orientation,
        }
    }

    /// Match local map points, already checked against the frustum, into
    /// `frame`. `th` scales the search radius. Returns the number of new
    /// matches.
    pub fn search_by_projection_local(
        &self,
        frame: &mut Frame,
        candidates: &[(MapPointId, FrustumProjection)],
        th: f64,
        map: &Map,
    ) -> usize {
        let mut matches = 0;
        for (mp_id, proj) in candidates {
            let Some(mp) = map.get_map_point(*mp_id) else {
                continue;
            };
            let level = proj.level;
            let mut r = radius_by_viewing_cos(proj.view_cos);
            if th != 1.0 {
                r *= th;
            }
            let scale = frame.pyramid().scale_factors[frame.pyramid().level(level)];
            let indices = frame.features_in_area(proj.u, proj.v, r * scale, Some(level - 1), Some(level));
            if indices.is_empty() {
                continue;
            }

            let mut best = (u32::MAX, -1i32, None::<usize>);
            let mut second = (u32::MAX, -1i32);
            for idx in indices {
                if is_taken(frame, idx, map) {
                    continue;
                }
                if frame.has_stereo(idx) && (proj.u_right - frame.u_right[idx]).abs() > r * scale {
                    continue;
                }
                let dist = descriptor_distance(&mp.descriptor, &frame.descriptors[idx]);
                let octave = frame.keypoints_un[idx].octave;
                if dist < best.0 {
                    second = (best.0, best.1);
                    best = (dist, octave, Some(idx));
                } else if dist < second.0 {
                    second = (dist, octave);
                }
            }

            let Some(best_idx) = best.2 else {
                continue;
            };
            if best.0 > TH_HIGH {
                continue;
            }
            // Ratio test only between candidates of the same level
            if best.1 == second.1 && best.0 as f64 > self.nn_ratio * second.0 as f64 {
                continue;
            }
            frame.map_points[best_idx] = Some(*mp_id);
            matches += 1;
        }
        matches
    }

    /// Project the last frame's matched points into `current`, whose pose
    /// must be set. For depth sensors the search levels follow the camera's
    /// motion along its optical axis.
    pub fn search_by_projection_last_frame(
        &self,
        current: &mut Frame,
        last: &Frame,
        th: f64,
        monocular: bool,
        map: &Map,
    ) -> usize {
        let (Some(pose_cw), Some(last_pose)) = (current.pose_cw, last.pose_cw) else {
            return 0;
        };
        let camera = *current.camera();
        let twc = pose_cw.camera_center();
        let tlc = last_pose.transform_point(&twc);
        let forward = !monocular && tlc.z > camera.baseline;
        let backward = !monocular && -tlc.z > camera.baseline;

        let mut histogram = RotationHistogram::new();
        let mut matches = 0;

        for (i, mp_id) in last.map_points.iter().enumerate() {
            let Some(mp_id) = *mp_id else {
                continue;
            };
            if last.outliers[i] {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };

            let pc = pose_cw.transform_point(&mp.position);
            if pc.z <= 0.0 {
                continue;
            }
            let uv = camera.project(&pc);
            if !current.calib.bounds.contains(uv.x, uv.y) {
                continue;
            }

            let last_octave = last.keypoints_un[i].octave;
            let radius = th * current.pyramid().scale_factors[current.pyramid().level(last_octave)];
            let indices = if forward {
                current.features_in_area(uv.x, uv.y, radius, Some(last_octave), None)
            } else if backward {
                current.features_in_area(uv.x, uv.y, radius, Some(0), Some(last_octave))
            } else {
                current.features_in_area(uv.x, uv.y, radius, Some(last_octave - 1), Some(last_octave + 1))
            };

            let mut best = (u32::MAX, None::<usize>);
            for idx in indices {
                if is_taken(current, idx, map) {
                    continue;
                }
                if current.has_stereo(idx) {
                    let ur = uv.x - camera.bf() / pc.z;
                    if (ur - current.u_right[idx]).abs() > radius {
                        continue;
                    }
                }
                let dist = descriptor_distance(&mp.descriptor, &current.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, Some(idx));
                }
            }

            if let (dist, Some(idx)) = best {
                if dist <= TH_HIGH {
                    current.map_points[idx] = Some(mp_id);
                    matches += 1;
                    if self.check_orientation {
                        histogram.add(&last.keypoints_un[i], &current.keypoints_un[idx], idx);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.inconsistent() {
                current.map_points[idx] = None;
                matches -= 1;
            }
        }
        matches
    }

    /// Match a KeyFrame's points to the frame's features within shared
    /// vocabulary nodes. Without feature vectors on either side, all
    /// features form a single group.
    ///
    /// Returns the match count and, per frame feature, the matched point.
    pub fn search_by_bow(&self, kf: &KeyFrame, frame: &Frame, map: &Map) -> (usize, Vec<Option<MapPointId>>) {
        let mut result = vec![None; frame.num_features()];
        let mut histogram = RotationHistogram::new();
        let mut matches = 0;

        let groups: Vec<(Vec<usize>, Vec<usize>)> = match (&kf.feature_vector, &frame.feature_vector) {
            (Some(fv_kf), Some(fv_f)) if !fv_kf.is_empty() && !fv_f.is_empty() => {
                let mut nodes: Vec<_> = fv_kf.keys().filter(|n| fv_f.contains_key(n)).copied().collect();
                nodes.sort_unstable();
                nodes
                    .into_iter()
                    .map(|n| (fv_kf[&n].clone(), fv_f[&n].clone()))
                    .collect()
            }
            _ => vec![((0..kf.num_features()).collect(), (0..frame.num_features()).collect())],
        };

        for (kf_indices, f_indices) in groups {
            for idx_kf in kf_indices {
                let Some(mp_id) = kf.get_map_point(idx_kf) else {
                    continue;
                };
                if map.get_map_point(mp_id).is_none() {
                    continue;
                }
                let d_kf = &kf.descriptors[idx_kf];

                let mut best = (u32::MAX, None::<usize>);
                let mut second = u32::MAX;
                for &idx_f in &f_indices {
                    if result[idx_f].is_some() {
                        continue;
                    }
                    let dist = descriptor_distance(d_kf, &frame.descriptors[idx_f]);
                    if dist < best.0 {
                        second = best.0;
                        best = (dist, Some(idx_f));
                    } else if dist < second {
                        second = dist;
                    }
                }

                let (dist, Some(idx_f)) = best else {
                    continue;
                };
                if dist <= TH_LOW && (dist as f64) < self.nn_ratio * second as f64 {
                    result[idx_f] = Some(mp_id);
                    matches += 1;
                    if self.check_orientation {
                        histogram.add(&kf.keypoints[idx_kf], &frame.keypoints[idx_f], idx_f);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.inconsistent() {
                result[idx] = None;
                matches -= 1;
            }
        }
        (matches, result)
    }

    /// Project a KeyFrame's points not in `already_found` into `frame`,
    /// accepting the nearest descriptor within `orb_dist`.
    pub fn search_by_projection_keyframe(
        &self,
        frame: &mut Frame,
        kf: &KeyFrame,
        already_found: &HashSet<MapPointId>,
        th: f64,
        orb_dist: u32,
        map: &Map,
    ) -> usize {
        let Some(pose_cw) = frame.pose_cw else {
            return 0;
        };
        let center = pose_cw.camera_center();
        let camera = *frame.camera();
        let mut histogram = RotationHistogram::new();
        let mut matches = 0;

        for (i, mp_id) in kf.map_point_indices() {
            if already_found.contains(&mp_id) {
                continue;
            }
            let Some(mp) = map.get_map_point(mp_id) else {
                continue;
            };

            let pc = pose_cw.transform_point(&mp.position);
            if pc.z <= 0.0 {
                continue;
            }
            let uv = camera.project(&pc);
            if !frame.calib.bounds.contains(uv.x, uv.y) {
                continue;
            }
            let dist3d = (mp.position - center).norm();
            if dist3d < mp.min_distance_invariance() || dist3d > mp.max_distance_invariance() {
                continue;
            }

            let level = mp.predict_scale(dist3d, frame.pyramid());
            let radius = th * frame.pyramid().scale_factors[frame.pyramid().level(level)];
            let indices = frame.features_in_area(uv.x, uv.y, radius, Some(level - 1), Some(level + 1));

            let mut best = (u32::MAX, None::<usize>);
            for idx in indices {
                if frame.map_points[idx].is_some() {
                    continue;
                }
                let dist = descriptor_distance(&mp.descriptor, &frame.descriptors[idx]);
                if dist < best.0 {
                    best = (dist, Some(idx));
                }
            }

            if let (dist, Some(idx)) = best {
                if dist <= orb_dist {
                    frame.map_points[idx] = Some(mp_id);
                    matches += 1;
                    if self.check_orientation {
                        histogram.add(&kf.keypoints_un[i], &frame.keypoints_un[idx], idx);
                    }
                }
            }
        }

        if self.check_orientation {
            for idx in histogram.inconsistent() {
                if frame.map_points[idx].take().is_some() {
                    matches -= 1;
                }
            }
        }
        matches
    }

    /// Frame-to-frame matching of level-0 keypoints for monocular
    /// initialization.
    ///
    /// `prev_matched[i]` is where keypoint `i` of `f1` was last seen and
    /// is updated with the new match positions. Returns the match count and
    /// `matches12[i]` = index in `f2`.
    pub fn search_for_initialization(
        &self,
        f1: &Frame,
        f2: &Frame,
        prev_matched: &mut [Vector2<f64>],
        window: f64,
    ) -> (usize, Vec<Option<usize>>) {
        let mut matches12: Vec<Option<usize>> = vec![None; f1.num_features()];
        let mut matches21: HashMap<usize, usize> = HashMap::new();
        let mut matched_distance = vec![u32::MAX; f2.num_features()];
        let mut histogram = RotationHistogram::new();
        let mut matches = 0usize;

        for (i1, kp1) in f1.keypoints_un.iter().enumerate() {
            if kp1.octave > 0 {
                continue;
            }
            let p = prev_matched[i1];
            let indices = f2.features_in_area(p.x, p.y, window, Some(kp1.octave), Some(kp1.octave));
            if indices.is_empty() {
                continue;
            }

            let d1 = &f1.descriptors[i1];
            let mut best = (u32::MAX, None::<usize>);
            let mut second = u32::MAX;
            for i2 in indices {
                let dist = descriptor_distance(d1, &f2.descriptors[i2]);
                if matched_distance[i2] <= dist {
                    continue;
                }
                if dist < best.0 {
                    second = best.0;
                    best = (dist, Some(i2));
                } else if dist < second {
                    second = dist;
                }
            }

            let (dist, Some(i2)) = best else {
                continue;
            };
            if dist <= TH_LOW && (dist as f64) < self.nn_ratio * second as f64 {
                if let Some(prev_i1) = matches21.insert(i2, i1) {
                    matches12[prev_i1] = None;
                    matches -= 1;
                }
                matches12[i1] = Some(i2);
                matched_distance[i2] = dist;
                matches += 1;
                if self.check_orientation {
                    histogram.add(kp1, &f2.keypoints_un[i2], i1);
                }
            }
        }

        if self.check_orientation {
            for i1 in histogram.inconsistent() {
                if matches12[i1].take().is_some() {
                    matches -= 1;
                }
            }
        }

        for (i1, m) in matches12.iter().enumerate() {
            if let Some(i2) = m {
                let kp = &f2.keypoints_un[*i2];
                prev_matched[i1] = Vector2::new(kp.x, kp.y);
            }
        }

        (matches, matches12)
    }
}
