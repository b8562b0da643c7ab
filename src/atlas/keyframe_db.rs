//! KeyFrameDatabase - inverted index from visual words to KeyFrames.
//!
//! Used by relocalization to find KeyFrames that look like the current
//! frame. Scoring follows the usual DBoW recipe: shortlist by shared words,
//! score by L1 BoW similarity, then accumulate over covisible neighbours so a
//! whole region of the map votes together.

use std::collections::{HashMap, HashSet};

use crate::atlas::map::{KeyFrameId, Map};
use crate::vocabulary::{BowVector, OrbVocabulary};

/// Number of covisible neighbours a candidate's score is pooled with.
const COVISIBLE_POOL: usize = 10;

pub struct KeyFrameDatabase {
    /// word_id -> KeyFrames containing that word.
    inverted_file: HashMap<u32, Vec<KeyFrameId>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted_file: HashMap::new(),
        }
    }

    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word in bow.keys() {
            self.inverted_file.entry(*word).or_default().push(kf_id);
        }
    }

    pub fn erase(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        for word in bow.keys() {
            if let Some(list) = self.inverted_file.get_mut(word) {
                list.retain(|id| *id != kf_id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted_file.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.inverted_file.values().all(|l| l.is_empty())
    }

    /// Relocalization candidates for a frame's BoW vector, best group first.
    ///
    /// 1. KeyFrames sharing words with the query (live ones only).
    /// 2. Keep those sharing at least 80% of the best shared-word count.
    /// 3. Score each by L1 BoW similarity.
    /// 4. Pool each score with its best covisibles; the group is represented
    ///    by its best-scoring member.
    /// 5. Keep groups above 75% of the best pooled score.
    pub fn detect_relocalization_candidates(&self, query: &BowVector, map: &Map) -> Vec<KeyFrameId> {
        let mut shared_words: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query.keys() {
            if let Some(list) = self.inverted_file.get(word) {
                for kf_id in list {
                    *shared_words.entry(*kf_id).or_insert(0) += 1;
                }
            }
        }
        shared_words.retain(|id, _| map.get_keyframe(*id).is_some());
        let Some(&max_common) = shared_words.values().max() else {
            return Vec::new();
        };
        let min_common = (max_common as f64 * 0.8) as usize;

        let mut scores: HashMap<KeyFrameId, f64> = HashMap::new();
        for (&kf_id, &common) in &shared_words {
            if common <= min_common {
                continue;
            }
            if let Some(bow) = map.get_keyframe(kf_id).and_then(|kf| kf.bow_vector.as_ref()) {
                scores.insert(kf_id, OrbVocabulary::score(query, bow));
            }
        }
        if scores.is_empty() {
            return Vec::new();
        }

        let mut groups: Vec<(f64, KeyFrameId)> = Vec::new();
        let mut best_acc = 0.0f64;
        let mut ordered: Vec<_> = scores.iter().map(|(k, s)| (*k, *s)).collect();
        ordered.sort_by_key(|(k, _)| *k);
        for (kf_id, score) in ordered {
            let Some(kf) = map.get_keyframe(kf_id) else {
                continue;
            };
            let mut acc = score;
            let mut best = (score, kf_id);
            for neighbor in kf.best_covisibles(COVISIBLE_POOL) {
                if let Some(&s) = scores.get(&neighbor) {
                    acc += s;
                    if s > best.0 {
                        best = (s, neighbor);
                    }
                }
            }
            best_acc = best_acc.max(acc);
            groups.push((acc, best.1));
        }

        let min_score = 0.75 * best_acc;
        groups.sort_by(|a, b| b.0.total_cmp(&a.0));
        let mut seen = HashSet::new();
        groups
            .into_iter()
            .filter(|(acc, _)| *acc > min_score)
            .filter_map(|(_, kf_id)| seen.insert(kf_id).then_some(kf_id))
            .collect()
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::tracking::frame::{CameraModel, FeatureSet, KeyPoint, ScalePyramid};
    use crate::tracking::tracking_frame::{Frame, FrameCalibration};

    fn add_keyframe(map: &mut Map, db: &mut KeyFrameDatabase, words: &[(u32, f64)]) -> KeyFrameId {
        let camera = CameraModel::new(500.0, 500.0, 320.0, 240.0);
        let calib = FrameCalibration {
            bounds: camera.image_bounds(640, 480),
            camera,
            pyramid: ScalePyramid::new(8, 1.2),
            th_depth: 3.0,
        };
        let features = FeatureSet {
            keypoints: vec![KeyPoint::new(1.0, 1.0, 0)],
            descriptors: vec![[0u8; 32]],
        };
        let mut f = Frame::new(0, 0.0, features, None, &calib);
        f.set_pose(SE3::identity());
        let bow: BowVector = words.iter().copied().collect();
        f.bow = Some(bow.clone());
        let id = map.insert_keyframe(&f);
        db.add(id, &bow);
        id
    }

    #[test]
    fn test_best_match_ranks_first() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let a = add_keyframe(&mut map, &mut db, &[(1, 0.5), (2, 0.5)]);
        let _b = add_keyframe(&mut map, &mut db, &[(1, 0.1), (3, 0.9)]);
        let _c = add_keyframe(&mut map, &mut db, &[(7, 1.0)]);

        let query: BowVector = [(1, 0.5), (2, 0.5)].into_iter().collect();
        let cands = db.detect_relocalization_candidates(&query, &map);
        assert_eq!(cands, vec![a]);
    }

    #[test]
    fn test_erase_and_clear() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let bow = [(4u32, 1.0)];
        let a = add_keyframe(&mut map, &mut db, &bow);
        let query: BowVector = bow.into_iter().collect();
        assert_eq!(db.detect_relocalization_candidates(&query, &map), vec![a]);

        db.erase(a, &query);
        assert!(db.detect_relocalization_candidates(&query, &map).is_empty());

        add_keyframe(&mut map, &mut db, &bow);
        db.clear();
        assert!(db.is_empty());
    }
}
