//! Per-frame tracking output for visualization.

use crate::geometry::SE3;
use crate::tracking::frame::KeyPoint;
use crate::tracking::state::{TrackingMode, TrackingState};

/// How a feature of the processed frame is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureMatch {
    None,
    /// Matched to a point observed by keyframes.
    Map,
    /// Matched to a temporary point of the visual-odometry fallback.
    Temporal,
}

/// What the viewer gets after every frame.
#[derive(Debug, Clone)]
pub struct TrackingSnapshot {
    pub frame_id: u64,
    pub timestamp: f64,
    pub state: TrackingState,
    /// State before this frame was processed.
    pub last_processed_state: TrackingState,
    pub mode: TrackingMode,
    pub keypoints: Vec<KeyPoint>,
    /// Index aligned with `keypoints`.
    pub matches: Vec<FeatureMatch>,
    /// World-to-camera pose, when the frame has one.
    pub pose: Option<SE3>,
}

impl TrackingSnapshot {
    pub fn num_map_matches(&self) -> usize {
        self.matches.iter().filter(|m| **m == FeatureMatch::Map).count()
    }

    pub fn num_temporal_matches(&self) -> usize {
        self.matches.iter().filter(|m| **m == FeatureMatch::Temporal).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_counts() {
        let snapshot = TrackingSnapshot {
            frame_id: 3,
            timestamp: 0.15,
            state: TrackingState::Ok,
            last_processed_state: TrackingState::Lost,
            mode: TrackingMode::VisualOdometry,
            keypoints: vec![KeyPoint::new(1.0, 2.0, 0); 4],
            matches: vec![FeatureMatch::Map, FeatureMatch::None, FeatureMatch::Temporal, FeatureMatch::Map],
            pose: Some(SE3::identity()),
        };
        assert_eq!(snapshot.num_map_matches(), 2);
        assert_eq!(snapshot.num_temporal_matches(), 1);
    }
}
