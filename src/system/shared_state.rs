//! Shared state between the tracker and the mapping worker.
//!
//! The `SharedState` struct holds all data that needs to be accessed by
//! multiple threads, protected by appropriate synchronization primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::atlas::keyframe_db::KeyFrameDatabase;
use crate::atlas::map::Map;

/// Shared state accessible by the tracker and the mapping worker.
pub struct SharedState {
    /// KeyFrames and MapPoints.
    /// Read scopes for tracking queries, write scopes for structural changes.
    pub map: RwLock<Map>,

    /// Inverted index used for relocalization.
    pub keyframe_db: RwLock<KeyFrameDatabase>,

    /// Request workers to finish processing and exit.
    pub shutdown_requested: AtomicBool,
}

impl SharedState {
    /// Create a new SharedState with an empty map.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Empty the keyframe database, then the map.
    pub fn clear(&self) {
        self.keyframe_db.write().clear();
        self.map.write().clear();
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            map: RwLock::new(Map::new()),
            keyframe_db: RwLock::new(KeyFrameDatabase::new()),
            shutdown_requested: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::test_support::SyntheticScene;
    use crate::vocabulary::BowVector;

    #[test]
    fn test_clear_empties_map_and_database() {
        let shared = SharedState::new();
        let scene = SyntheticScene::new(50, 7);
        {
            let mut map = shared.map.write();
            let kf = map.insert_keyframe(&scene.frame(0, &SE3::identity(), true));
            shared.keyframe_db.write().add(kf, &BowVector::from([(0, 1.0)]));
        }
        shared.clear();
        assert_eq!(shared.map.read().num_keyframes(), 0);
        assert!(shared.keyframe_db.read().is_empty());
        assert!(!shared.is_shutdown_requested());
        shared.request_shutdown();
        assert!(shared.is_shutdown_requested());
    }
}
