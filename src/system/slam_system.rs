//! SLAM System - Main entry point and thread orchestration.
//!
//! The `SlamSystem` is the top-level struct that users interact with.
//! It owns the shared state, runs the tracker on the caller's thread and
//! spawns the Local Mapping thread.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use image::DynamicImage;
use tracing::info;

use crate::config::{Sensor, TrackerSettings, TrackingParams};
use crate::geometry::SE3;
use crate::local_mapping::LocalMapper;
use crate::tracking::frame::{DepthImage, Extractors};
use crate::tracking::trajectory::{write_tum, CameraPose};
use crate::tracking::Tracker;
use crate::vocabulary::OrbVocabulary;

use super::collaborators::{FrameViewer, LocalMapping, LoopClosing};
use super::shared_state::SharedState;

/// Mode changes requested by the caller, applied before the next frame.
#[derive(Debug, Default)]
struct PendingRequests {
    activate_localization: bool,
    deactivate_localization: bool,
    reset: bool,
}

/// Main SLAM system orchestrating Tracking and Local Mapping.
pub struct SlamSystem {
    /// Shared state (map, keyframe database, flags) accessible by all threads.
    shared: Arc<SharedState>,

    /// The tracker runs in the calling thread.
    tracker: Tracker,

    local_mapper: Arc<LocalMapper>,

    /// Handle to the Local Mapping thread.
    local_mapping_handle: Option<JoinHandle<()>>,

    pending: PendingRequests,
}

impl SlamSystem {
    /// Create the system and spawn the Local Mapping thread.
    pub fn new(
        settings: TrackerSettings,
        params: TrackingParams,
        extractors: Extractors,
        vocabulary: Arc<OrbVocabulary>,
    ) -> Result<Self> {
        let shared = SharedState::new();
        let local_mapper = LocalMapper::new(shared.clone(), settings.sensor == Sensor::Monocular);
        let local_mapping_handle = local_mapper.spawn()?;

        info!("Input sensor: {:?}", settings.sensor);
        let tracker = Tracker::new(
            settings,
            params,
            extractors,
            vocabulary,
            shared.clone(),
            local_mapper.clone(),
        )?;

        Ok(Self {
            shared,
            tracker,
            local_mapper,
            local_mapping_handle: Some(local_mapping_handle),
            pending: PendingRequests::default(),
        })
    }

    /// Route processed keyframes to loop closing. Must happen before the
    /// first frame.
    pub fn wire_loop_closing(&mut self, loop_closer: Arc<dyn LoopClosing>) -> Result<()> {
        self.tracker.wire_loop_closing(loop_closer.clone())?;
        self.local_mapper.set_loop_closer(loop_closer);
        Ok(())
    }

    pub fn wire_viewer(&mut self, viewer: Arc<dyn FrameViewer>) -> Result<()> {
        self.tracker.wire_viewer(viewer)
    }

    pub fn track_stereo(&mut self, left: &DynamicImage, right: &DynamicImage, timestamp: f64) -> Result<Option<SE3>> {
        self.apply_pending();
        self.tracker.track_stereo(left, right, timestamp)
    }

    pub fn track_rgbd(&mut self, color: &DynamicImage, depth: &DepthImage, timestamp: f64) -> Result<Option<SE3>> {
        self.apply_pending();
        self.tracker.track_rgbd(color, depth, timestamp)
    }

    pub fn track_monocular(&mut self, image: &DynamicImage, timestamp: f64) -> Result<Option<SE3>> {
        self.apply_pending();
        self.tracker.track_monocular(image, timestamp)
    }

    /// Stop extending the map and only localize in it, from the next frame.
    pub fn activate_localization_mode(&mut self) {
        self.pending.activate_localization = true;
    }

    pub fn deactivate_localization_mode(&mut self) {
        self.pending.deactivate_localization = true;
    }

    /// Clear the map before the next frame.
    pub fn request_reset(&mut self) {
        self.pending.reset = true;
    }

    fn apply_pending(&mut self) {
        if std::mem::take(&mut self.pending.activate_localization) {
            self.local_mapper.request_stop();
            while !self.local_mapper.is_stopped() && !self.shared.is_shutdown_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            self.tracker.inform_only_tracking(true);
        }
        if std::mem::take(&mut self.pending.deactivate_localization) {
            self.tracker.inform_only_tracking(false);
            self.local_mapper.release();
        }
        if std::mem::take(&mut self.pending.reset) {
            self.tracker.reset();
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Get a reference to the shared state for visualization.
    pub fn shared_state(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Camera poses of every processed frame, against the current map.
    pub fn camera_trajectory(&self) -> Vec<CameraPose> {
        let map = self.shared.map.read();
        self.tracker.trajectory().reconstruct(&map)
    }

    /// Write the tracked camera poses in TUM format. Returns the number of
    /// lines written.
    pub fn save_trajectory_tum<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let path = path.as_ref();
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        let written = write_tum(&self.camera_trajectory(), BufWriter::new(file))?;
        info!("Trajectory saved to {} ({} poses)", path.display(), written);
        Ok(written)
    }

    /// Shutdown the system gracefully.
    ///
    /// Signals the Local Mapping thread to finish and waits for it.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        // The worker sees the flag within one receive timeout
        if let Some(handle) = self.local_mapping_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlamSystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{blank_image, test_settings, ScriptedExtractor, SyntheticScene};
    use crate::tracking::state::{TrackingMode, TrackingState};
    use nalgebra::{UnitQuaternion, Vector3};

    fn stereo_system(scene: &SyntheticScene, poses: &[SE3]) -> SlamSystem {
        let (left, right): (Vec<_>, Vec<_>) = poses.iter().map(|p| scene.stereo_features(p)).unzip();
        SlamSystem::new(
            test_settings(Sensor::Stereo),
            TrackingParams::default(),
            Extractors {
                left: Box::new(ScriptedExtractor::new(left)),
                right: Some(Box::new(ScriptedExtractor::new(right))),
                init: None,
            },
            Arc::new(scene.vocabulary()),
        )
        .unwrap()
    }

    fn poses(n: usize) -> Vec<SE3> {
        (0..n)
            .map(|i| SE3::new(UnitQuaternion::identity(), Vector3::new(0.01 * i as f64, 0.0, 0.0)))
            .collect()
    }

    #[test]
    fn test_localization_mode_stops_mapping() {
        let scene = SyntheticScene::new(700, 101);
        let mut system = stereo_system(&scene, &poses(3));
        let image = blank_image();

        system.track_stereo(&image, &image, 0.0).unwrap();
        assert_eq!(system.tracker().state(), TrackingState::Ok);

        system.activate_localization_mode();
        system.track_stereo(&image, &image, 0.05).unwrap();
        assert!(system.local_mapper.is_stopped());
        assert!(system.tracker().mode().only_tracking());

        system.deactivate_localization_mode();
        system.track_stereo(&image, &image, 0.1).unwrap();
        assert!(!system.local_mapper.is_stopped());
        assert_eq!(system.tracker().mode(), TrackingMode::Slam);
        system.shutdown();
    }

    #[test]
    fn test_saves_tum_trajectory() {
        let scene = SyntheticScene::new(700, 102);
        let mut system = stereo_system(&scene, &poses(3));
        let image = blank_image();
        for i in 0..3 {
            system.track_stereo(&image, &image, i as f64 * 0.05).unwrap();
        }
        assert_eq!(system.camera_trajectory().len(), 3);

        let path = std::env::temp_dir().join(format!("vslam_tracker_tum_{}.txt", std::process::id()));
        let written = system.save_trajectory_tum(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(written, 3);
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_reset_applies_before_next_frame() {
        let scene = SyntheticScene::new(700, 103);
        let mut system = stereo_system(&scene, &[SE3::identity(), SE3::identity()]);
        let image = blank_image();

        system.track_stereo(&image, &image, 0.0).unwrap();
        system.request_reset();
        // The reset runs first, so this frame initializes a fresh map
        system.track_stereo(&image, &image, 0.05).unwrap();
        assert_eq!(system.tracker().state(), TrackingState::Ok);
        assert_eq!(system.tracker().trajectory().len(), 1);
        assert_eq!(system.shared_state().map.read().num_keyframes(), 1);
        system.shutdown();
    }
}
