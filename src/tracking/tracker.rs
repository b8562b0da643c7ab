//! Main tracker: orchestrates frame processing and pose estimation.
//!
//! Each input frame runs to completion on the caller's thread:
//! - build the frame (features, stereo or RGB-D depth);
//! - initialize the map, track, or relocalize depending on the state;
//! - refine the pose against the local map;
//! - decide whether the frame becomes a KeyFrame for the mapping worker;
//! - append one trajectory record.
//!
//! The map is shared with the mapping worker through `SharedState`. Reads
//! happen under short `map.read()` scopes, structural changes under
//! `map.write()`; no lock is held between frames.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use tracing::{debug, info, warn};

use crate::atlas::map::{KeyFrameId, MapPointId};
use crate::config::{Sensor, TrackerSettings, TrackingParams};
use crate::geometry::SE3;
use crate::system::collaborators::{FrameViewer, LocalMapping, LoopClosing};
use crate::system::shared_state::SharedState;
use crate::tracking::frame::{DepthImage, Extractors, FrameBuilder};
use crate::tracking::initializer::{initialize_stereo, InitializedMap, MonocularInitializer};
use crate::tracking::keyframe_decision::{create_keyframe, KeyFrameDecision, KeyFrameDecisionInput, KeyFrameVerdict};
use crate::tracking::local_map::{apply_counters, is_tracked, LocalMapTracker, LocalSearchParams};
use crate::tracking::motion_model::MotionModel;
use crate::tracking::pose_estimation::{
    create_temporal_points, track_reference_keyframe, track_with_motion_model, update_last_frame_pose,
};
use crate::tracking::relocalization::Relocalizer;
use crate::tracking::result::{FeatureMatch, TrackingSnapshot};
use crate::tracking::state::{TrackingEvent, TrackingMode, TrackingState};
use crate::tracking::tracking_frame::Frame;
use crate::tracking::trajectory::Trajectory;
use crate::vocabulary::OrbVocabulary;

/// Frames after a relocalization during which the local search is widened.
const RELOC_WIDE_SEARCH_FRAMES: u64 = 2;

/// Main tracking structure.
pub struct Tracker {
    settings: TrackerSettings,
    params: TrackingParams,
    builder: FrameBuilder,

    /// Map and KeyFrame database, shared with the workers.
    shared: Arc<SharedState>,
    vocabulary: Arc<OrbVocabulary>,

    mapper: Arc<dyn LocalMapping>,
    loop_closer: Option<Arc<dyn LoopClosing>>,
    viewer: Option<Arc<dyn FrameViewer>>,

    state: TrackingState,
    /// State at the start of the last processed frame.
    last_processed_state: TrackingState,
    mode: TrackingMode,

    /// Most recently processed frame.
    last_frame: Option<Frame>,
    mono_initializer: MonocularInitializer,
    motion: MotionModel,
    local_map: LocalMapTracker,

    reference_kf: Option<KeyFrameId>,
    last_keyframe: Option<KeyFrameId>,
    last_keyframe_frame_id: u64,
    last_reloc_frame_id: Option<u64>,
    /// Inliers of the last local map step.
    matches_inliers: usize,

    /// Points created for the last frame in localization mode, erased after
    /// the current one is tracked.
    temporal_points: Vec<MapPointId>,
    trajectory: Trajectory,

    /// Set by the first frame and never cleared; wiring is refused after it.
    started: bool,
}

impl Tracker {
    pub fn new(
        settings: TrackerSettings,
        params: TrackingParams,
        extractors: Extractors,
        vocabulary: Arc<OrbVocabulary>,
        shared: Arc<SharedState>,
        mapper: Arc<dyn LocalMapping>,
    ) -> Result<Self> {
        let builder = FrameBuilder::new(&settings, extractors).context("Failed to set up frame builder")?;
        let max_local_keyframes = params.max_local_keyframes;

        let mut tracker = Self {
            settings,
            params,
            builder,
            shared,
            vocabulary,
            mapper,
            loop_closer: None,
            viewer: None,
            state: TrackingState::SystemNotReady,
            last_processed_state: TrackingState::SystemNotReady,
            mode: TrackingMode::Slam,
            last_frame: None,
            mono_initializer: MonocularInitializer::new(),
            motion: MotionModel::new(),
            local_map: LocalMapTracker::new(max_local_keyframes),
            reference_kf: None,
            last_keyframe: None,
            last_keyframe_frame_id: 0,
            last_reloc_frame_id: None,
            matches_inliers: 0,
            temporal_points: Vec::new(),
            trajectory: Trajectory::new(),
            started: false,
        };
        tracker.transition(TrackingEvent::ConstructionComplete);
        Ok(tracker)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wiring and configuration
    // ─────────────────────────────────────────────────────────────────────────

    pub fn wire_loop_closing(&mut self, loop_closer: Arc<dyn LoopClosing>) -> Result<()> {
        if self.started {
            bail!("loop closing must be wired before the first frame");
        }
        if self.loop_closer.is_some() {
            bail!("loop closing is already wired");
        }
        self.loop_closer = Some(loop_closer);
        Ok(())
    }

    pub fn wire_viewer(&mut self, viewer: Arc<dyn FrameViewer>) -> Result<()> {
        if self.started {
            bail!("viewer must be wired before the first frame");
        }
        if self.viewer.is_some() {
            bail!("viewer is already wired");
        }
        self.viewer = Some(viewer);
        Ok(())
    }

    /// Reload calibration from a settings file. Frames built afterwards use
    /// the new camera.
    pub fn change_calibration<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let settings = TrackerSettings::from_file(path.as_ref(), self.settings.sensor)
            .with_context(|| format!("Failed to reload calibration from {}", path.as_ref().display()))?;
        self.builder.set_calibration(&settings);
        self.settings = settings;
        info!("Calibration reloaded from {}", path.as_ref().display());
        Ok(())
    }

    /// Switch between full SLAM and localization against a fixed map.
    pub fn inform_only_tracking(&mut self, only_tracking: bool) {
        self.mode = if only_tracking {
            TrackingMode::Localization
        } else {
            TrackingMode::Slam
        };
        info!("Tracking mode: {:?}", self.mode);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry points
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a rectified stereo pair. Returns the world-to-camera pose when
    /// the frame got one.
    pub fn track_stereo(&mut self, left: &DynamicImage, right: &DynamicImage, timestamp: f64) -> Result<Option<SE3>> {
        let frame = self.builder.build_stereo(left, right, timestamp)?;
        Ok(self.track(frame))
    }

    /// Track a color image with its registered depth map (raw samples).
    pub fn track_rgbd(&mut self, color: &DynamicImage, depth: &DepthImage, timestamp: f64) -> Result<Option<SE3>> {
        let frame = self.builder.build_rgbd(color, depth, timestamp)?;
        Ok(self.track(frame))
    }

    pub fn track_monocular(&mut self, image: &DynamicImage, timestamp: f64) -> Result<Option<SE3>> {
        let initializing = matches!(
            self.state,
            TrackingState::NoImagesYet | TrackingState::NotInitialized
        );
        let frame = self.builder.build_monocular(image, timestamp, initializing)?;
        Ok(self.track(frame))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn last_processed_state(&self) -> TrackingState {
        self.last_processed_state
    }

    pub fn mode(&self) -> TrackingMode {
        self.mode
    }

    pub fn sensor(&self) -> Sensor {
        self.settings.sensor
    }

    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn local_map(&self) -> &LocalMapTracker {
        &self.local_map
    }

    pub fn motion_model(&self) -> &MotionModel {
        &self.motion
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.reference_kf
    }

    pub fn last_keyframe(&self) -> Option<KeyFrameId> {
        self.last_keyframe
    }

    pub fn last_reloc_frame_id(&self) -> Option<u64> {
        self.last_reloc_frame_id
    }

    pub fn matches_inliers(&self) -> usize {
        self.matches_inliers
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Per-frame pipeline
    // ─────────────────────────────────────────────────────────────────────────

    fn track(&mut self, mut frame: Frame) -> Option<SE3> {
        self.started = true;
        if self.state == TrackingState::NoImagesYet {
            self.transition(TrackingEvent::FirstFrame);
        }
        self.last_processed_state = self.state;

        let reset_needed = if self.state == TrackingState::NotInitialized {
            self.initialize(&mut frame);
            false
        } else {
            self.track_initialized(&mut frame)
        };

        if frame.reference_kf.is_none() {
            frame.reference_kf = self.reference_kf;
        }
        // Predictions and rejected hypotheses are not a pose
        if self.state != TrackingState::Ok {
            frame.pose_cw = None;
        }
        self.record_trajectory(&frame);
        self.publish(&frame);

        let pose = frame.pose_cw;
        self.last_frame = Some(frame);

        if reset_needed {
            info!("Track lost soon after initialisation, resetting");
            self.reset();
        }
        pose
    }

    fn initialize(&mut self, frame: &mut Frame) {
        let init = if self.settings.sensor == Sensor::Monocular {
            let mut map = self.shared.map.write();
            self.mono_initializer
                .try_initialize(frame, &mut map, &self.vocabulary, &self.params)
        } else {
            let mut map = self.shared.map.write();
            initialize_stereo(frame, &mut map, &self.vocabulary, &self.params)
        };

        match init {
            Some(init) => {
                self.on_initialized(frame, init);
                self.transition(TrackingEvent::InitializationSucceeded);
            }
            None => self.transition(TrackingEvent::InitializationFailed),
        }
    }

    /// Register a freshly initialized map with the database, the mapping
    /// worker and the local map.
    fn on_initialized(&mut self, frame: &Frame, init: InitializedMap) {
        {
            let map = self.shared.map.read();
            let mut keyframe_db = self.shared.keyframe_db.write();
            for kf_id in &init.keyframes {
                if let Some(bow) = map.get_keyframe(*kf_id).and_then(|kf| kf.bow_vector.as_ref()) {
                    keyframe_db.add(*kf_id, bow);
                }
            }
        }
        for kf_id in &init.keyframes {
            self.mapper.insert_keyframe(*kf_id);
        }

        let reference = init.reference();
        self.local_map.set(init.keyframes, init.points);
        self.reference_kf = reference;
        self.last_keyframe = reference;
        self.last_keyframe_frame_id = frame.id;
    }

    /// Track a frame once a map exists. Returns whether the system must be
    /// reset after bookkeeping.
    fn track_initialized(&mut self, frame: &mut Frame) -> bool {
        let was_lost = self.state == TrackingState::Lost;
        self.check_replaced_in_last_frame();

        let mut ok = if self.mode.only_tracking() {
            self.track_localization(frame)
        } else if was_lost {
            self.relocalize(frame)
        } else {
            let just_relocalized = self
                .last_reloc_frame_id
                .is_some_and(|r| frame.id < r + RELOC_WIDE_SEARCH_FRAMES);
            if !self.motion.is_set() || just_relocalized {
                self.track_reference_keyframe(frame)
            } else {
                self.track_with_motion_model(frame) || self.track_reference_keyframe(frame)
            }
        };

        frame.reference_kf = self.reference_kf;

        if ok && self.mode != TrackingMode::VisualOdometry {
            ok = self.track_local_map(frame);
        }

        let event = match (was_lost, ok) {
            (true, true) => TrackingEvent::RelocalizationSucceeded,
            (true, false) => TrackingEvent::RelocalizationFailed,
            (false, true) => TrackingEvent::TrackingSucceeded,
            (false, false) => TrackingEvent::TrackingFailed,
        };
        self.transition(event);

        if ok && !was_lost {
            match (frame.pose_cw, self.last_frame.as_ref().and_then(|f| f.pose_cw)) {
                (Some(current), Some(last)) => self.motion.update(&current, &last),
                _ => self.motion.clear(),
            }
        } else {
            self.motion.clear();
        }

        self.discard_unobserved_matches(frame);
        self.erase_temporal_points();

        if ok {
            let verdict = self.need_new_keyframe(frame);
            if verdict.interrupt_ba {
                self.mapper.interrupt_ba();
            }
            if verdict.insert {
                self.create_new_keyframe(frame);
            }

            for i in 0..frame.num_features() {
                if frame.outliers[i] {
                    frame.map_points[i] = None;
                    frame.outliers[i] = false;
                }
            }
        }

        self.state == TrackingState::Lost
            && self.shared.map.read().num_keyframes() <= self.params.reset_if_lost_keyframes
    }

    /// Localization against a map that is not extended.
    ///
    /// While most matches are temporary points (visual odometry), the motion
    /// model keeps the camera going and relocalization is tried every frame
    /// to get back onto the map.
    fn track_localization(&mut self, frame: &mut Frame) -> bool {
        if self.state == TrackingState::Lost {
            return self.relocalize(frame);
        }

        if self.mode != TrackingMode::VisualOdometry {
            if self.motion.is_set() && self.track_with_motion_model(frame) {
                return true;
            }
            if self.track_reference_keyframe(frame) {
                self.mode = TrackingMode::Localization;
                return true;
            }
            return false;
        }

        let motion_ok = self.motion.is_set() && self.track_with_motion_model(frame);
        let saved = (frame.map_points.clone(), frame.outliers.clone(), frame.pose_cw);

        let reloc_ok = self.relocalize(frame);
        if reloc_ok {
            self.mode = TrackingMode::Localization;
        } else if motion_ok {
            (frame.map_points, frame.outliers, frame.pose_cw) = saved;
            if self.mode == TrackingMode::VisualOdometry {
                let mut map = self.shared.map.write();
                for i in 0..frame.num_features() {
                    let Some(mp_id) = frame.map_points[i] else {
                        continue;
                    };
                    if !frame.outliers[i] {
                        if let Some(mp) = map.get_map_point_mut(mp_id) {
                            mp.increase_found(1);
                        }
                    }
                }
            }
        }
        reloc_ok || motion_ok
    }

    fn track_reference_keyframe(&mut self, frame: &mut Frame) -> bool {
        let Some(reference) = self.reference_kf else {
            return false;
        };
        let Some(initial_pose) = self.last_frame.as_ref().and_then(|f| f.pose_cw) else {
            return false;
        };

        let map = self.shared.map.read();
        let summary = track_reference_keyframe(frame, reference, initial_pose, &map, &self.vocabulary, &self.params);
        summary.is_some_and(|s| s.map_matches >= self.params.min_map_matches)
    }

    fn track_with_motion_model(&mut self, frame: &mut Frame) -> bool {
        let Some(velocity) = self.motion.velocity() else {
            return false;
        };
        self.update_last_frame();
        let Some(last) = self.last_frame.as_ref() else {
            return false;
        };

        let monocular = self.settings.sensor == Sensor::Monocular;
        let summary = {
            let map = self.shared.map.read();
            track_with_motion_model(frame, last, &velocity, monocular, &map, &self.params)
        };
        let Some(summary) = summary else {
            return false;
        };

        if self.mode.only_tracking() {
            self.mode = if summary.map_matches < self.params.min_map_matches {
                TrackingMode::VisualOdometry
            } else {
                TrackingMode::Localization
            };
            summary.matches > self.params.min_projection_matches
        } else {
            summary.map_matches >= self.params.min_map_matches
        }
    }

    /// Re-anchor the last frame on its reference KeyFrame and, in
    /// localization with a depth sensor, give it temporary points.
    fn update_last_frame(&mut self) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        if let Some(record) = self.trajectory.records().last() {
            if let Some(reference) = record.reference {
                let map = self.shared.map.read();
                update_last_frame_pose(last, reference, &record.relative_pose, &map);
            }
        }

        if self.last_keyframe_frame_id == last.id
            || self.settings.sensor == Sensor::Monocular
            || !self.mode.only_tracking()
        {
            return;
        }

        let mut map = self.shared.map.write();
        let created = create_temporal_points(last, &mut map, self.params.max_near_points);
        debug!("{} temporal points for frame {}", created.len(), last.id);
        self.temporal_points.extend(created);
    }

    fn relocalize(&mut self, frame: &mut Frame) -> bool {
        let found = {
            let map = self.shared.map.read();
            let keyframe_db = self.shared.keyframe_db.read();
            Relocalizer::new(&self.params).relocalize(frame, &map, &keyframe_db, &self.vocabulary)
        };
        if found.is_none() {
            return false;
        }
        self.motion.clear();
        self.last_reloc_frame_id = Some(frame.id);
        true
    }

    fn track_local_map(&mut self, frame: &mut Frame) -> bool {
        let mut th = if self.settings.sensor == Sensor::Rgbd { 3.0 } else { 1.0 };
        if self
            .last_reloc_frame_id
            .is_some_and(|r| frame.id < r + RELOC_WIDE_SEARCH_FRAMES)
        {
            th = 5.0;
        }
        let search = LocalSearchParams {
            th,
            only_tracking: self.mode.only_tracking(),
            drop_outliers: self.settings.sensor == Sensor::Stereo,
        };

        let result = {
            let map = self.shared.map.read();
            self.local_map.track(frame, &map, &search)
        };
        apply_counters(&mut self.shared.map.write(), &result);

        if let Some(reference) = result.reference {
            self.reference_kf = Some(reference);
            frame.reference_kf = Some(reference);
        }
        self.matches_inliers = result.inliers;

        is_tracked(
            result.inliers,
            frame.id,
            self.last_reloc_frame_id,
            self.settings.max_frames(),
            self.params.local_map_min_inliers,
            self.params.local_map_min_inliers_after_reloc,
        )
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrames
    // ─────────────────────────────────────────────────────────────────────────

    fn need_new_keyframe(&self, frame: &Frame) -> KeyFrameVerdict {
        let monocular = self.settings.sensor == Sensor::Monocular;
        let (num_keyframes, ref_matches) = {
            let map = self.shared.map.read();
            let num_keyframes = map.num_keyframes();
            let min_obs = KeyFrameDecision::min_observations(num_keyframes);
            let ref_matches = self
                .reference_kf
                .map(|r| map.tracked_map_points(r, min_obs))
                .unwrap_or(0);
            (num_keyframes, ref_matches)
        };
        let (tracked_close, untracked_close) = if monocular {
            (0, 0)
        } else {
            KeyFrameDecision::count_close_points(frame)
        };

        KeyFrameDecision::need_new_keyframe(&KeyFrameDecisionInput {
            frame_id: frame.id,
            last_keyframe_frame_id: self.last_keyframe_frame_id,
            last_reloc_frame_id: self.last_reloc_frame_id,
            min_frames: self.settings.min_frames(),
            max_frames: self.settings.max_frames(),
            num_keyframes,
            matches_inliers: self.matches_inliers,
            ref_matches,
            tracked_close,
            untracked_close,
            monocular,
            only_tracking: self.mode.only_tracking(),
            mapper_stopped: self.mapper.is_stopped(),
            mapper_stop_requested: self.mapper.stop_requested(),
            mapper_accepting: self.mapper.accepts_keyframes(),
            mapper_queue_len: self.mapper.keyframes_in_queue(),
        })
    }

    fn create_new_keyframe(&mut self, frame: &mut Frame) {
        if !self.mapper.set_not_stop(true) {
            return;
        }

        let kf_id = {
            let mut map = self.shared.map.write();
            let mut keyframe_db = self.shared.keyframe_db.write();
            create_keyframe(
                frame,
                &mut map,
                &mut keyframe_db,
                &self.vocabulary,
                self.settings.sensor == Sensor::Monocular,
                self.params.max_near_points,
            )
        };

        self.reference_kf = Some(kf_id);
        self.mapper.insert_keyframe(kf_id);
        self.mapper.set_not_stop(false);

        self.last_keyframe = Some(kf_id);
        self.last_keyframe_frame_id = frame.id;
        info!("New keyframe {} from frame {}", kf_id, frame.id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bookkeeping
    // ─────────────────────────────────────────────────────────────────────────

    /// Forward last-frame matches to points the mapper merged away.
    fn check_replaced_in_last_frame(&mut self) {
        let Some(last) = self.last_frame.as_mut() else {
            return;
        };
        let map = self.shared.map.read();
        for slot in last.map_points.iter_mut() {
            if let Some(id) = *slot {
                *slot = map.resolve(id);
            }
        }
    }

    /// Unmatch points no KeyFrame observes (temporary ones, or points culled
    /// while the frame was tracked).
    fn discard_unobserved_matches(&self, frame: &mut Frame) {
        let map = self.shared.map.read();
        for i in 0..frame.num_features() {
            let Some(mp_id) = frame.map_points[i] else {
                continue;
            };
            let observed = map
                .get_map_point(mp_id)
                .is_some_and(|mp| mp.num_observations() >= 1);
            if !observed {
                frame.map_points[i] = None;
                frame.outliers[i] = false;
            }
        }
    }

    fn erase_temporal_points(&mut self) {
        if self.temporal_points.is_empty() {
            return;
        }
        let mut map = self.shared.map.write();
        for mp_id in self.temporal_points.drain(..) {
            map.erase_map_point(mp_id);
        }
    }

    /// Frames without a pose repeat the previous record.
    fn record_trajectory(&mut self, frame: &Frame) {
        let reference_pose = frame.reference_kf.and_then(|r| {
            let map = self.shared.map.read();
            map.keyframe_pose(r).map(|pose| (r, pose))
        });
        match (frame.pose_cw, reference_pose) {
            (Some(pose), Some((reference, reference_pose))) => {
                self.trajectory
                    .record_tracked(frame.timestamp, &pose, reference, &reference_pose)
            }
            _ => self.trajectory.record_lost(frame.timestamp),
        }
    }

    fn publish(&self, frame: &Frame) {
        let Some(viewer) = &self.viewer else {
            return;
        };
        let snapshot = {
            let map = self.shared.map.read();
            let matches = (0..frame.num_features())
                .map(|i| match frame.map_points[i] {
                    Some(id) if !frame.outliers[i] => match map.get_map_point(id) {
                        Some(mp) if mp.num_observations() > 0 => FeatureMatch::Map,
                        Some(_) => FeatureMatch::Temporal,
                        None => FeatureMatch::None,
                    },
                    _ => FeatureMatch::None,
                })
                .collect();
            TrackingSnapshot {
                frame_id: frame.id,
                timestamp: frame.timestamp,
                state: self.state,
                last_processed_state: self.last_processed_state,
                mode: self.mode,
                keypoints: frame.keypoints.clone(),
                matches,
                pose: frame.pose_cw,
            }
        };
        viewer.update(&snapshot);
    }

    fn transition(&mut self, event: TrackingEvent) {
        match self.state.next(event) {
            Ok(next) => {
                if next != self.state {
                    debug!("Tracking state {:?} -> {:?} on {:?}", self.state, next, event);
                }
                self.state = next;
            }
            Err(e) => warn!("Ignoring tracking event: {}", e),
        }
    }

    /// Clear the map and every per-run field. Workers drop their queues
    /// first so nothing refers to the cleared map afterwards.
    pub fn reset(&mut self) {
        info!("System resetting");
        self.mapper.request_reset();
        if let Some(loop_closer) = &self.loop_closer {
            loop_closer.request_reset();
        }
        self.shared.clear();

        self.builder.reset_ids();
        self.mono_initializer.reset();
        self.motion.clear();
        self.local_map.clear();
        self.reference_kf = None;
        self.last_keyframe = None;
        self.last_keyframe_frame_id = 0;
        self.last_reloc_frame_id = None;
        self.matches_inliers = 0;
        self.temporal_points.clear();
        self.trajectory.clear();
        self.last_frame = None;
        if self.mode == TrackingMode::VisualOdometry {
            self.mode = TrackingMode::Localization;
        }
        self.transition(TrackingEvent::Reset);
    }
}
