//! Synthetic scenes and stand-in workers for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Result};
use image::{DynamicImage, GrayImage};
use nalgebra::Vector3;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::atlas::map::{KeyFrameId, Map};
use crate::config::{OrbSettings, Sensor, TrackerSettings};
use crate::geometry::SE3;
use crate::system::collaborators::LocalMapping;
use crate::tracking::frame::{
    descriptor_distance, CameraModel, Descriptor, FeatureExtractor, FeatureSet, KeyPoint, ScalePyramid,
    StereoDepth,
};
use crate::tracking::tracking_frame::{Frame, FrameCalibration};
use crate::vocabulary::OrbVocabulary;

pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

/// Random descriptors closer than this are regenerated, so that no two
/// landmarks can pass the matcher thresholds for each other.
const MIN_DESCRIPTOR_SEPARATION: u32 = 101;

pub fn test_camera() -> CameraModel {
    CameraModel::new(450.0, 450.0, 320.0, 240.0).with_baseline(0.1)
}

pub fn test_calibration() -> FrameCalibration {
    let camera = test_camera();
    FrameCalibration {
        camera,
        pyramid: ScalePyramid::new(8, 1.2),
        th_depth: 4.0,
        bounds: camera.image_bounds(WIDTH, HEIGHT),
    }
}

pub fn test_settings(sensor: Sensor) -> TrackerSettings {
    TrackerSettings {
        sensor,
        camera: test_camera(),
        fps: 20.0,
        rgb: true,
        th_depth_baselines: 40.0,
        depth_map_factor: 1.0,
        orb: OrbSettings {
            n_features: 1000,
            scale_factor: 1.2,
            n_levels: 8,
            ini_th_fast: 20,
            min_th_fast: 7,
        },
    }
}

pub fn blank_image() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::new(WIDTH, HEIGHT))
}

/// Landmarks seen by a pinhole camera, each with a unique descriptor.
///
/// Every landmark projects inside the image from the identity pose, at a
/// depth between 3 and 8 metres. Observations are exact.
pub struct SyntheticScene {
    pub landmarks: Vec<Vector3<f64>>,
    pub descriptors: Vec<Descriptor>,
    by_descriptor: HashMap<Descriptor, usize>,
    pub calib: FrameCalibration,
}

impl SyntheticScene {
    pub fn new(n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let calib = test_calibration();
        let mut landmarks = Vec::with_capacity(n);
        let mut descriptors: Vec<Descriptor> = Vec::with_capacity(n);
        let mut by_descriptor = HashMap::new();

        while landmarks.len() < n {
            let u = rng.gen_range(20.0..(WIDTH as f64 - 20.0));
            let v = rng.gen_range(20.0..(HEIGHT as f64 - 20.0));
            let z = rng.gen_range(3.0..8.0);

            let mut d = [0u8; 32];
            rng.fill(&mut d);
            if descriptors
                .iter()
                .any(|o| descriptor_distance(o, &d) < MIN_DESCRIPTOR_SEPARATION)
            {
                continue;
            }

            by_descriptor.insert(d, landmarks.len());
            landmarks.push(calib.camera.unproject(u, v, z));
            descriptors.push(d);
        }

        Self {
            landmarks,
            descriptors,
            by_descriptor,
            calib,
        }
    }

    /// One word per landmark.
    pub fn vocabulary(&self) -> OrbVocabulary {
        OrbVocabulary::from_words(&self.descriptors)
    }

    /// Landmarks visible from `pose_cw` as (landmark index, point in camera).
    fn visible(&self, pose_cw: &SE3) -> Vec<(usize, Vector3<f64>)> {
        let bounds = &self.calib.bounds;
        self.landmarks
            .iter()
            .enumerate()
            .filter_map(|(j, p)| {
                let pc = pose_cw.transform_point(p);
                if pc.z <= 0.1 {
                    return None;
                }
                let uv = self.calib.camera.project(&pc);
                bounds.contains(uv.x, uv.y).then_some((j, pc))
            })
            .collect()
    }

    /// Left and right image features of a stereo pair at `pose_cw`.
    pub fn stereo_features(&self, pose_cw: &SE3) -> (FeatureSet, FeatureSet) {
        let bf = self.calib.camera.bf();
        let mut left = FeatureSet::default();
        let mut right = FeatureSet::default();
        for (j, pc) in self.visible(pose_cw) {
            let uv = self.calib.camera.project(&pc);
            left.keypoints.push(KeyPoint::new(uv.x, uv.y, 0));
            left.descriptors.push(self.descriptors[j]);
            right.keypoints.push(KeyPoint::new(uv.x - bf / pc.z, uv.y, 0));
            right.descriptors.push(self.descriptors[j]);
        }
        (left, right)
    }

    /// A frame observing the scene from `pose_cw`. The pose itself is left
    /// unset, as tracking would find it.
    pub fn frame(&self, id: u64, pose_cw: &SE3, stereo: bool) -> Frame {
        let visible = self.visible(pose_cw);
        let (features, _) = self.stereo_features(pose_cw);
        let depth = stereo.then(|| StereoDepth {
            u_right: visible
                .iter()
                .map(|(_, pc)| self.calib.camera.project(pc).x - self.calib.camera.bf() / pc.z)
                .collect(),
            depth: visible.iter().map(|(_, pc)| pc.z).collect(),
        });
        Frame::new(id, id as f64 * 0.05, features, depth, &self.calib)
    }

    /// A stereo frame at `pose_cw` promoted to a KeyFrame of `map`, with
    /// one point per feature at the exact landmark position.
    pub fn frame_with_map_points(&self, id: u64, pose_cw: &SE3, map: &mut Map) -> Frame {
        let mut frame = self.frame(id, pose_cw, true);
        frame.set_pose(*pose_cw);
        frame.compute_bow(&self.vocabulary());
        let kf_id = map.insert_keyframe(&frame);

        for i in 0..frame.num_features() {
            let position = self.landmarks[self.landmark_of(&frame, i)];
            let mp_id = map.create_map_point(position, frame.descriptors[i], kf_id);
            map.associate(kf_id, i, mp_id);
            map.update_normal_and_depth(mp_id);
            frame.map_points[i] = Some(mp_id);
        }
        map.update_connections(kf_id);
        frame.reference_kf = Some(kf_id);
        frame
    }

    /// Landmark behind feature `i` of a frame built from this scene.
    pub fn landmark_of(&self, frame: &Frame, i: usize) -> usize {
        self.by_descriptor[&frame.descriptors[i]]
    }
}

/// Replays prepared feature sets, one per call.
pub struct ScriptedExtractor {
    frames: VecDeque<FeatureSet>,
    pyramid: ScalePyramid,
}

impl ScriptedExtractor {
    pub fn new(frames: Vec<FeatureSet>) -> Self {
        Self {
            frames: frames.into(),
            pyramid: ScalePyramid::new(8, 1.2),
        }
    }
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&mut self, _image: &GrayImage) -> Result<FeatureSet> {
        match self.frames.pop_front() {
            Some(features) => Ok(features),
            None => bail!("no scripted features left"),
        }
    }

    fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }
}

/// Mapping worker that only records what it is handed.
#[derive(Default)]
pub struct RecordingMapper {
    pub inserted: Mutex<Vec<KeyFrameId>>,
    pub resets: AtomicUsize,
}

impl RecordingMapper {
    pub fn inserted(&self) -> Vec<KeyFrameId> {
        self.inserted.lock().clone()
    }
}

impl LocalMapping for RecordingMapper {
    fn insert_keyframe(&self, kf_id: KeyFrameId) {
        self.inserted.lock().push(kf_id);
    }

    fn accepts_keyframes(&self) -> bool {
        true
    }

    fn keyframes_in_queue(&self) -> usize {
        0
    }

    fn interrupt_ba(&self) {}

    fn set_not_stop(&self, _flag: bool) -> bool {
        true
    }

    fn is_stopped(&self) -> bool {
        false
    }

    fn stop_requested(&self) -> bool {
        false
    }

    fn request_stop(&self) {}

    fn release(&self) {}

    fn request_reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.inserted.lock().clear();
    }
}
