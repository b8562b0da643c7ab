//! Settings loading and tracking thresholds.
//!
//! Calibration and extractor settings come from ORB-SLAM-style YAML files
//! (`Camera.fx: 458.654`, ...). Those files start with an OpenCV
//! `%YAML:1.0` directive and may carry `!!opencv-matrix` tags, both of which
//! are stripped before handing the text to serde_yaml.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::geometry::pnp::PnpRansacParams;
use crate::geometry::two_view::TwoViewParams;
use crate::tracking::frame::{CameraModel, ScalePyramid};

/// Input modality of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensor {
    Monocular,
    Stereo,
    Rgbd,
}

impl Sensor {
    pub fn has_depth(self) -> bool {
        !matches!(self, Sensor::Monocular)
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    #[serde(rename = "Camera.fx")]
    fx: f64,
    #[serde(rename = "Camera.fy")]
    fy: f64,
    #[serde(rename = "Camera.cx")]
    cx: f64,
    #[serde(rename = "Camera.cy")]
    cy: f64,
    #[serde(rename = "Camera.k1", default)]
    k1: f64,
    #[serde(rename = "Camera.k2", default)]
    k2: f64,
    #[serde(rename = "Camera.p1", default)]
    p1: f64,
    #[serde(rename = "Camera.p2", default)]
    p2: f64,
    #[serde(rename = "Camera.k3", default)]
    k3: f64,
    #[serde(rename = "Camera.bf", default)]
    bf: f64,
    #[serde(rename = "Camera.fps", default)]
    fps: f64,
    #[serde(rename = "Camera.RGB", default = "default_rgb")]
    rgb: i32,
    #[serde(rename = "ThDepth", default)]
    th_depth: f64,
    #[serde(rename = "DepthMapFactor", default = "default_depth_factor")]
    depth_map_factor: f64,
    #[serde(rename = "ORBextractor.nFeatures")]
    n_features: i64,
    #[serde(rename = "ORBextractor.scaleFactor")]
    scale_factor: f64,
    #[serde(rename = "ORBextractor.nLevels")]
    n_levels: i64,
    #[serde(rename = "ORBextractor.iniThFAST", default = "default_ini_fast")]
    ini_th_fast: i32,
    #[serde(rename = "ORBextractor.minThFAST", default = "default_min_fast")]
    min_th_fast: i32,
}

fn default_rgb() -> i32 {
    1
}

fn default_depth_factor() -> f64 {
    1.0
}

fn default_ini_fast() -> i32 {
    20
}

fn default_min_fast() -> i32 {
    7
}

/// ORB extractor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrbSettings {
    pub n_features: usize,
    pub scale_factor: f64,
    pub n_levels: usize,
    pub ini_th_fast: i32,
    pub min_th_fast: i32,
}

impl OrbSettings {
    pub fn pyramid(&self) -> ScalePyramid {
        ScalePyramid::new(self.n_levels, self.scale_factor)
    }
}

/// Everything a tracker reads from a settings file.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    pub sensor: Sensor,
    /// Intrinsics, distortion and (for depth sensors) baseline.
    pub camera: CameraModel,
    pub fps: f64,
    /// Channel order of color input: true for RGB, false for BGR.
    pub rgb: bool,
    /// Close/far threshold in baselines (`ThDepth`).
    pub th_depth_baselines: f64,
    /// Raw depth units per metre.
    pub depth_map_factor: f64,
    pub orb: OrbSettings,
}

impl TrackerSettings {
    pub fn from_file<P: AsRef<Path>>(path: P, sensor: Sensor) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to open settings file {:?}", path))?;
        Self::from_yaml_str(&text, sensor)
            .with_context(|| format!("Invalid settings file {:?}", path))
    }

    pub fn from_yaml_str(text: &str, sensor: Sensor) -> Result<Self> {
        let cleaned: String = text
            .lines()
            .filter(|l| !l.trim_start().starts_with('%'))
            .map(|l| l.replace("!!opencv-matrix", ""))
            .collect::<Vec<_>>()
            .join("\n");
        let raw: RawSettings = serde_yaml::from_str(&cleaned).context("Failed to parse YAML")?;

        if !(raw.fx.is_finite() && raw.fy.is_finite()) || raw.fx <= 0.0 || raw.fy <= 0.0 {
            bail!("focal lengths must be positive, got fx={} fy={}", raw.fx, raw.fy);
        }
        if sensor.has_depth() {
            if !(raw.bf > 0.0) {
                bail!("Camera.bf must be positive for {:?}, got {}", sensor, raw.bf);
            }
            if !(raw.th_depth > 0.0) {
                bail!("ThDepth must be positive for {:?}, got {}", sensor, raw.th_depth);
            }
        }
        if !raw.depth_map_factor.is_finite() || raw.depth_map_factor < 0.0 {
            bail!("DepthMapFactor must not be negative, got {}", raw.depth_map_factor);
        }
        if raw.n_features <= 0 {
            bail!("ORBextractor.nFeatures must be positive, got {}", raw.n_features);
        }
        if raw.n_levels < 1 {
            bail!("ORBextractor.nLevels must be at least 1, got {}", raw.n_levels);
        }
        if !(raw.scale_factor > 1.0) {
            bail!("ORBextractor.scaleFactor must exceed 1, got {}", raw.scale_factor);
        }

        let baseline = if raw.bf > 0.0 { raw.bf / raw.fx } else { 0.0 };
        let camera = CameraModel::new(raw.fx, raw.fy, raw.cx, raw.cy)
            .with_baseline(baseline)
            .with_distortion([raw.k1, raw.k2, raw.p1, raw.p2, raw.k3]);

        Ok(Self {
            sensor,
            camera,
            fps: if raw.fps > 0.0 { raw.fps } else { 30.0 },
            rgb: raw.rgb != 0,
            th_depth_baselines: raw.th_depth,
            depth_map_factor: if raw.depth_map_factor.abs() < 1e-5 {
                1.0
            } else {
                raw.depth_map_factor
            },
            orb: OrbSettings {
                n_features: raw.n_features as usize,
                scale_factor: raw.scale_factor,
                n_levels: raw.n_levels as usize,
                ini_th_fast: raw.ini_th_fast,
                min_th_fast: raw.min_th_fast,
            },
        })
    }

    /// Close/far depth threshold in metres.
    pub fn th_depth(&self) -> f64 {
        self.camera.bf() * self.th_depth_baselines / self.camera.fx
    }

    /// Frames that must pass before a keyframe can be inserted on a busy
    /// mapper.
    pub fn min_frames(&self) -> u64 {
        0
    }

    /// Frames after which a keyframe is due regardless, one second of video.
    pub fn max_frames(&self) -> u64 {
        self.fps as u64
    }
}

/// Tunable thresholds of the tracker. Defaults are the values the pipeline
/// was calibrated with.
#[derive(Debug, Clone)]
pub struct TrackingParams {
    /// Stereo/RGB-D single-frame initialization needs more keypoints than this.
    pub stereo_init_min_features: usize,
    /// Each monocular initialization frame needs more keypoints than this.
    pub mono_init_min_features: usize,
    pub mono_init_min_matches: usize,
    pub mono_init_window: f64,
    /// Points the second monocular keyframe must track.
    pub mono_init_min_tracked: usize,
    pub two_view: TwoViewParams,

    pub ref_kf_nn_ratio: f64,
    pub motion_nn_ratio: f64,
    /// Minimum BoW matches against the reference keyframe.
    pub min_bow_matches: usize,
    /// Minimum projection matches for the motion model.
    pub min_projection_matches: usize,
    /// Map matches after pose optimization for frame-to-frame success.
    pub min_map_matches: usize,

    pub local_map_min_inliers: usize,
    pub local_map_min_inliers_after_reloc: usize,
    pub max_local_keyframes: usize,

    pub reloc_nn_ratio: f64,
    pub reloc_min_inliers: usize,
    pub pnp: PnpRansacParams,

    /// Near points created for each new stereo/RGB-D keyframe (at least).
    pub max_near_points: usize,
    /// Reset the system when lost with at most this many keyframes.
    pub reset_if_lost_keyframes: usize,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            stereo_init_min_features: 500,
            mono_init_min_features: 100,
            mono_init_min_matches: 100,
            mono_init_window: 100.0,
            mono_init_min_tracked: 100,
            two_view: TwoViewParams::default(),
            ref_kf_nn_ratio: 0.7,
            motion_nn_ratio: 0.9,
            min_bow_matches: 15,
            min_projection_matches: 20,
            min_map_matches: 10,
            local_map_min_inliers: 30,
            local_map_min_inliers_after_reloc: 50,
            max_local_keyframes: 80,
            reloc_nn_ratio: 0.75,
            reloc_min_inliers: 50,
            pnp: PnpRansacParams::default(),
            max_near_points: 100,
            reset_if_lost_keyframes: 5,
        }
    }
}
