//! Turn input images into tracking frames.

use anyhow::{bail, Result};
use image::DynamicImage;

use crate::config::{Sensor, TrackerSettings};
use crate::tracking::frame::camera::CameraModel;
use crate::tracking::frame::features::FeatureExtractor;
use crate::tracking::frame::image::{depth_to_metric, to_grayscale, DepthImage};
use crate::tracking::frame::stereo::{compute_rgbd_depth, compute_stereo_matches, StereoDepth};
use crate::tracking::tracking_frame::{Frame, FrameCalibration};

/// Feature extractors a builder runs.
pub struct Extractors {
    /// Left (or only) image.
    pub left: Box<dyn FeatureExtractor>,
    /// Right image, stereo only.
    pub right: Option<Box<dyn FeatureExtractor>>,
    /// Denser extractor for monocular initialization.
    pub init: Option<Box<dyn FeatureExtractor>>,
}

/// Builds frames with consecutive ids from one sensor.
pub struct FrameBuilder {
    sensor: Sensor,
    camera: CameraModel,
    th_depth: f64,
    rgb: bool,
    depth_map_factor: f64,
    extractors: Extractors,
    /// Computed from the first image, and again after a calibration change.
    calib: Option<FrameCalibration>,
    next_id: u64,
}

impl FrameBuilder {
    pub fn new(settings: &TrackerSettings, extractors: Extractors) -> Result<Self> {
        if settings.sensor == Sensor::Stereo && extractors.right.is_none() {
            bail!("stereo input needs a right image extractor");
        }
        Ok(Self {
            sensor: settings.sensor,
            camera: settings.camera,
            th_depth: settings.th_depth(),
            rgb: settings.rgb,
            depth_map_factor: settings.depth_map_factor,
            extractors,
            calib: None,
            next_id: 0,
        })
    }

    pub fn sensor(&self) -> Sensor {
        self.sensor
    }

    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// Id the next frame will get.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn reset_ids(&mut self) {
        self.next_id = 0;
    }

    /// Swap the calibration. Frames built afterwards use the new one.
    pub fn set_calibration(&mut self, settings: &TrackerSettings) {
        self.camera = settings.camera;
        self.th_depth = settings.th_depth();
        self.rgb = settings.rgb;
        self.depth_map_factor = settings.depth_map_factor;
        self.calib = None;
    }

    fn calibration(&mut self, width: u32, height: u32) -> FrameCalibration {
        if let Some(calib) = &self.calib {
            return calib.clone();
        }
        let calib = FrameCalibration {
            camera: self.camera,
            pyramid: self.extractors.left.pyramid().clone(),
            th_depth: self.th_depth,
            bounds: self.camera.image_bounds(width, height),
        };
        self.calib = Some(calib.clone());
        calib
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn expect_sensor(&self, sensor: Sensor) -> Result<()> {
        if self.sensor != sensor {
            bail!("{:?} input given to a {:?} tracker", sensor, self.sensor);
        }
        Ok(())
    }

    pub fn build_stereo(&mut self, left: &DynamicImage, right: &DynamicImage, timestamp: f64) -> Result<Frame> {
        self.expect_sensor(Sensor::Stereo)?;
        let left_gray = to_grayscale(left, self.rgb);
        let right_gray = to_grayscale(right, self.rgb);

        let left_features = self.extractors.left.extract(&left_gray)?;
        let right_features = match self.extractors.right.as_mut() {
            Some(extractor) => extractor.extract(&right_gray)?,
            None => bail!("stereo input needs a right image extractor"),
        };

        let calib = self.calibration(left_gray.width(), left_gray.height());
        let stereo = compute_stereo_matches(
            &left_features,
            &right_features,
            &left_gray,
            &right_gray,
            &calib.pyramid,
            &calib.camera,
        );
        Ok(Frame::new(self.take_id(), timestamp, left_features, Some(stereo), &calib))
    }

    pub fn build_rgbd(&mut self, color: &DynamicImage, depth: &DepthImage, timestamp: f64) -> Result<Frame> {
        self.expect_sensor(Sensor::Rgbd)?;
        let gray = to_grayscale(color, self.rgb);
        let depth = depth_to_metric(depth, self.depth_map_factor)?;

        let features = self.extractors.left.extract(&gray)?;
        let calib = self.calibration(gray.width(), gray.height());
        let id = self.take_id();

        // Depth lookup needs the undistorted keypoints the frame computes
        let mut frame = Frame::new(id, timestamp, features, None, &calib);
        let StereoDepth { u_right, depth } =
            compute_rgbd_depth(&frame.keypoints, &frame.keypoints_un, &depth, &calib.camera);
        frame.u_right = u_right;
        frame.depth = depth;
        Ok(frame)
    }

    /// `initializing` selects the denser extractor, when one is configured.
    pub fn build_monocular(&mut self, image: &DynamicImage, timestamp: f64, initializing: bool) -> Result<Frame> {
        self.expect_sensor(Sensor::Monocular)?;
        let gray = to_grayscale(image, self.rgb);
        let features = match self.extractors.init.as_mut() {
            Some(extractor) if initializing => extractor.extract(&gray)?,
            _ => self.extractors.left.extract(&gray)?,
        };
        let calib = self.calibration(gray.width(), gray.height());
        Ok(Frame::new(self.take_id(), timestamp, features, None, &calib))
    }
}
