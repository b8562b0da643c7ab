//! ORB extraction through OpenCV.

use anyhow::{bail, Result};
use image::GrayImage;
use opencv::core::{KeyPoint as CvKeyPoint, Mat, Ptr, Vector};
use opencv::features2d;
use opencv::prelude::*;

use crate::config::OrbSettings;
use crate::tracking::frame::features::{Descriptor, FeatureExtractor, FeatureSet, KeyPoint, ScalePyramid};

pub struct OpenCvOrbExtractor {
    orb: Ptr<features2d::ORB>,
    pyramid: ScalePyramid,
}

impl OpenCvOrbExtractor {
    /// `feature_scale` multiplies the configured feature count (2 for the
    /// monocular initialization extractor).
    pub fn new(settings: &OrbSettings, feature_scale: usize) -> Result<Self> {
        let orb = features2d::ORB::create(
            (settings.n_features * feature_scale) as i32,
            settings.scale_factor as f32,
            settings.n_levels as i32,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            settings.ini_th_fast,
        )?;
        Ok(Self {
            orb,
            pyramid: settings.pyramid(),
        })
    }
}

impl FeatureExtractor for OpenCvOrbExtractor {
    fn extract(&mut self, image: &GrayImage) -> Result<FeatureSet> {
        let flat = Mat::from_slice(image.as_raw())?;
        let mat = flat.reshape(1, image.height() as i32)?.try_clone()?;

        let mut cv_keypoints = Vector::<CvKeyPoint>::new();
        let mut cv_descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(&mat, &mask, &mut cv_keypoints, &mut cv_descriptors, false)?;

        let mut features = FeatureSet::default();
        for (i, kp) in cv_keypoints.iter().enumerate() {
            let row = cv_descriptors.at_row::<u8>(i as i32)?;
            let Ok(descriptor) = Descriptor::try_from(row) else {
                bail!("ORB descriptor row {} has {} bytes", i, row.len());
            };
            features.keypoints.push(KeyPoint {
                x: kp.pt().x as f64,
                y: kp.pt().y as f64,
                angle: kp.angle() as f64,
                octave: kp.octave(),
                response: kp.response() as f64,
            });
            features.descriptors.push(descriptor);
        }
        Ok(features)
    }

    fn pyramid(&self) -> &ScalePyramid {
        &self.pyramid
    }
}
