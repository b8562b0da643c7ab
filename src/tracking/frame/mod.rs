//! Frame-level processing: camera model, ORB features, stereo and RGB-D depth.

pub mod builder;
pub mod camera;
pub mod features;
pub mod image;
#[cfg(feature = "opencv")]
pub mod orb_opencv;
pub mod stereo;

pub use builder::{Extractors, FrameBuilder};
pub use camera::{CameraModel, ImageBounds};
pub use features::{descriptor_distance, Descriptor, FeatureExtractor, FeatureSet, KeyPoint, ScalePyramid};
pub use self::image::DepthImage;
pub use stereo::StereoDepth;
