//! Tracking: turns each input image into a camera pose.
//!
//! This module implements the per-frame pipeline:
//! - Frame processing (ORB extraction, stereo matching, RGB-D depth)
//! - Map initialization (single frame with depth, two-view for monocular)
//! - Initial pose estimation (motion model, reference keyframe, relocalization)
//! - Track local map (projection-based search)
//! - New KeyFrame decision

pub mod frame;
pub mod initializer;
pub mod keyframe_decision;
pub mod local_map;
pub mod matching;
pub mod motion_model;
pub mod pose_estimation;
pub mod relocalization;
pub mod result;
pub mod state;
pub mod tracker;
pub mod tracking_frame;
pub mod trajectory;

pub use state::{TrackingMode, TrackingState};
pub use tracker::Tracker;
