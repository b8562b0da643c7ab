//! Pose-only optimization for tracking.
//!
//! Gauss-Newton over the camera pose with Huber-robust mono and stereo
//! reprojection residuals, alternating with chi-square outlier classification.

pub mod pose_optimization;

pub use pose_optimization::{optimize_frame_pose, optimize_pose_observations, PoseObservation, PoseOptimizationResult};
