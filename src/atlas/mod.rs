//! Map data structures shared between tracking and local mapping.
//!
//! - [`map::KeyFrame`] - KeyFrames with covisibility and spanning tree
//! - [`map::MapPoint`] - 3D landmarks with observation tracking
//! - [`map::Map`] - Container with association and culling operations
//! - [`keyframe_db::KeyFrameDatabase`] - inverted word index for relocalization

pub mod keyframe_db;
pub mod map;

// Re-export commonly used types
pub use keyframe_db::KeyFrameDatabase;
pub use map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
