//! Map module - Core SLAM map data structures.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Container managing KeyFrames, MapPoints, and their relationships
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! KeyFrames also maintain two graph structures:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: parent links, rewired when a KeyFrame is erased

pub mod keyframe;
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::{Map, Tombstone, COVISIBILITY_THRESHOLD};
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};
