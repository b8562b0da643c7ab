//! SLAM system orchestration and thread management.
//!
//! This module contains the top-level `SlamSystem` that runs tracking and
//! spawns the Local Mapping thread, the shared state both of them lock, and
//! the interfaces through which tracking talks to the other workers.

pub mod collaborators;
pub mod shared_state;
mod slam_system;

pub use collaborators::{FrameViewer, LocalMapping, LoopClosing};
pub use shared_state::SharedState;
pub use slam_system::SlamSystem;
