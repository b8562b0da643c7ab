//! Interfaces of the workers the tracker hands data to.
//!
//! The tracker never owns these workers. The mapping worker is required
//! and passed at construction; loop closing and the viewer are optional and
//! wired once before the first frame.

use crate::atlas::map::KeyFrameId;
use crate::tracking::result::TrackingSnapshot;

/// Map maintenance worker fed with new keyframes.
///
/// Keyframes are inserted into the shared map by the tracker before they are
/// queued, so implementations receive ids only.
pub trait LocalMapping: Send + Sync {
    /// Queue a keyframe. May block while the queue is full.
    fn insert_keyframe(&self, kf_id: KeyFrameId);

    /// Whether the worker is idle enough to take a keyframe right now.
    fn accepts_keyframes(&self) -> bool;

    fn keyframes_in_queue(&self) -> usize;

    /// Ask a running optimization to bail out early.
    fn interrupt_ba(&self);

    /// Forbid (true) or allow (false) the worker to stop. Returns false when
    /// the worker is already stopped and cannot be held.
    fn set_not_stop(&self, flag: bool) -> bool;

    fn is_stopped(&self) -> bool;

    fn stop_requested(&self) -> bool;

    fn request_stop(&self);

    /// Resume after a stop, dropping queued keyframes.
    fn release(&self);

    /// Drop all queued work. Blocks until the worker acknowledges.
    fn request_reset(&self);
}

/// Loop detection worker.
pub trait LoopClosing: Send + Sync {
    fn insert_keyframe(&self, kf_id: KeyFrameId);

    /// Drop all queued work. Blocks until the worker acknowledges.
    fn request_reset(&self);
}

/// Receives a snapshot of every processed frame.
pub trait FrameViewer: Send + Sync {
    fn update(&self, snapshot: &TrackingSnapshot);
}
