//! Local Mapping thread.
//!
//! The Local Mapping thread is responsible for:
//! - Refreshing the points of each new keyframe
//! - Culling recently created map points that tracking does not confirm
//! - Culling redundant keyframes
//! - Handing keyframes on to loop closing

mod local_mapper;

pub use local_mapper::{LocalMapper, KEYFRAME_CHANNEL_CAPACITY};
