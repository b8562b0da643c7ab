//! Geometry utilities: SE3 transforms, PnP solving, two-view reconstruction.

pub mod pnp;
pub mod se3;
pub mod so3;
pub mod two_view;

pub use se3::SE3;
