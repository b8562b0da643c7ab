//! Dataset readers.

pub mod euroc;
