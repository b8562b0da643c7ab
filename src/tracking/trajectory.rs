//! Trajectory bookkeeping.
//!
//! Every processed frame leaves one record holding its pose relative to its
//! reference KeyFrame. Because KeyFrame poses keep changing while the map is
//! refined (and erased KeyFrames leave tombstones), absolute poses are only
//! reconstructed at the end, against the final map.

use std::io::Write;

use anyhow::{Context, Result};
use csv::WriterBuilder;

use crate::atlas::map::{KeyFrameId, Map};
use crate::geometry::SE3;

#[derive(Debug, Clone, Copy)]
pub struct TrajectoryRecord {
    pub timestamp: f64,
    /// None for frames processed before any KeyFrame existed.
    pub reference: Option<KeyFrameId>,
    /// Pose of the frame relative to its reference (T_cr).
    pub relative_pose: SE3,
    pub lost: bool,
}

/// A reconstructed camera pose.
#[derive(Debug, Clone, Copy)]
pub struct CameraPose {
    pub timestamp: f64,
    /// World-to-camera.
    pub pose_cw: SE3,
    pub lost: bool,
}

/// Append-only list of records, one per processed frame.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    records: Vec<TrajectoryRecord>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a tracked frame against its reference KeyFrame.
    pub fn record_tracked(&mut self, timestamp: f64, pose_cw: &SE3, reference: KeyFrameId, reference_pose_cw: &SE3) {
        self.records.push(TrajectoryRecord {
            timestamp,
            reference: Some(reference),
            relative_pose: *pose_cw * reference_pose_cw.inverse(),
            lost: false,
        });
    }

    /// Record a frame that could not be tracked. It repeats the previous
    /// record's relative pose and reference.
    pub fn record_lost(&mut self, timestamp: f64) {
        let (reference, relative_pose) = self
            .records
            .last()
            .map(|r| (r.reference, r.relative_pose))
            .unwrap_or((None, SE3::identity()));
        self.records.push(TrajectoryRecord {
            timestamp,
            reference,
            relative_pose,
            lost: true,
        });
    }

    pub fn records(&self) -> &[TrajectoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Absolute poses of every record whose reference the map can still
    /// place.
    pub fn reconstruct(&self, map: &Map) -> Vec<CameraPose> {
        self.records
            .iter()
            .filter_map(|r| {
                let reference_pose = map.keyframe_pose(r.reference?)?;
                Some(CameraPose {
                    timestamp: r.timestamp,
                    pose_cw: r.relative_pose * reference_pose,
                    lost: r.lost,
                })
            })
            .collect()
    }
}

/// Write tracked poses as `timestamp tx ty tz qx qy qz qw` lines
/// (camera-to-world). Lost frames are skipped.
pub fn write_tum<W: Write>(poses: &[CameraPose], writer: W) -> Result<usize> {
    let mut wtr = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_writer(writer);

    let mut written = 0;
    for p in poses.iter().filter(|p| !p.lost) {
        let twc = p.pose_cw.inverse();
        let t = twc.translation;
        let q = twc.rotation;
        wtr.write_record(&[
            format!("{:.6}", p.timestamp),
            format!("{:.7}", t.x),
            format!("{:.7}", t.y),
            format!("{:.7}", t.z),
            format!("{:.7}", q.i),
            format!("{:.7}", q.j),
            format!("{:.7}", q.k),
            format!("{:.7}", q.w),
        ])
        .context("Failed to write trajectory line")?;
        written += 1;
    }
    wtr.flush().context("Failed to flush trajectory")?;
    Ok(written)
}
