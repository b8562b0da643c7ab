use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vslam_tracker::config::{Sensor, TrackerSettings, TrackingParams};
use vslam_tracker::io::euroc::EurocDataset;
use vslam_tracker::system::SlamSystem;
use vslam_tracker::tracking::frame::orb_opencv::OpenCvOrbExtractor;
use vslam_tracker::tracking::frame::Extractors;
use vslam_tracker::tracking::TrackingState;
use vslam_tracker::vocabulary::OrbVocabulary;

const USAGE: &str = "track_euroc <ORBvoc.txt> <settings.yaml> <mav0 dir> [trajectory.txt]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let vocabulary_path = args.next().context(USAGE)?;
    let settings_path = args.next().context(USAGE)?;
    let dataset_path = args.next().context(USAGE)?;
    let output_path = args.next().unwrap_or_else(|| "CameraTrajectory.txt".to_string());

    info!("Loading ORB vocabulary from {}", vocabulary_path);
    let vocabulary = Arc::new(OrbVocabulary::load_from_text(&vocabulary_path)?);

    let settings = TrackerSettings::from_file(&settings_path, Sensor::Stereo)?;
    let extractors = Extractors {
        left: Box::new(OpenCvOrbExtractor::new(&settings.orb, 1)?),
        right: Some(Box::new(OpenCvOrbExtractor::new(&settings.orb, 1)?)),
        init: None,
    };

    let dataset = EurocDataset::new(&dataset_path)?;
    info!("Loaded {} stereo frames from {}", dataset.len(), dataset_path);

    let mut slam_system = SlamSystem::new(settings, TrackingParams::default(), extractors, vocabulary)?;

    let mut track_times = Vec::with_capacity(dataset.len());
    for i in 0..dataset.len() {
        let pair = dataset.stereo_pair(i)?;

        let start = Instant::now();
        slam_system.track_stereo(&pair.left, &pair.right, pair.timestamp_s)?;
        track_times.push(start.elapsed().as_secs_f64());

        if slam_system.tracker().state() == TrackingState::Lost {
            warn!("Frame {} (t={:.3}): tracking lost", i, pair.timestamp_s);
        }

        if i % 100 == 0 {
            let map = slam_system.shared_state().map.read();
            info!(
                "Frame {}/{}: {} keyframes, {} map points, state={:?}",
                i,
                dataset.len(),
                map.num_keyframes(),
                map.num_map_points(),
                slam_system.tracker().state()
            );
        }
    }

    // Shutdown cleanly (joins Local Mapping thread)
    slam_system.shutdown();

    if !track_times.is_empty() {
        track_times.sort_by(|a, b| a.total_cmp(b));
        let mean = track_times.iter().sum::<f64>() / track_times.len() as f64;
        info!(
            "Tracking time: median {:.1} ms, mean {:.1} ms",
            track_times[track_times.len() / 2] * 1e3,
            mean * 1e3
        );
    }

    slam_system.save_trajectory_tum(&output_path)?;
    Ok(())
}
