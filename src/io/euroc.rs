//! EuRoC MAV stereo sequence reader.
//!
//! Expects the `mav0` layout: `cam0/data.csv`, `cam1/data.csv` and the PNG
//! files under `cam{0,1}/data/`. Calibration comes from a separate
//! ORB-SLAM-style settings file, not from the dataset's `sensor.yaml`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use image::DynamicImage;

#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

impl ImageEntry {
    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 * 1e-9
    }
}

#[derive(Debug, Clone)]
pub struct StereoImagePair {
    pub left: DynamicImage,
    pub right: DynamicImage,
    pub timestamp_s: f64,
}

#[derive(Debug)]
pub struct EurocDataset {
    dataset_path: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    pub cam1_entries: Vec<ImageEntry>,
}

impl EurocDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;
        let cam1_entries = load_image_list(root.join("cam1/data.csv"))?;

        if cam0_entries.len() != cam1_entries.len() {
            bail!(
                "cam0 and cam1 have different number of frames ({} vs {})",
                cam0_entries.len(),
                cam1_entries.len()
            );
        }

        Ok(Self {
            dataset_path: root,
            cam0_entries,
            cam1_entries,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    pub fn stereo_pair(&self, idx: usize) -> Result<StereoImagePair> {
        let left_entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("No left frame at index {}", idx))?;
        let right_entry = self
            .cam1_entries
            .get(idx)
            .with_context(|| format!("No right frame at index {}", idx))?;

        let left_path = self.dataset_path.join("cam0/data").join(&left_entry.filename);
        let right_path = self.dataset_path.join("cam1/data").join(&right_entry.filename);

        let left = image::open(&left_path).with_context(|| format!("Failed to read left image {:?}", left_path))?;
        let right =
            image::open(&right_path).with_context(|| format!("Failed to read right image {:?}", right_path))?;

        // Timestamps of the two cameras are synchronized; the left one is used
        Ok(StereoImagePair {
            left,
            right,
            timestamp_s: left_entry.timestamp_s(),
        })
    }
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;
    parse_image_list(rdr)
}

fn parse_image_list<R: std::io::Read>(mut rdr: csv::Reader<R>) -> Result<Vec<ImageEntry>> {
    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp {:?}", &rec[0]))?;
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}
