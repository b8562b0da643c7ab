//! Per-keypoint right coordinate and depth for stereo and RGB-D input.
//!
//! Stereo images are assumed rectified: a left keypoint can only match a
//! right keypoint on (nearly) the same row, at a neighbouring pyramid level,
//! with a disparity in `[0, fx]` (depths beyond one baseline). The descriptor
//! match is then refined to sub-pixel precision by block matching on the
//! keypoint's pyramid level.

use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::tracking::frame::camera::CameraModel;
use crate::tracking::frame::features::{descriptor_distance, FeatureSet, KeyPoint, ScalePyramid};
use crate::tracking::frame::image::DepthImage;

/// Descriptor distance accepted for a left/right match. Mean of the high and
/// low matcher thresholds.
pub const TH_STEREO: u32 = 75;

/// Half size of the SAD block.
const SAD_HALF_WINDOW: i64 = 5;
/// Pixels searched on each side of the descriptor match.
const SAD_SEARCH: i64 = 5;

/// Right-image coordinate and depth per left keypoint. `-1` marks "none".
#[derive(Debug, Clone, Default)]
pub struct StereoDepth {
    pub u_right: Vec<f64>,
    pub depth: Vec<f64>,
}

impl StereoDepth {
    fn empty(n: usize) -> Self {
        Self {
            u_right: vec![-1.0; n],
            depth: vec![-1.0; n],
        }
    }

    fn invalidate(&mut self, i: usize) {
        self.u_right[i] = -1.0;
        self.depth[i] = -1.0;
    }

    pub fn num_valid(&self) -> usize {
        self.depth.iter().filter(|&&d| d > 0.0).count()
    }
}

/// Downscale `image` once per pyramid level.
pub fn image_pyramid(image: &GrayImage, pyramid: &ScalePyramid) -> Vec<GrayImage> {
    pyramid
        .inv_scale_factors
        .iter()
        .enumerate()
        .map(|(level, inv)| {
            if level == 0 {
                return image.clone();
            }
            let width = ((image.width() as f64 * inv).round() as u32).max(1);
            let height = ((image.height() as f64 * inv).round() as u32).max(1);
            imageops::resize(image, width, height, FilterType::Triangle)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BlockMatch {
    /// Sub-pixel right coordinate at level 0 and the SAD at the best offset.
    Refined { u_right: f64, sad: u32 },
    /// Every offset scores the same; the image carries no texture here.
    Flat,
    Rejected,
}

/// Sum of absolute differences between two blocks, each taken relative to
/// its centre pixel.
fn block_sad(left: &GrayImage, ul: i64, right: &GrayImage, ur: i64, v: i64) -> u32 {
    let px = |img: &GrayImage, x: i64, y: i64| img.get_pixel(x as u32, y as u32).0[0] as i32;
    let centre_l = px(left, ul, v);
    let centre_r = px(right, ur, v);
    let mut sad = 0u32;
    for dy in -SAD_HALF_WINDOW..=SAD_HALF_WINDOW {
        for dx in -SAD_HALF_WINDOW..=SAD_HALF_WINDOW {
            let l = px(left, ul + dx, v + dy) - centre_l;
            let r = px(right, ur + dx, v + dy) - centre_r;
            sad += (l - r).unsigned_abs();
        }
    }
    sad
}

/// Slide the left block around `u_right0` on the right image of the same
/// level and fit a parabola through the best SAD and its neighbours.
fn refine_by_block_matching(
    left: &GrayImage,
    right: &GrayImage,
    kp_l: &KeyPoint,
    u_right0: f64,
    scale: f64,
) -> BlockMatch {
    let inv = 1.0 / scale;
    let ul = (kp_l.x * inv).round() as i64;
    let v = (kp_l.y * inv).round() as i64;
    let ur0 = (u_right0 * inv).round() as i64;
    let w = SAD_HALF_WINDOW;
    let l = SAD_SEARCH;

    let rows_ok = v - w >= 0 && v + w < left.height().min(right.height()) as i64;
    let left_ok = ul - w >= 0 && ul + w < left.width() as i64;
    // Offsets whose block stays inside the right image
    let lo = (-l).max(w - ur0);
    let hi = l.min(right.width() as i64 - 1 - w - ur0);
    if !(rows_ok && left_ok) || hi - lo < 2 {
        return BlockMatch::Rejected;
    }

    let sads: Vec<u32> = (lo..=hi).map(|inc| block_sad(left, ul, right, ur0 + inc, v)).collect();
    let Some((best, best_sad)) = sads.iter().copied().enumerate().min_by_key(|&(_, sad)| sad) else {
        return BlockMatch::Rejected;
    };
    if sads.iter().all(|&sad| sad == best_sad) {
        return BlockMatch::Flat;
    }
    if best == 0 || best == sads.len() - 1 {
        return BlockMatch::Rejected;
    }

    let d1 = sads[best - 1] as f64;
    let d2 = best_sad as f64;
    let d3 = sads[best + 1] as f64;
    let denom = 2.0 * (d1 + d3 - 2.0 * d2);
    let delta = if denom > 0.0 { (d1 - d3) / denom } else { 0.0 };
    if !(-1.0..=1.0).contains(&delta) {
        return BlockMatch::Rejected;
    }

    let inc = lo + best as i64;
    BlockMatch::Refined {
        u_right: scale * ((ur0 + inc) as f64 + delta),
        sad: best_sad,
    }
}

/// Match left keypoints against right keypoints along image rows.
///
/// The best descriptor match is refined on the rectified images. Refined
/// matches whose block distance is far above the median are dropped.
pub fn compute_stereo_matches(
    left: &FeatureSet,
    right: &FeatureSet,
    left_image: &GrayImage,
    right_image: &GrayImage,
    pyramid: &ScalePyramid,
    camera: &CameraModel,
) -> StereoDepth {
    let n = left.len();
    let mut out = StereoDepth::empty(n);
    let rows = left_image.height() as usize;
    if rows == 0 || camera.baseline <= 0.0 {
        return out;
    }

    // Bucket right keypoints into every row their scale-dependent band touches
    let mut row_index: Vec<Vec<usize>> = vec![Vec::new(); rows];
    for (ir, kp) in right.keypoints.iter().enumerate() {
        let r = 2.0 * pyramid.scale_factors[pyramid.level(kp.octave)];
        let min_r = (kp.y - r).floor().max(0.0) as usize;
        let max_r = ((kp.y + r).ceil().max(0.0) as usize).min(rows - 1);
        for bucket in row_index.iter_mut().take(max_r + 1).skip(min_r) {
            bucket.push(ir);
        }
    }

    let left_levels = image_pyramid(left_image, pyramid);
    let right_levels = image_pyramid(right_image, pyramid);

    let bf = camera.bf();
    let min_d = 0.0;
    let max_d = bf / camera.baseline;
    let mut sad_index: Vec<(u32, usize)> = Vec::with_capacity(n);

    for (il, kp_l) in left.keypoints.iter().enumerate() {
        let v_l = kp_l.y;
        if v_l < 0.0 || v_l as usize >= rows {
            continue;
        }
        let candidates = &row_index[v_l as usize];
        if candidates.is_empty() {
            continue;
        }

        let level_l = kp_l.octave;
        let min_u = kp_l.x - max_d;
        let max_u = kp_l.x - min_d;
        if max_u < 0.0 {
            continue;
        }

        let desc_l = &left.descriptors[il];
        let mut best_dist = u32::MAX;
        let mut best_ur = None;
        for &ir in candidates {
            let kp_r = &right.keypoints[ir];
            if kp_r.octave < level_l - 1 || kp_r.octave > level_l + 1 {
                continue;
            }
            if kp_r.x < min_u || kp_r.x > max_u {
                continue;
            }
            let dist = descriptor_distance(desc_l, &right.descriptors[ir]);
            if dist < best_dist {
                best_dist = dist;
                best_ur = Some(kp_r.x);
            }
        }

        let Some(u_r0) = best_ur else {
            continue;
        };
        if best_dist >= TH_STEREO {
            continue;
        }

        let level = pyramid.level(kp_l.octave);
        let (mut u_r, sad) = match refine_by_block_matching(
            &left_levels[level],
            &right_levels[level],
            kp_l,
            u_r0,
            pyramid.scale_factors[level],
        ) {
            BlockMatch::Refined { u_right, sad } => (u_right, Some(sad)),
            BlockMatch::Flat => (u_r0, None),
            BlockMatch::Rejected => continue,
        };

        let mut disparity = kp_l.x - u_r;
        if disparity >= min_d && disparity < max_d {
            if disparity <= 0.0 {
                disparity = 0.01;
                u_r = kp_l.x - 0.01;
            }
            out.depth[il] = bf / disparity;
            out.u_right[il] = u_r;
            if let Some(sad) = sad {
                sad_index.push((sad, il));
            }
        }
    }

    if !sad_index.is_empty() {
        sad_index.sort_unstable();
        let median = sad_index[sad_index.len() / 2].0 as f64;
        let th = 1.5 * 1.4 * median;
        for &(sad, il) in sad_index.iter().rev() {
            if sad as f64 <= th {
                break;
            }
            out.invalidate(il);
        }
    }

    out
}

/// Read depth for each keypoint from a registered metric depth map.
///
/// Depth is sampled at the raw (distorted) keypoint pixel, the synthetic right
/// coordinate uses the undistorted one.
pub fn compute_rgbd_depth(
    keypoints: &[KeyPoint],
    keypoints_un: &[KeyPoint],
    depth_map: &DepthImage,
    camera: &CameraModel,
) -> StereoDepth {
    let mut out = StereoDepth::empty(keypoints.len());
    let bf = camera.bf();
    for (i, (kp, kp_un)) in keypoints.iter().zip(keypoints_un).enumerate() {
        if kp.x < 0.0 || kp.y < 0.0 {
            continue;
        }
        let (x, y) = (kp.x as u32, kp.y as u32);
        if x >= depth_map.width() || y >= depth_map.height() {
            continue;
        }
        let d = depth_map.get_pixel(x, y).0[0] as f64;
        if d > 0.0 {
            out.depth[i] = d;
            out.u_right[i] = kp_un.x - bf / d;
        }
    }
    out
}
