//! Pose-only optimization for tracking.
//!
//! Refines a frame's world-to-camera pose with map point positions held
//! fixed. Residuals are reprojection errors `e = obs - proj(T_cw · X_w)`,
//! 2D for monocular observations and 3D `(u, v, u_right)` for observations
//! with a right-image coordinate. The solver runs four rounds of ten
//! Gauss-Newton iterations; after each round every observation is
//! re-classified by a chi-square test and only inliers take part in the
//! next one. A Huber kernel protects the first two rounds.

use nalgebra::{Matrix2x3, Matrix3, Matrix3x6, Matrix6, Vector2, Vector3, Vector6};
use tracing::debug;

use crate::atlas::map::Map;
use crate::geometry::so3::skew;
use crate::geometry::SE3;
use crate::tracking::frame::CameraModel;
use crate::tracking::tracking_frame::Frame;

/// 95% chi-square quantile, 2 DOF.
pub const CHI2_MONO: f64 = 5.991;
/// 95% chi-square quantile, 3 DOF.
pub const CHI2_STEREO: f64 = 7.815;

const ROUNDS: usize = 4;
const ITERATIONS_PER_ROUND: usize = 10;
/// Rounds using the robust kernel.
const ROBUST_ROUNDS: usize = 2;

/// A fixed 3D point observed by the frame being optimized.
#[derive(Debug, Clone)]
pub struct PoseObservation {
    pub point_world: Vector3<f64>,
    /// Undistorted keypoint.
    pub uv: Vector2<f64>,
    /// Right-image coordinate for stereo observations.
    pub u_right: Option<f64>,
    /// Inverse of the keypoint's level variance.
    pub inv_sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct PoseOptimizationResult {
    pub pose: SE3,
    /// `outliers[i]` refers to observation `i`.
    pub outliers: Vec<bool>,
    pub num_inliers: usize,
}

/// Optimize a pose against fixed points.
pub fn optimize_pose_observations(
    initial: &SE3,
    observations: &[PoseObservation],
    camera: &CameraModel,
) -> PoseOptimizationResult {
    let n = observations.len();
    let mut outliers = vec![false; n];
    if n < 3 {
        return PoseOptimizationResult {
            pose: *initial,
            outliers,
            num_inliers: 0,
        };
    }

    let mut pose = *initial;
    let mut num_bad = 0;
    for round in 0..ROUNDS {
        // Each round restarts from the initial estimate with the current
        // inlier set.
        pose = *initial;
        let robust = round < ROBUST_ROUNDS;

        for _ in 0..ITERATIONS_PER_ROUND {
            let mut h = Matrix6::<f64>::zeros();
            let mut g = Vector6::<f64>::zeros();
            let mut active = 0;

            for (i, obs) in observations.iter().enumerate() {
                if outliers[i] {
                    continue;
                }
                let pc = pose.transform_point(&obs.point_world);
                if pc.z <= 0.0 {
                    continue;
                }
                let (e, j) = residual_and_jacobian(obs, &pc, camera);
                let chi2 = e.norm_squared() * obs.inv_sigma2;
                let delta2 = if obs.u_right.is_some() { CHI2_STEREO } else { CHI2_MONO };
                let w = if robust { huber_weight(chi2, delta2) } else { 1.0 };
                let info = obs.inv_sigma2 * w;

                h += j.transpose() * j * info;
                g += j.transpose() * e * info;
                active += 1;
            }

            if active < 3 {
                break;
            }

            let Some(delta) = h.lu().solve(&(-g)) else {
                break;
            };
            let omega = Vector3::new(delta[0], delta[1], delta[2]);
            let upsilon = Vector3::new(delta[3], delta[4], delta[5]);
            pose = pose.perturb_left(&omega, &upsilon);

            if delta.norm_squared() < 1e-14 {
                break;
            }
        }

        num_bad = 0;
        for (i, obs) in observations.iter().enumerate() {
            let pc = pose.transform_point(&obs.point_world);
            let (chi2, th) = if pc.z <= 0.0 {
                (f64::INFINITY, 0.0)
            } else {
                let (e, _) = residual_and_jacobian(obs, &pc, camera);
                let th = if obs.u_right.is_some() { CHI2_STEREO } else { CHI2_MONO };
                (e.norm_squared() * obs.inv_sigma2, th)
            };
            outliers[i] = chi2 > th;
            if outliers[i] {
                num_bad += 1;
            }
        }

        if n - num_bad < 10 {
            break;
        }
    }

    PoseOptimizationResult {
        pose,
        outliers,
        num_inliers: n - num_bad,
    }
}

/// Residual `obs - pred` with its Jacobian w.r.t. a left perturbation
/// `[ω, υ]` of the pose. Rows are `(u, v)` or `(u, v, u_right)`; monocular
/// observations leave the third row at zero.
fn residual_and_jacobian(
    obs: &PoseObservation,
    pc: &Vector3<f64>,
    camera: &CameraModel,
) -> (Vector3<f64>, Matrix3x6<f64>) {
    let inv_z = 1.0 / pc.z;
    let inv_z2 = inv_z * inv_z;
    let u = camera.fx * pc.x * inv_z + camera.cx;
    let v = camera.fy * pc.y * inv_z + camera.cy;

    let d_proj: Matrix2x3<f64> = Matrix2x3::new(
        camera.fx * inv_z, 0.0, -camera.fx * pc.x * inv_z2,
        0.0, camera.fy * inv_z, -camera.fy * pc.y * inv_z2,
    );
    // ∂p_c/∂[ω, υ] = [-[p_c]×, I]
    let mut d_pc = Matrix3x6::<f64>::zeros();
    d_pc.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-skew(pc)));
    d_pc.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());

    let mut j_proj = Matrix3::<f64>::zeros();
    j_proj.fixed_view_mut::<2, 3>(0, 0).copy_from(&d_proj);

    let mut e = Vector3::new(obs.uv.x - u, obs.uv.y - v, 0.0);
    if let Some(ur_obs) = obs.u_right {
        let ur = u - camera.bf() * inv_z;
        e.z = ur_obs - ur;
        j_proj[(2, 0)] = camera.fx * inv_z;
        j_proj[(2, 2)] = -camera.fx * pc.x * inv_z2 + camera.bf() * inv_z2;
    }

    (e, -(j_proj * d_pc))
}

fn huber_weight(chi2: f64, delta2: f64) -> f64 {
    if chi2 <= delta2 {
        1.0
    } else {
        (delta2 / chi2).sqrt()
    }
}

/// Optimize a frame's pose against its matched map points.
///
/// Outlier flags of matched features are rewritten, the pose is replaced by
/// the estimate, and the number of inliers is returned. Features pointing at
/// erased points are skipped. A frame without a pose is left untouched.
pub fn optimize_frame_pose(frame: &mut Frame, map: &Map) -> usize {
    let Some(initial) = frame.pose_cw else {
        return 0;
    };

    let mut indices = Vec::new();
    let mut observations = Vec::new();
    for (i, mp_id) in frame.map_points.iter().enumerate() {
        let Some(mp) = mp_id.and_then(|id| map.get_map_point(id)) else {
            continue;
        };
        let kp = &frame.keypoints_un[i];
        let level = frame.pyramid().level(kp.octave);
        observations.push(PoseObservation {
            point_world: mp.position,
            uv: Vector2::new(kp.x, kp.y),
            u_right: frame.has_stereo(i).then(|| frame.u_right[i]),
            inv_sigma2: frame.pyramid().inv_level_sigma2[level],
        });
        indices.push(i);
    }

    if observations.len() < 3 {
        return 0;
    }

    let result = optimize_pose_observations(&initial, &observations, frame.camera());
    for (k, &i) in indices.iter().enumerate() {
        frame.outliers[i] = result.outliers[k];
    }
    frame.set_pose(result.pose);
    debug!(
        "Pose optimization on frame {}: {}/{} inliers",
        frame.id,
        result.num_inliers,
        observations.len()
    );
    result.num_inliers
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn camera() -> CameraModel {
        CameraModel::new(450.0, 450.0, 320.0, 240.0).with_baseline(0.1)
    }

    fn observations(pose: &SE3, n: usize, stereo: bool) -> Vec<PoseObservation> {
        let cam = camera();
        let mut rng = StdRng::seed_from_u64(11);
        (0..n)
            .map(|i| {
                let pw = Vector3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(4.0..12.0),
                );
                let pc = pose.transform_point(&pw);
                let uv = cam.project(&pc);
                PoseObservation {
                    point_world: pw,
                    uv,
                    u_right: (stereo && i % 2 == 0).then(|| uv.x - cam.bf() / pc.z),
                    inv_sigma2: 1.0,
                }
            })
            .collect()
    }

    fn true_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.01, 0.03, -0.02),
            Vector3::new(0.05, -0.1, 0.2),
        )
    }

    #[test]
    fn test_converges_from_perturbed_pose() {
        let pose = true_pose();
        let obs = observations(&pose, 60, true);
        let initial = pose.perturb_left(&Vector3::new(0.01, -0.01, 0.005), &Vector3::new(0.03, 0.02, -0.04));

        let result = optimize_pose_observations(&initial, &obs, &camera());
        assert_eq!(result.num_inliers, 60);
        assert_relative_eq!(result.pose.translation, pose.translation, epsilon = 1e-6);
        assert_relative_eq!(result.pose.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_flags_injected_outliers() {
        let pose = true_pose();
        let mut obs = observations(&pose, 60, false);
        for o in obs.iter_mut().take(6) {
            o.uv += Vector2::new(40.0, -35.0);
        }
        let initial = pose.perturb_left(&Vector3::new(0.005, 0.0, 0.0), &Vector3::new(0.02, 0.0, 0.0));

        let result = optimize_pose_observations(&initial, &obs, &camera());
        assert!(result.outliers.iter().take(6).all(|&o| o));
        assert!(result.outliers.iter().skip(6).all(|&o| !o));
        assert_eq!(result.num_inliers, 54);
        assert_relative_eq!(result.pose.translation, pose.translation, epsilon = 1e-4);
    }

    #[test]
    fn test_too_few_observations() {
        let pose = true_pose();
        let obs = observations(&pose, 2, false);
        let result = optimize_pose_observations(&pose, &obs, &camera());
        assert_eq!(result.num_inliers, 0);
    }
}
