//! Perspective-n-Point with RANSAC.
//!
//! Minimal hypotheses come from a normalized DLT on six correspondences,
//! the winning hypothesis is re-estimated on its full inlier set. The solver
//! is stateful so callers can interleave a few iterations per candidate and
//! keep the remaining budget for the next round.

use nalgebra::{DMatrix, Matrix3, Matrix3x4, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;

use crate::geometry::SE3;

/// One 3D-2D correspondence.
#[derive(Debug, Clone)]
pub struct PnpCorrespondence {
    pub point_world: Vector3<f64>,
    /// Undistorted pixel coordinates.
    pub pixel: Vector2<f64>,
    /// Pyramid level variance of the observation.
    pub sigma2: f64,
}

#[derive(Debug, Clone)]
pub struct PnpRansacParams {
    pub probability: f64,
    pub min_inliers: usize,
    pub max_iterations: usize,
    pub min_set: usize,
    pub epsilon: f64,
    pub th2: f64,
}

impl Default for PnpRansacParams {
    fn default() -> Self {
        Self {
            probability: 0.99,
            min_inliers: 10,
            max_iterations: 300,
            min_set: 6,
            epsilon: 0.5,
            th2: 5.991,
        }
    }
}

/// Outcome of a bounded batch of RANSAC iterations.
#[derive(Debug, Clone)]
pub enum PnpStep {
    /// A pose with enough inliers. `inliers[i]` refers to correspondence `i`.
    Found { pose: SE3, inliers: Vec<bool> },
    /// No pose yet, budget remains.
    Continue,
    /// Budget exhausted without an acceptable pose.
    Exhausted,
}

pub struct PnpSolver {
    correspondences: Vec<PnpCorrespondence>,
    k: Matrix3<f64>,
    k_inv: Matrix3<f64>,
    min_inliers: usize,
    max_iterations: usize,
    min_set: usize,
    th2: f64,
    iterations: usize,
    best_inliers: Vec<bool>,
    best_count: usize,
    best_pose: Option<SE3>,
    rng: StdRng,
}

impl PnpSolver {
    pub fn new(
        correspondences: Vec<PnpCorrespondence>,
        k: Matrix3<f64>,
        params: &PnpRansacParams,
        seed: u64,
    ) -> Self {
        let n = correspondences.len();
        let min_set = params.min_set.max(6);
        let min_inliers = params
            .min_inliers
            .max(min_set)
            .max((params.epsilon * n as f64) as usize);

        let epsilon = if n > 0 {
            params.epsilon.max(min_inliers as f64 / n as f64)
        } else {
            params.epsilon
        };

        let needed = if min_inliers == n {
            1
        } else {
            let denom = (1.0 - epsilon.powi(min_set as i32)).ln();
            if denom.abs() < f64::EPSILON {
                1
            } else {
                ((1.0 - params.probability).ln() / denom).ceil().max(1.0) as usize
            }
        };
        let max_iterations = needed.min(params.max_iterations).max(1);

        Self {
            correspondences,
            k_inv: k.try_inverse().unwrap_or_else(Matrix3::identity),
            k,
            min_inliers,
            max_iterations,
            min_set,
            th2: params.th2,
            iterations: 0,
            best_inliers: vec![false; n],
            best_count: 0,
            best_pose: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Run at most `n` more iterations.
    pub fn iterate(&mut self, n: usize) -> PnpStep {
        let total = self.correspondences.len();
        if total < self.min_inliers || total < self.min_set {
            return PnpStep::Exhausted;
        }

        let mut done = 0;
        while self.iterations < self.max_iterations && done < n {
            self.iterations += 1;
            done += 1;

            let sample_idx = sample(&mut self.rng, total, self.min_set).into_vec();
            let Some(pose) = self.estimate(&sample_idx) else {
                continue;
            };

            let (inliers, count) = self.check_inliers(&pose);
            if count < self.min_inliers {
                continue;
            }

            if count > self.best_count {
                self.best_count = count;
                self.best_inliers = inliers.clone();
                self.best_pose = Some(pose);
            }

            if let Some(step) = self.refine(&inliers) {
                return step;
            }
        }

        if self.iterations >= self.max_iterations {
            if self.best_count >= self.min_inliers {
                if let Some(pose) = self.best_pose {
                    return PnpStep::Found {
                        pose,
                        inliers: self.best_inliers.clone(),
                    };
                }
            }
            return PnpStep::Exhausted;
        }

        PnpStep::Continue
    }

    fn refine(&self, inliers: &[bool]) -> Option<PnpStep> {
        let idx: Vec<usize> = inliers
            .iter()
            .enumerate()
            .filter_map(|(i, &ok)| ok.then_some(i))
            .collect();
        let pose = self.estimate(&idx)?;
        let (refined, count) = self.check_inliers(&pose);
        (count > self.min_inliers).then_some(PnpStep::Found {
            pose,
            inliers: refined,
        })
    }

    fn check_inliers(&self, pose: &SE3) -> (Vec<bool>, usize) {
        let mut count = 0;
        let inliers = self
            .correspondences
            .iter()
            .map(|c| {
                let pc = pose.transform_point(&c.point_world);
                if pc.z <= 0.0 {
                    return false;
                }
                let proj = self.k * (pc / pc.z);
                let err2 = (Vector2::new(proj.x, proj.y) - c.pixel).norm_squared();
                let ok = err2 < self.th2 * c.sigma2;
                if ok {
                    count += 1;
                }
                ok
            })
            .collect();
        (inliers, count)
    }

    fn estimate(&self, indices: &[usize]) -> Option<SE3> {
        let pairs: Vec<(Vector3<f64>, Vector2<f64>)> = indices
            .iter()
            .map(|&i| {
                let c = &self.correspondences[i];
                let n = self.k_inv * Vector3::new(c.pixel.x, c.pixel.y, 1.0);
                (c.point_world, Vector2::new(n.x / n.z, n.y / n.z))
            })
            .collect();
        dlt_pose(&pairs)
    }
}

/// Linear pose from normalized image coordinates (`K⁻¹ u`).
///
/// Needs six or more non-coplanar points. World points are centered and
/// scaled before building the system, the projection matrix is then
/// de-normalized and projected onto a rotation.
pub fn dlt_pose(pairs: &[(Vector3<f64>, Vector2<f64>)]) -> Option<SE3> {
    if pairs.len() < 6 {
        return None;
    }

    let n = pairs.len() as f64;
    let centroid = pairs.iter().map(|(p, _)| p).sum::<Vector3<f64>>() / n;
    let mean_dist = pairs.iter().map(|(p, _)| (p - centroid).norm()).sum::<f64>() / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = 3f64.sqrt() / mean_dist;

    let mut a = DMatrix::<f64>::zeros(2 * pairs.len(), 12);
    for (i, (pw, x)) in pairs.iter().enumerate() {
        let p = (pw - centroid) * s;
        let r0 = 2 * i;
        let r1 = r0 + 1;
        let hp = [p.x, p.y, p.z, 1.0];
        for j in 0..4 {
            a[(r0, j)] = hp[j];
            a[(r0, 8 + j)] = -x.x * hp[j];
            a[(r1, 4 + j)] = hp[j];
            a[(r1, 8 + j)] = -x.y * hp[j];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let row = v_t.row(min_idx);

    let mut p_norm = Matrix3x4::<f64>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            p_norm[(r, c)] = row[4 * r + c];
        }
    }

    // Undo the point normalization: P = P̃ · [sI | -s c]
    let m_norm: Matrix3<f64> = p_norm.fixed_view::<3, 3>(0, 0).into_owned();
    let m = m_norm * s;
    let p4 = p_norm.column(3) - m * centroid;

    let (m, p4) = if m.determinant() < 0.0 { (-m, -p4) } else { (m, p4) };

    let svd_m = m.svd(true, true);
    let u = svd_m.u?;
    let vt = svd_m.v_t?;
    let r = u * vt;
    if r.determinant() < 0.0 {
        return None;
    }
    let scale = svd_m.singular_values.mean();
    if scale < 1e-12 {
        return None;
    }
    let t = p4 / scale;

    Some(SE3::from_rt(&r, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::Rng;

    fn intrinsics() -> Matrix3<f64> {
        Matrix3::new(450.0, 0.0, 320.0, 0.0, 450.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn scene(pose: &SE3, n: usize, seed: u64) -> Vec<PnpCorrespondence> {
        let k = intrinsics();
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let pw = Vector3::new(
                    rng.gen_range(-3.0..3.0),
                    rng.gen_range(-2.0..2.0),
                    rng.gen_range(4.0..10.0),
                );
                let pc = pose.transform_point(&pw);
                let uv = k * (pc / pc.z);
                PnpCorrespondence {
                    point_world: pw,
                    pixel: Vector2::new(uv.x, uv.y),
                    sigma2: 1.0,
                }
            })
            .collect()
    }

    fn test_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.02, -0.05, 0.01),
            Vector3::new(0.1, -0.05, 0.2),
        )
    }

    #[test]
    fn test_dlt_exact_recovery() {
        let pose = test_pose();
        let k_inv = intrinsics().try_inverse().unwrap();
        let pairs: Vec<_> = scene(&pose, 20, 1)
            .into_iter()
            .map(|c| {
                let n = k_inv * Vector3::new(c.pixel.x, c.pixel.y, 1.0);
                (c.point_world, Vector2::new(n.x, n.y))
            })
            .collect();
        let est = dlt_pose(&pairs).unwrap();
        assert_relative_eq!(est.translation, pose.translation, epsilon = 1e-6);
        assert_relative_eq!(est.rotation.angle_to(&pose.rotation), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_ransac_with_outliers() {
        let pose = test_pose();
        let mut corr = scene(&pose, 80, 2);
        for c in corr.iter_mut().take(20) {
            c.pixel += Vector2::new(60.0, -45.0);
        }

        let mut solver = PnpSolver::new(corr, intrinsics(), &PnpRansacParams::default(), 7);
        let mut result = None;
        for _ in 0..60 {
            match solver.iterate(5) {
                PnpStep::Found { pose, inliers } => {
                    result = Some((pose, inliers));
                    break;
                }
                PnpStep::Continue => {}
                PnpStep::Exhausted => break,
            }
        }

        let (est, inliers) = result.expect("solver should find the pose");
        assert!(inliers.iter().take(20).all(|&i| !i));
        assert_eq!(inliers.iter().filter(|&&i| i).count(), 60);
        assert_relative_eq!(est.translation, pose.translation, epsilon = 1e-6);
    }

    #[test]
    fn test_too_few_correspondences_exhausts() {
        let corr = scene(&test_pose(), 5, 3);
        let mut solver = PnpSolver::new(corr, intrinsics(), &PnpRansacParams::default(), 0);
        assert!(matches!(solver.iterate(5), PnpStep::Exhausted));
    }
}
