//! Two-view motion recovery for monocular map bootstrapping.
//!
//! A homography and a fundamental matrix are estimated in parallel with
//! RANSAC over the same 8-point minimal sets. The model with the better
//! symmetric-transfer score is decomposed into (R, t) hypotheses, and the
//! hypothesis that triangulates the most points in front of both cameras
//! wins, provided it is unambiguous and has enough parallax.

use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, SymmetricEigen, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::SeedableRng;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct TwoViewParams {
    /// Keypoint position standard deviation in pixels.
    pub sigma: f64,
    pub iterations: usize,
    pub min_parallax_deg: f64,
    pub min_triangulated: usize,
    pub seed: u64,
}

impl Default for TwoViewParams {
    fn default() -> Self {
        Self {
            sigma: 1.0,
            iterations: 200,
            min_parallax_deg: 1.0,
            min_triangulated: 50,
            seed: 0,
        }
    }
}

/// Relative motion of view 2 w.r.t. view 1 plus the triangulated structure.
#[derive(Debug, Clone)]
pub struct TwoViewReconstruction {
    pub r21: Matrix3<f64>,
    pub t21: Vector3<f64>,
    /// Triangulated point per keypoint of view 1, in view 1 coordinates.
    pub points: Vec<Option<Vector3<f64>>>,
    /// Whether the point had enough parallax to be used.
    pub triangulated: Vec<bool>,
}

/// Which model drove the reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoViewModel {
    Homography,
    Fundamental,
}

pub struct TwoViewReconstructor {
    k: Matrix3<f64>,
    params: TwoViewParams,
}

struct CheckedMotion {
    n_good: usize,
    parallax_deg: f64,
    points: Vec<Option<Vector3<f64>>>,
    triangulated: Vec<bool>,
}

impl TwoViewReconstructor {
    pub fn new(k: Matrix3<f64>, params: TwoViewParams) -> Self {
        Self { k, params }
    }

    /// Reconstruct from undistorted keypoints of both views and the
    /// candidate matches `matches12[i1] = Some(i2)`.
    pub fn reconstruct(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches12: &[Option<usize>],
    ) -> Option<(TwoViewModel, TwoViewReconstruction)> {
        let matches: Vec<(usize, usize)> = matches12
            .iter()
            .enumerate()
            .filter_map(|(i1, m)| m.map(|i2| (i1, i2)))
            .collect();
        if matches.len() < 8 {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let sets: Vec<Vec<usize>> = (0..self.params.iterations)
            .map(|_| sample(&mut rng, matches.len(), 8).into_vec())
            .collect();

        let (h_inliers, sh, h21) = self.find_homography(kps1, kps2, &matches, &sets);
        let (f_inliers, sf, f21) = self.find_fundamental(kps1, kps2, &matches, &sets);

        if sh + sf <= 0.0 {
            return None;
        }
        let rh = sh / (sh + sf);
        debug!("two-view scores: SH={:.1} SF={:.1} RH={:.3}", sh, sf, rh);

        if rh > 0.40 {
            let h21 = h21?;
            self.reconstruct_h(kps1, kps2, &matches, &h_inliers, &h21)
                .map(|r| (TwoViewModel::Homography, r))
        } else {
            let f21 = f21?;
            self.reconstruct_f(kps1, kps2, &matches, &f_inliers, &f21)
                .map(|r| (TwoViewModel::Fundamental, r))
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Model search
    // ─────────────────────────────────────────────────────────────────────────

    fn find_homography(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        sets: &[Vec<usize>],
    ) -> (Vec<bool>, f64, Option<Matrix3<f64>>) {
        let (pn1, t1) = normalize(kps1);
        let (pn2, t2) = normalize(kps2);
        let Some(t2_inv) = t2.try_inverse() else {
            return (vec![false; matches.len()], 0.0, None);
        };

        let mut best = (vec![false; matches.len()], 0.0, None);
        for set in sets {
            let p1: Vec<_> = set.iter().map(|&j| pn1[matches[j].0]).collect();
            let p2: Vec<_> = set.iter().map(|&j| pn2[matches[j].1]).collect();
            let Some(hn) = compute_h21(&p1, &p2) else {
                continue;
            };
            let h21 = t2_inv * hn * t1;
            let Some(h12) = h21.try_inverse() else {
                continue;
            };
            let (inliers, score) = self.check_homography(kps1, kps2, matches, &h21, &h12);
            if score > best.1 {
                best = (inliers, score, Some(h21));
            }
        }
        best
    }

    fn find_fundamental(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        sets: &[Vec<usize>],
    ) -> (Vec<bool>, f64, Option<Matrix3<f64>>) {
        let (pn1, t1) = normalize(kps1);
        let (pn2, t2) = normalize(kps2);
        let t2t = t2.transpose();

        let mut best = (vec![false; matches.len()], 0.0, None);
        for set in sets {
            let p1: Vec<_> = set.iter().map(|&j| pn1[matches[j].0]).collect();
            let p2: Vec<_> = set.iter().map(|&j| pn2[matches[j].1]).collect();
            let Some(fn_) = compute_f21(&p1, &p2) else {
                continue;
            };
            let f21 = t2t * fn_ * t1;
            let (inliers, score) = self.check_fundamental(kps1, kps2, matches, &f21);
            if score > best.1 {
                best = (inliers, score, Some(f21));
            }
        }
        best
    }

    fn check_homography(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        h21: &Matrix3<f64>,
        h12: &Matrix3<f64>,
    ) -> (Vec<bool>, f64) {
        const TH: f64 = 5.991;
        let inv_sigma2 = 1.0 / (self.params.sigma * self.params.sigma);
        let mut score = 0.0;

        let inliers = matches
            .iter()
            .map(|&(i1, i2)| {
                let x1 = kps1[i1];
                let x2 = kps2[i2];
                let mut inlier = true;

                let chi1 = transfer_error(h12, &x2, &x1) * inv_sigma2;
                if chi1 > TH {
                    inlier = false;
                } else {
                    score += TH - chi1;
                }

                let chi2 = transfer_error(h21, &x1, &x2) * inv_sigma2;
                if chi2 > TH {
                    inlier = false;
                } else {
                    score += TH - chi2;
                }
                inlier
            })
            .collect();
        (inliers, score)
    }

    fn check_fundamental(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        f21: &Matrix3<f64>,
    ) -> (Vec<bool>, f64) {
        const TH: f64 = 3.841;
        const TH_SCORE: f64 = 5.991;
        let inv_sigma2 = 1.0 / (self.params.sigma * self.params.sigma);
        let mut score = 0.0;

        let inliers = matches
            .iter()
            .map(|&(i1, i2)| {
                let x1 = Vector3::new(kps1[i1].x, kps1[i1].y, 1.0);
                let x2 = Vector3::new(kps2[i2].x, kps2[i2].y, 1.0);
                let mut inlier = true;

                // Distance of x2 to the epipolar line F21 x1
                let l2 = f21 * x1;
                let chi1 = epipolar_sq_distance(&l2, &x2) * inv_sigma2;
                if chi1 > TH {
                    inlier = false;
                } else {
                    score += TH_SCORE - chi1;
                }

                // Distance of x1 to the epipolar line F21ᵀ x2
                let l1 = f21.transpose() * x2;
                let chi2 = epipolar_sq_distance(&l1, &x1) * inv_sigma2;
                if chi2 > TH {
                    inlier = false;
                } else {
                    score += TH_SCORE - chi2;
                }
                inlier
            })
            .collect();
        (inliers, score)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Motion recovery
    // ─────────────────────────────────────────────────────────────────────────

    fn reconstruct_f(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        inliers: &[bool],
        f21: &Matrix3<f64>,
    ) -> Option<TwoViewReconstruction> {
        let n = inliers.iter().filter(|&&b| b).count();
        let e21 = self.k.transpose() * f21 * self.k;
        let (r1, r2, t) = decompose_essential(&e21)?;

        let th2 = 4.0 * self.params.sigma * self.params.sigma;
        let hypotheses = [(r1, t), (r2, t), (r1, -t), (r2, -t)];
        let checked: Vec<CheckedMotion> = hypotheses
            .iter()
            .map(|(r, t)| self.check_rt(r, t, kps1, kps2, matches, inliers, th2))
            .collect();

        let max_good = checked.iter().map(|c| c.n_good).max().unwrap_or(0);
        let min_good = ((0.9 * n as f64) as usize).max(self.params.min_triangulated);
        let n_similar = checked
            .iter()
            .filter(|c| c.n_good as f64 > 0.7 * max_good as f64)
            .count();

        if max_good < min_good || n_similar > 1 {
            debug!(
                "fundamental reconstruction ambiguous: max_good={} min_good={} similar={}",
                max_good, min_good, n_similar
            );
            return None;
        }

        let (idx, best) = checked
            .into_iter()
            .enumerate()
            .find(|(_, c)| c.n_good == max_good)?;
        if best.parallax_deg <= self.params.min_parallax_deg {
            debug!("fundamental reconstruction: parallax {:.2}° too low", best.parallax_deg);
            return None;
        }

        let (r, t) = hypotheses[idx];
        Some(TwoViewReconstruction {
            r21: r,
            t21: t,
            points: best.points,
            triangulated: best.triangulated,
        })
    }

    fn reconstruct_h(
        &self,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        inliers: &[bool],
        h21: &Matrix3<f64>,
    ) -> Option<TwoViewReconstruction> {
        let n = inliers.iter().filter(|&&b| b).count();
        let k_inv = self.k.try_inverse()?;
        let a = k_inv * h21 * self.k;

        let (u, w, vt) = sorted_svd3(&a)?;
        let s = u.determinant() * vt.determinant();
        let (d1, d2, d3) = (w[0], w[1], w[2]);

        // Equal singular values mean no translation (pure rotation) or a
        // degenerate plane, neither gives a usable baseline.
        if d1 / d2 < 1.00001 || d2 / d3 < 1.00001 {
            debug!("homography reconstruction: degenerate singular values");
            return None;
        }

        let aux1 = ((d1 * d1 - d2 * d2) / (d1 * d1 - d3 * d3)).sqrt();
        let aux3 = ((d2 * d2 - d3 * d3) / (d1 * d1 - d3 * d3)).sqrt();
        let x1 = [aux1, aux1, -aux1, -aux1];
        let x3 = [aux3, -aux3, aux3, -aux3];

        let mut hypotheses: Vec<(Matrix3<f64>, Vector3<f64>)> = Vec::with_capacity(8);

        // d' = d2
        let aux_stheta = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 + d3) * d2);
        let ctheta = (d2 * d2 + d1 * d3) / ((d1 + d3) * d2);
        let stheta = [aux_stheta, -aux_stheta, -aux_stheta, aux_stheta];
        for i in 0..4 {
            let rp = Matrix3::new(ctheta, 0.0, -stheta[i], 0.0, 1.0, 0.0, stheta[i], 0.0, ctheta);
            let r = s * u * rp * vt;
            let tp = Vector3::new(x1[i], 0.0, -x3[i]) * (d1 - d3);
            let t = (u * tp).normalize();
            hypotheses.push((r, t));
        }

        // d' = -d2
        let aux_sphi = ((d1 * d1 - d2 * d2) * (d2 * d2 - d3 * d3)).sqrt() / ((d1 - d3) * d2);
        let cphi = (d1 * d3 - d2 * d2) / ((d1 - d3) * d2);
        let sphi = [aux_sphi, -aux_sphi, -aux_sphi, aux_sphi];
        for i in 0..4 {
            let rp = Matrix3::new(cphi, 0.0, sphi[i], 0.0, -1.0, 0.0, sphi[i], 0.0, -cphi);
            let r = s * u * rp * vt;
            let tp = Vector3::new(x1[i], 0.0, x3[i]) * (d1 + d3);
            let t = (u * tp).normalize();
            hypotheses.push((r, t));
        }

        let th2 = 4.0 * self.params.sigma * self.params.sigma;
        let mut best: Option<(usize, CheckedMotion)> = None;
        let mut second_best_good = 0;
        for (i, (r, t)) in hypotheses.iter().enumerate() {
            let checked = self.check_rt(r, t, kps1, kps2, matches, inliers, th2);
            let best_good = best.as_ref().map_or(0, |(_, c)| c.n_good);
            if checked.n_good > best_good {
                second_best_good = best_good;
                best = Some((i, checked));
            } else if checked.n_good > second_best_good {
                second_best_good = checked.n_good;
            }
        }

        let (idx, best) = best?;
        let accepted = (second_best_good as f64) < 0.75 * best.n_good as f64
            && best.parallax_deg >= self.params.min_parallax_deg
            && best.n_good > self.params.min_triangulated
            && best.n_good as f64 > 0.9 * n as f64;
        if !accepted {
            debug!(
                "homography reconstruction rejected: good={} second={} parallax={:.2}°",
                best.n_good, second_best_good, best.parallax_deg
            );
            return None;
        }

        let (r, t) = hypotheses[idx];
        Some(TwoViewReconstruction {
            r21: r,
            t21: t,
            points: best.points,
            triangulated: best.triangulated,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn check_rt(
        &self,
        r: &Matrix3<f64>,
        t: &Vector3<f64>,
        kps1: &[Vector2<f64>],
        kps2: &[Vector2<f64>],
        matches: &[(usize, usize)],
        inliers: &[bool],
        th2: f64,
    ) -> CheckedMotion {
        let (fx, fy, cx, cy) = (self.k[(0, 0)], self.k[(1, 1)], self.k[(0, 2)], self.k[(1, 2)]);

        let mut p1 = Matrix3x4::zeros();
        p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.k);
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(r);
        rt.set_column(3, t);
        let p2 = self.k * rt;
        let o2 = -(r.transpose() * t);

        let mut points = vec![None; kps1.len()];
        let mut triangulated = vec![false; kps1.len()];
        let mut cos_parallaxes = Vec::with_capacity(matches.len());

        for (&(i1, i2), _) in matches.iter().zip(inliers).filter(|(_, ok)| **ok) {
            let x1 = kps1[i1];
            let x2 = kps2[i2];
            let Some(p3d) = triangulate(&p1, &p2, &x1, &x2) else {
                continue;
            };

            let normal1 = p3d;
            let normal2 = p3d - o2;
            let cos_parallax = normal1.dot(&normal2) / (normal1.norm() * normal2.norm());

            if p3d.z <= 0.0 && cos_parallax < 0.99998 {
                continue;
            }
            let p3d_c2 = r * p3d + t;
            if p3d_c2.z <= 0.0 && cos_parallax < 0.99998 {
                continue;
            }

            let im1 = Vector2::new(fx * p3d.x / p3d.z + cx, fy * p3d.y / p3d.z + cy);
            if (im1 - x1).norm_squared() > th2 {
                continue;
            }
            let im2 = Vector2::new(
                fx * p3d_c2.x / p3d_c2.z + cx,
                fy * p3d_c2.y / p3d_c2.z + cy,
            );
            if (im2 - x2).norm_squared() > th2 {
                continue;
            }

            cos_parallaxes.push(cos_parallax);
            points[i1] = Some(p3d);
            if cos_parallax < 0.99998 {
                triangulated[i1] = true;
            }
        }

        let n_good = cos_parallaxes.len();
        let parallax_deg = if n_good > 0 {
            cos_parallaxes.sort_by(|a, b| a.total_cmp(b));
            let idx = 50.min(n_good - 1);
            cos_parallaxes[idx].clamp(-1.0, 1.0).acos().to_degrees()
        } else {
            0.0
        };

        CheckedMotion {
            n_good,
            parallax_deg,
            points,
            triangulated,
        }
    }
}

/// Linear triangulation from two projection matrices.
pub fn triangulate(
    p1: &Matrix3x4<f64>,
    p2: &Matrix3x4<f64>,
    x1: &Vector2<f64>,
    x2: &Vector2<f64>,
) -> Option<Vector3<f64>> {
    let mut a = Matrix4::zeros();
    a.set_row(0, &(x1.x * p1.row(2) - p1.row(0)));
    a.set_row(1, &(x1.y * p1.row(2) - p1.row(1)));
    a.set_row(2, &(x2.x * p2.row(2) - p2.row(0)));
    a.set_row(3, &(x2.y * p2.row(2) - p2.row(1)));

    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let x = v_t.row(idx);
    if x[3].abs() < 1e-12 {
        return None;
    }
    let p = Vector3::new(x[0] / x[3], x[1] / x[3], x[2] / x[3]);
    p.iter().all(|v| v.is_finite()).then_some(p)
}

/// Split E into the two rotations and the translation direction.
fn decompose_essential(e: &Matrix3<f64>) -> Option<(Matrix3<f64>, Matrix3<f64>, Vector3<f64>)> {
    let (u, _, vt) = sorted_svd3(e)?;
    let t = u.column(2).normalize();
    let w = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);

    let mut r1 = u * w * vt;
    if r1.determinant() < 0.0 {
        r1 = -r1;
    }
    let mut r2 = u * w.transpose() * vt;
    if r2.determinant() < 0.0 {
        r2 = -r2;
    }
    Some((r1, r2, t))
}

/// 3x3 SVD with singular values sorted in descending order.
fn sorted_svd3(m: &Matrix3<f64>) -> Option<(Matrix3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let svd = m.svd(true, true);
    let u = svd.u?;
    let vt = svd.v_t?;
    let w = svd.singular_values;

    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| w[b].total_cmp(&w[a]));

    let mut us = Matrix3::zeros();
    let mut vts = Matrix3::zeros();
    let mut ws = Vector3::zeros();
    for (dst, &src) in order.iter().enumerate() {
        us.set_column(dst, &u.column(src));
        vts.set_row(dst, &vt.row(src));
        ws[dst] = w[src];
    }
    Some((us, ws, vts))
}

/// Isotropic-ish normalization: zero mean, unit mean absolute deviation.
fn normalize(points: &[Vector2<f64>]) -> (Vec<Vector2<f64>>, Matrix3<f64>) {
    let n = points.len().max(1) as f64;
    let mean = points.iter().sum::<Vector2<f64>>() / n;
    let dev_x = points.iter().map(|p| (p.x - mean.x).abs()).sum::<f64>() / n;
    let dev_y = points.iter().map(|p| (p.y - mean.y).abs()).sum::<f64>() / n;
    let sx = if dev_x > 0.0 { 1.0 / dev_x } else { 1.0 };
    let sy = if dev_y > 0.0 { 1.0 / dev_y } else { 1.0 };

    let normalized = points
        .iter()
        .map(|p| Vector2::new((p.x - mean.x) * sx, (p.y - mean.y) * sy))
        .collect();
    let t = Matrix3::new(sx, 0.0, -mean.x * sx, 0.0, sy, -mean.y * sy, 0.0, 0.0, 1.0);
    (normalized, t)
}

fn compute_h21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let mut a = DMatrix::zeros(2 * p1.len(), 9);
    for (i, (x1, x2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (x1.x, x1.y, x2.x, x2.y);
        let r = 2 * i;
        a.row_mut(r).copy_from_slice(&[0.0, 0.0, 0.0, -u1, -v1, -1.0, v2 * u1, v2 * v1, v2]);
        a.row_mut(r + 1).copy_from_slice(&[u1, v1, 1.0, 0.0, 0.0, 0.0, -u2 * u1, -u2 * v1, -u2]);
    }
    let h = null_vector(&a)?;
    Some(Matrix3::from_row_slice(h.as_slice()))
}

fn compute_f21(p1: &[Vector2<f64>], p2: &[Vector2<f64>]) -> Option<Matrix3<f64>> {
    let mut a = DMatrix::zeros(p1.len(), 9);
    for (i, (x1, x2)) in p1.iter().zip(p2).enumerate() {
        let (u1, v1, u2, v2) = (x1.x, x1.y, x2.x, x2.y);
        a.row_mut(i).copy_from_slice(&[
            u2 * u1, u2 * v1, u2, v2 * u1, v2 * v1, v2, u1, v1, 1.0,
        ]);
    }
    let f = null_vector(&a)?;
    let f_pre = Matrix3::from_row_slice(f.as_slice());

    // Enforce rank 2
    let (u, mut w, vt) = sorted_svd3(&f_pre)?;
    w[2] = 0.0;
    Some(u * Matrix3::from_diagonal(&w) * vt)
}

/// Right null vector of `a` (eigenvector of AᵀA with the smallest eigenvalue).
fn null_vector(a: &DMatrix<f64>) -> Option<DVector<f64>> {
    let ata = a.transpose() * a;
    let eig = SymmetricEigen::new(ata);
    let (idx, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    Some(eig.eigenvectors.column(idx).into_owned())
}

fn transfer_error(h: &Matrix3<f64>, from: &Vector2<f64>, to: &Vector2<f64>) -> f64 {
    let p = h * Vector3::new(from.x, from.y, 1.0);
    if p.z.abs() < 1e-12 {
        return f64::INFINITY;
    }
    (Vector2::new(p.x / p.z, p.y / p.z) - to).norm_squared()
}

fn epipolar_sq_distance(line: &Vector3<f64>, x: &Vector3<f64>) -> f64 {
    let num = line.dot(x);
    let den = line.x * line.x + line.y * line.y;
    if den < 1e-18 {
        return f64::INFINITY;
    }
    num * num / den
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Rotation3, Vector3};
    use rand::Rng;

    fn k() -> Matrix3<f64> {
        Matrix3::new(450.0, 0.0, 320.0, 0.0, 450.0, 240.0, 0.0, 0.0, 1.0)
    }

    fn project(k: &Matrix3<f64>, p: &Vector3<f64>) -> Vector2<f64> {
        let x = k * (p / p.z);
        Vector2::new(x.x, x.y)
    }

    fn scene(r21: &Matrix3<f64>, t21: &Vector3<f64>, n: usize) -> (Vec<Vector2<f64>>, Vec<Vector2<f64>>) {
        let k = k();
        let mut rng = StdRng::seed_from_u64(11);
        let mut kps1 = Vec::new();
        let mut kps2 = Vec::new();
        while kps1.len() < n {
            let p = Vector3::new(
                rng.gen_range(-3.0..3.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(4.0..10.0),
            );
            let p2 = r21 * p + t21;
            kps1.push(project(&k, &p));
            kps2.push(project(&k, &p2));
        }
        (kps1, kps2)
    }

    #[test]
    fn test_recovers_translation_direction() {
        let r21 = Rotation3::from_euler_angles(0.0, 0.02, 0.0).into_inner();
        let t21 = Vector3::new(-0.4, 0.05, 0.0);
        let (kps1, kps2) = scene(&r21, &t21, 200);
        let matches: Vec<Option<usize>> = (0..kps1.len()).map(Some).collect();

        let recon = TwoViewReconstructor::new(k(), TwoViewParams::default());
        let (model, result) = recon.reconstruct(&kps1, &kps2, &matches).expect("reconstruction");

        assert_eq!(model, TwoViewModel::Fundamental);
        assert_relative_eq!(result.r21, r21, epsilon = 1e-6);
        assert_relative_eq!(result.t21, t21.normalize(), epsilon = 1e-6);
        assert!(result.triangulated.iter().filter(|&&t| t).count() > 150);
    }

    #[test]
    fn test_rejects_pure_rotation() {
        let r21 = Rotation3::from_euler_angles(0.01, 0.05, -0.02).into_inner();
        let (kps1, kps2) = scene(&r21, &Vector3::zeros(), 200);
        let matches: Vec<Option<usize>> = (0..kps1.len()).map(Some).collect();

        let recon = TwoViewReconstructor::new(k(), TwoViewParams::default());
        assert!(recon.reconstruct(&kps1, &kps2, &matches).is_none());
    }

    #[test]
    fn test_triangulate_exact() {
        let k = k();
        let mut p1 = Matrix3x4::zeros();
        p1.fixed_view_mut::<3, 3>(0, 0).copy_from(&k);
        let mut rt = Matrix3x4::zeros();
        rt.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
        rt.set_column(3, &Vector3::new(-0.5, 0.0, 0.0));
        let p2 = k * rt;

        let p = Vector3::new(0.3, -0.2, 5.0);
        let x1 = project(&k, &p);
        let x2 = project(&k, &(p + Vector3::new(-0.5, 0.0, 0.0)));
        let est = triangulate(&p1, &p2, &x1, &x2).unwrap();
        assert_relative_eq!(est, p, epsilon = 1e-8);
    }
}
