//! Rigid body transforms.
//!
//! Poses in the tracker are stored world→camera (`Tcw`): applying the
//! transform to a world point yields the point in the camera frame.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// A rigid transform `p' = R p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a rotation matrix and translation.
    ///
    /// The matrix is re-orthonormalized, so slightly non-orthogonal inputs
    /// from linear solvers are accepted.
    pub fn from_rt(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot = Rotation3::from_matrix(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot),
            translation,
        }
    }

    /// Build from a homogeneous 4x4 matrix.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let r: Matrix3<f64> = m.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)]);
        Self::from_rt(&r, t)
    }

    /// Build from a quaternion given as (w, x, y, z) and a translation.
    pub fn from_quaternion(qw: f64, qx: f64, qy: f64, qz: f64, translation: Vector3<f64>) -> Self {
        let q = nalgebra::Quaternion::new(qw, qx, qy, qz);
        Self {
            rotation: UnitQuaternion::from_quaternion(q),
            translation,
        }
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation_matrix());
        m[(0, 3)] = self.translation.x;
        m[(1, 3)] = self.translation.y;
        m[(2, 3)] = self.translation.z;
        m
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Camera center in world coordinates when `self` is a `Tcw` pose.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Left-multiplied increment `exp(δ) ∘ self` with δ = [ω, υ].
    ///
    /// Rotation and translation are updated independently
    /// (`R' = exp(ω) R`, `t' = exp(ω) t + υ`), which matches the Jacobian
    /// `∂p_c/∂δ = [-[p_c]×, I]` used by the pose optimizer.
    pub fn perturb_left(&self, omega: &Vector3<f64>, upsilon: &Vector3<f64>) -> Self {
        let dr = UnitQuaternion::from_scaled_axis(*omega);
        Self {
            rotation: dr * self.rotation,
            translation: dr * self.translation + upsilon,
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for SE3 {
    type Output = SE3;

    fn mul(self, rhs: SE3) -> SE3 {
        self.compose(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_pose() -> SE3 {
        SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(1.0, -2.0, 0.5),
        )
    }

    #[test]
    fn test_inverse_composes_to_identity() {
        let t = sample_pose();
        let id = t.compose(&t.inverse());
        assert_relative_eq!(id.translation, Vector3::zeros(), epsilon = 1e-12);
        assert_relative_eq!(id.rotation.angle(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_compose_matches_matrix_product() {
        let a = sample_pose();
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(-0.3, 0.05, 0.0),
            Vector3::new(0.2, 0.0, -1.0),
        );
        let m = a.to_matrix() * b.to_matrix();
        assert_relative_eq!((a * b).to_matrix(), m, epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_round_trip_and_center() {
        let t = sample_pose();
        let back = SE3::from_matrix(&t.to_matrix());
        assert_relative_eq!(back.to_matrix(), t.to_matrix(), epsilon = 1e-12);

        let center = t.camera_center();
        assert_relative_eq!(t.transform_point(&center), Vector3::zeros(), epsilon = 1e-12);
    }

    #[test]
    fn test_perturb_left_zero_is_noop() {
        let t = sample_pose();
        let same = t.perturb_left(&Vector3::zeros(), &Vector3::zeros());
        assert_relative_eq!(same.to_matrix(), t.to_matrix(), epsilon = 1e-12);
    }
}
