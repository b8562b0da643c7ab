//! Constant-velocity motion model.

use crate::geometry::SE3;

/// Relative transform between the two most recent tracked poses.
///
/// `velocity = T_cw(current) · T_wc(last)`, so applying it to the last
/// pose predicts the next one.
#[derive(Debug, Clone, Default)]
pub struct MotionModel {
    velocity: Option<SE3>,
}

impl MotionModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the velocity from the current and previous world-to-camera poses.
    pub fn update(&mut self, current_cw: &SE3, last_cw: &SE3) {
        self.velocity = Some(*current_cw * last_cw.inverse());
    }

    /// Predict the pose following `last_cw`.
    pub fn predict(&self, last_cw: &SE3) -> Option<SE3> {
        self.velocity.map(|v| v * *last_cw)
    }

    pub fn velocity(&self) -> Option<SE3> {
        self.velocity
    }

    pub fn is_set(&self) -> bool {
        self.velocity.is_some()
    }

    pub fn clear(&mut self) {
        self.velocity = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    #[test]
    fn test_predicts_constant_velocity() {
        let step = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.02, 0.0),
            Vector3::new(0.0, 0.0, -0.1),
        );
        let p0 = SE3::identity();
        let p1 = step * p0;
        let p2 = step * p1;

        let mut model = MotionModel::new();
        assert!(model.predict(&p1).is_none());
        model.update(&p1, &p0);
        let predicted = model.predict(&p1).unwrap();
        assert_relative_eq!(predicted.to_matrix(), p2.to_matrix(), epsilon = 1e-12);

        model.clear();
        assert!(!model.is_set());
    }
}
