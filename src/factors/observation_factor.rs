//! Pose-landmark observation factor.
//!
//! Measures the position of a point landmark in the observing pose's frame:
//!
//! ```text
//! h = Rᵢᵀ · (l - tᵢ)
//! e = z - h
//! ```
//!
//! Under a right perturbation of the pose and an additive perturbation of the landmark:
//!
//! ```text
//! ∂e/∂Xᵢ = [ I₂ | (-h_y, h_x)ᵀ ]
//! ∂e/∂l  = -Rᵢᵀ
//! ```

use crate::factors::{Factor, FactorResult, expect_landmark, expect_pose};
use crate::graph::NodeState;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

#[derive(Debug, Clone)]
pub struct ObservationFactor {
    measurement: Vector2<f64>,
    information: DMatrix<f64>,
}

impl ObservationFactor {
    pub fn new(measurement: Vector2<f64>, information: Matrix2<f64>) -> Self {
        ObservationFactor {
            measurement,
            information: DMatrix::from_column_slice(2, 2, information.as_slice()),
        }
    }

    /// Measured landmark position in the pose frame.
    pub fn local_position(&self) -> &Vector2<f64> {
        &self.measurement
    }
}

impl Factor for ObservationFactor {
    fn dimension(&self) -> usize {
        2
    }

    fn measurement(&self) -> DVector<f64> {
        DVector::from_column_slice(self.measurement.as_slice())
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn predict(&self, from: &NodeState, to: &NodeState) -> FactorResult<DVector<f64>> {
        let pose = expect_pose(from, "from")?;
        let landmark = expect_landmark(to, "to")?;
        Ok(DVector::from_column_slice(
            pose.inverse_act(landmark).as_slice(),
        ))
    }

    fn residual(&self, predicted: &DVector<f64>) -> DVector<f64> {
        DVector::from_column_slice(&[
            self.measurement.x - predicted[0],
            self.measurement.y - predicted[1],
        ])
    }

    fn jacobians(
        &self,
        from: &NodeState,
        to: &NodeState,
    ) -> FactorResult<(DMatrix<f64>, DMatrix<f64>)> {
        let pose = expect_pose(from, "from")?;
        let landmark = expect_landmark(to, "to")?;
        let local = pose.inverse_act(landmark);

        #[rustfmt::skip]
        let jacobian_pose = DMatrix::from_row_slice(2, 3, &[
            1.0, 0.0, -local.y,
            0.0, 1.0,  local.x,
        ]);
        let rotation_t = pose.rotation_matrix().transpose();
        let jacobian_landmark = DMatrix::from_column_slice(2, 2, (-rotation_t).as_slice());

        Ok((jacobian_pose, jacobian_landmark))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::test_support::numeric_jacobians;
    use crate::manifold::SE2;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_zero_residual_at_true_landmark() -> TestResult {
        let pose = SE2::from_xy_angle(2.0, -1.0, 0.8);
        let landmark = Vector2::new(4.0, 3.5);
        let factor = ObservationFactor::new(pose.inverse_act(&landmark), Matrix2::identity());

        let residual = factor.error(&NodeState::Pose(pose), &NodeState::Landmark(landmark))?;
        assert!(residual.norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_prediction_in_pose_frame() -> TestResult {
        let pose = SE2::from_xy_angle(1.0, 1.0, std::f64::consts::FRAC_PI_2);
        let factor = ObservationFactor::new(Vector2::zeros(), Matrix2::identity());

        let predicted = factor.predict(
            &NodeState::Pose(pose),
            &NodeState::Landmark(Vector2::new(1.0, 3.0)),
        )?;
        // Two metres ahead when facing +y.
        assert!((predicted[0] - 2.0).abs() < 1e-12);
        assert!(predicted[1].abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_jacobians_match_finite_differences() -> TestResult {
        let factor = ObservationFactor::new(
            Vector2::new(1.0, 0.5),
            Matrix2::new(2.0, 0.3, 0.3, 1.0),
        );
        let from = NodeState::Pose(SE2::from_xy_angle(0.5, -0.2, 1.3));
        let to = NodeState::Landmark(Vector2::new(2.5, 1.7));

        let (analytic_pose, analytic_landmark) = factor.jacobians(&from, &to)?;
        let (numeric_pose, numeric_landmark) = numeric_jacobians(&factor, &from, &to);

        assert!((analytic_pose - numeric_pose).norm() < 1e-6);
        assert!((analytic_landmark - numeric_landmark).norm() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_rejects_swapped_endpoints() {
        let factor = ObservationFactor::new(Vector2::zeros(), Matrix2::identity());
        let result = factor.predict(
            &NodeState::Landmark(Vector2::zeros()),
            &NodeState::Pose(SE2::from_xy_angle(0.0, 0.0, 0.0)),
        );
        assert!(result.is_err());
    }
}
