//! Between factor for relative pose constraints in SE(2).
//!
//! Constrains the relative motion between two poses. It models both odometry
//! (consecutive poses) and loop closures (revisited places).
//!
//! # Mathematical Formulation
//!
//! With measurement `Z`, the predicted relative pose and the residual are:
//!
//! ```text
//! P = Xᵢ⁻¹ ∘ Xⱼ
//! D = P⁻¹ ∘ Z
//! e = Log(D)
//! ```
//!
//! The angular component of `e` equals `wrap(θ_z - θ_p)`, so a measured turn
//! of 350° against an estimated turn of 10° yields -20°, not 340°.
//!
//! # Jacobians
//!
//! Chaining the inverse, compose and log Jacobians of SE(2) under right
//! perturbations gives:
//!
//! ```text
//! ∂e/∂Xᵢ =  Jr⁻¹(e) · Ad(Z⁻¹)
//! ∂e/∂Xⱼ = -Jr⁻¹(e) · Ad(D⁻¹)
//! ```

use crate::factors::{Factor, FactorResult, expect_pose};
use crate::graph::NodeState;
use crate::manifold::{LieGroup, SE2, SE2Tangent, Tangent};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Relative pose constraint between two SE(2) poses.
#[derive(Debug, Clone)]
pub struct BetweenFactor {
    measurement: SE2,
    measurement_inverse: SE2,
    information: DMatrix<f64>,
}

impl BetweenFactor {
    pub fn new(measurement: SE2, information: Matrix3<f64>) -> Self {
        let measurement_inverse = measurement.inverse(None);
        BetweenFactor {
            measurement,
            measurement_inverse,
            information: DMatrix::from_column_slice(3, 3, information.as_slice()),
        }
    }

    /// Measured relative pose `Z`.
    pub fn relative_pose(&self) -> &SE2 {
        &self.measurement
    }

    /// `e = Log(P⁻¹ ∘ Z)` together with `D = P⁻¹ ∘ Z`.
    fn tangent_error(&self, predicted: &SE2) -> (SE2Tangent, SE2) {
        let difference = predicted.inverse(None).compose(&self.measurement, None, None);
        (difference.log(None), difference)
    }

    fn to_dvector(values: Vector3<f64>) -> DVector<f64> {
        DVector::from_column_slice(values.as_slice())
    }
}

impl Factor for BetweenFactor {
    fn dimension(&self) -> usize {
        3
    }

    fn measurement(&self) -> DVector<f64> {
        Self::to_dvector(self.measurement.to_vector())
    }

    fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    fn predict(&self, from: &NodeState, to: &NodeState) -> FactorResult<DVector<f64>> {
        let pose_i = expect_pose(from, "from")?;
        let pose_j = expect_pose(to, "to")?;
        Ok(Self::to_dvector(pose_i.between(pose_j).to_vector()))
    }

    fn residual(&self, predicted: &DVector<f64>) -> DVector<f64> {
        let predicted = SE2::from_xy_angle(predicted[0], predicted[1], predicted[2]);
        let (error, _) = self.tangent_error(&predicted);
        Self::to_dvector(error.coeffs())
    }

    fn error(&self, from: &NodeState, to: &NodeState) -> FactorResult<DVector<f64>> {
        let pose_i = expect_pose(from, "from")?;
        let pose_j = expect_pose(to, "to")?;
        let (error, _) = self.tangent_error(&pose_i.between(pose_j));
        Ok(Self::to_dvector(error.coeffs()))
    }

    fn jacobians(
        &self,
        from: &NodeState,
        to: &NodeState,
    ) -> FactorResult<(DMatrix<f64>, DMatrix<f64>)> {
        let pose_i = expect_pose(from, "from")?;
        let pose_j = expect_pose(to, "to")?;

        let (error, difference) = self.tangent_error(&pose_i.between(pose_j));
        let jr_inv = error.right_jacobian_inv();

        let jacobian_i = jr_inv * self.measurement_inverse.adjoint();
        let jacobian_j = -(jr_inv * difference.inverse(None).adjoint());

        Ok((
            DMatrix::from_column_slice(3, 3, jacobian_i.as_slice()),
            DMatrix::from_column_slice(3, 3, jacobian_j.as_slice()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::test_support::numeric_jacobians;
    use nalgebra::Vector2;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_zero_residual_at_consistent_poses() -> TestResult {
        let pose_i = SE2::from_xy_angle(1.0, 2.0, 0.4);
        let pose_j = SE2::from_xy_angle(-0.5, 3.0, 2.9);
        let factor = BetweenFactor::new(pose_i.between(&pose_j), Matrix3::identity());

        let residual = factor.error(&NodeState::Pose(pose_i), &NodeState::Pose(pose_j))?;
        assert!(residual.norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_wrapped_turn_residual() -> TestResult {
        let factor = BetweenFactor::new(
            SE2::from_xy_angle(0.0, 0.0, 350.0_f64.to_radians()),
            Matrix3::identity(),
        );
        let from = NodeState::Pose(SE2::identity());
        let to = NodeState::Pose(SE2::from_xy_angle(0.0, 0.0, 10.0_f64.to_radians()));

        let predicted = factor.predict(&from, &to)?;
        let residual = factor.residual(&predicted);
        assert!((residual[2] - (-20.0_f64).to_radians()).abs() < 1e-12);
        assert!(residual.rows(0, 2).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_jacobians_match_finite_differences() -> TestResult {
        let factor = BetweenFactor::new(
            SE2::from_xy_angle(1.1, -0.3, 0.25),
            Matrix3::new(4.0, 0.1, 0.0, 0.1, 3.0, 0.0, 0.0, 0.0, 9.0),
        );
        let from = NodeState::Pose(SE2::from_xy_angle(0.3, 0.2, -0.6));
        let to = NodeState::Pose(SE2::from_xy_angle(1.5, -0.4, 0.1));

        let (analytic_i, analytic_j) = factor.jacobians(&from, &to)?;
        let (numeric_i, numeric_j) = numeric_jacobians(&factor, &from, &to);

        assert!((analytic_i - numeric_i).norm() < 1e-6);
        assert!((analytic_j - numeric_j).norm() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_chi2_weights_residual() -> TestResult {
        let factor =
            BetweenFactor::new(SE2::from_xy_angle(1.0, 0.0, 0.0), Matrix3::identity() * 2.0);
        let from = NodeState::Pose(SE2::identity());
        let to = NodeState::Pose(SE2::from_xy_angle(1.5, 0.0, 0.0));

        assert!((factor.chi2(&from, &to)? - 2.0 * 0.25).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_rejects_landmark_endpoint() {
        let factor = BetweenFactor::new(SE2::identity(), Matrix3::identity());
        let from = NodeState::Pose(SE2::identity());
        let to = NodeState::Landmark(Vector2::new(1.0, 1.0));
        assert!(factor.error(&from, &to).is_err());
    }
}
