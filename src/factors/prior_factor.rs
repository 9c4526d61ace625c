//! Unary SE(2) prior.
//!
//! Pins a pose to a reference value with a strong information matrix. It is
//! used to remove the gauge freedom when the anchor node is kept among the
//! unknowns instead of being excluded from them.
//!
//! ```text
//! e = Log(X⁻¹ ∘ X_ref)
//! ∂e/∂X = -Jr⁻¹(e) · Ad(Exp(e)⁻¹)
//! ```

use crate::factors::{FactorResult, expect_pose, weighted_squared_norm};
use crate::graph::NodeState;
use crate::manifold::{LieGroup, SE2, Tangent};
use nalgebra::{DMatrix, DVector, Matrix3};

/// Default prior weight, matching the common `1000·I` anchoring prior.
pub const DEFAULT_PRIOR_WEIGHT: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct PriorFactor {
    reference: SE2,
    information: DMatrix<f64>,
}

impl PriorFactor {
    pub fn new(reference: SE2, information: Matrix3<f64>) -> Self {
        PriorFactor {
            reference,
            information: DMatrix::from_column_slice(3, 3, information.as_slice()),
        }
    }

    /// Isotropic prior `weight · I`.
    pub fn with_weight(reference: SE2, weight: f64) -> Self {
        Self::new(reference, Matrix3::identity() * weight)
    }

    pub fn reference(&self) -> &SE2 {
        &self.reference
    }

    pub fn information(&self) -> &DMatrix<f64> {
        &self.information
    }

    pub fn error(&self, state: &NodeState) -> FactorResult<DVector<f64>> {
        let pose = expect_pose(state, "prior")?;
        let error = pose.between(&self.reference).log(None);
        Ok(DVector::from_column_slice(error.coeffs().as_slice()))
    }

    /// Residual and its `3×3` Jacobian.
    pub fn linearize(&self, state: &NodeState) -> FactorResult<(DVector<f64>, DMatrix<f64>)> {
        let pose = expect_pose(state, "prior")?;
        let difference = pose.between(&self.reference);
        let error = difference.log(None);

        let jacobian = -(error.right_jacobian_inv() * difference.inverse(None).adjoint());

        Ok((
            DVector::from_column_slice(error.coeffs().as_slice()),
            DMatrix::from_column_slice(3, 3, jacobian.as_slice()),
        ))
    }

    pub fn chi2(&self, state: &NodeState) -> FactorResult<f64> {
        Ok(weighted_squared_norm(&self.error(state)?, &self.information))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn test_zero_at_reference() -> TestResult {
        let reference = SE2::from_xy_angle(1.0, 2.0, 0.5);
        let prior = PriorFactor::with_weight(reference.clone(), DEFAULT_PRIOR_WEIGHT);

        assert!(prior.chi2(&NodeState::Pose(reference))? < 1e-20);
        Ok(())
    }

    #[test]
    fn test_jacobian_matches_finite_differences() -> TestResult {
        let prior = PriorFactor::with_weight(SE2::from_xy_angle(0.2, -0.1, 0.3), 10.0);
        let state = NodeState::Pose(SE2::from_xy_angle(0.5, 0.4, -0.2));
        let (_, analytic) = prior.linearize(&state)?;

        const STEP: f64 = 1e-6;
        for axis in 0..3 {
            let mut delta = [0.0; 3];
            delta[axis] = STEP;
            let plus = prior.error(&state.plus(&delta))?;
            delta[axis] = -STEP;
            let minus = prior.error(&state.plus(&delta))?;
            let numeric = (plus - minus) / (2.0 * STEP);
            assert!((numeric - analytic.column(axis)).norm() < 1e-6);
        }
        Ok(())
    }
}
