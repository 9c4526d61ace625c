//! Measurement models for pose-graph edges.
//!
//! Every edge kind implements [`Factor`], which provides:
//!
//! - `predict(x_i, x_j)`: the measurement expected from the two node states
//! - `residual(predicted)`: the measurement error `z ⊖ predicted`
//! - `jacobians(x_i, x_j)`: `∂e/∂x_i` and `∂e/∂x_j` in local tangent coordinates
//!
//! Pose-pose edges ([`BetweenFactor`]) measure the relative motion between two
//! poses and are used for both odometry and loop closures. Pose-landmark
//! edges ([`ObservationFactor`]) measure a landmark position in the observing
//! pose's frame. [`PriorFactor`] is a unary pose prior used to anchor the gauge
//! when the anchor is kept among the unknowns.
//!
//! The contribution of one edge to the total cost is `eᵀ·Ω·e`.

use crate::graph::{NodeKind, NodeState};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;
use tracing::error;

pub mod between_factor;
pub mod observation_factor;
pub mod prior_factor;

pub use between_factor::BetweenFactor;
pub use observation_factor::ObservationFactor;
pub use prior_factor::PriorFactor;

/// Measurement model error types
#[derive(Debug, Clone, Error)]
pub enum FactorError {
    /// A node of the wrong kind was passed to a factor
    #[error("Factor expects a {expected} as its {slot} node, got a {actual}")]
    WrongNodeKind {
        slot: &'static str,
        expected: NodeKind,
        actual: NodeKind,
    },
}

impl FactorError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }
}

/// Result type for measurement model operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Residual and Jacobians of one edge at a linearization point.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub residual: DVector<f64>,
    /// `∂e/∂x_from`, `dimension × dim(from)`
    pub jacobian_from: DMatrix<f64>,
    /// `∂e/∂x_to`, `dimension × dim(to)`
    pub jacobian_to: DMatrix<f64>,
}

/// Binary measurement model connecting two nodes.
pub trait Factor: Send + Sync {
    /// Residual dimension
    fn dimension(&self) -> usize;

    /// Measurement vector `z`
    fn measurement(&self) -> DVector<f64>;

    /// Information matrix `Ω`, `dimension × dimension`
    fn information(&self) -> &DMatrix<f64>;

    /// Expected measurement given the two node states.
    fn predict(&self, from: &NodeState, to: &NodeState) -> FactorResult<DVector<f64>>;

    /// `z ⊖ predicted`, with angular components wrapped to (-π, π].
    fn residual(&self, predicted: &DVector<f64>) -> DVector<f64>;

    /// Jacobians of [`Factor::error`] with respect to right perturbations of each node.
    fn jacobians(
        &self,
        from: &NodeState,
        to: &NodeState,
    ) -> FactorResult<(DMatrix<f64>, DMatrix<f64>)>;

    /// Residual at the given states.
    fn error(&self, from: &NodeState, to: &NodeState) -> FactorResult<DVector<f64>> {
        let predicted = self.predict(from, to)?;
        Ok(self.residual(&predicted))
    }

    fn linearize(&self, from: &NodeState, to: &NodeState) -> FactorResult<Linearization> {
        let residual = self.error(from, to)?;
        let (jacobian_from, jacobian_to) = self.jacobians(from, to)?;
        Ok(Linearization {
            residual,
            jacobian_from,
            jacobian_to,
        })
    }

    /// Weighted squared error `eᵀ·Ω·e`.
    fn chi2(&self, from: &NodeState, to: &NodeState) -> FactorResult<f64> {
        let residual = self.error(from, to)?;
        Ok(weighted_squared_norm(&residual, self.information()))
    }
}

/// `eᵀ·Ω·e`
pub fn weighted_squared_norm(residual: &DVector<f64>, information: &DMatrix<f64>) -> f64 {
    residual.dot(&(information * residual))
}

pub(crate) fn expect_pose<'a>(
    state: &'a NodeState,
    slot: &'static str,
) -> FactorResult<&'a crate::manifold::SE2> {
    state.as_pose().ok_or(FactorError::WrongNodeKind {
        slot,
        expected: NodeKind::Pose,
        actual: state.kind(),
    })
}

pub(crate) fn expect_landmark<'a>(
    state: &'a NodeState,
    slot: &'static str,
) -> FactorResult<&'a nalgebra::Vector2<f64>> {
    state.as_landmark().ok_or(FactorError::WrongNodeKind {
        slot,
        expected: NodeKind::Landmark,
        actual: state.kind(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::graph::NodeState;
    use crate::factors::Factor;
    use nalgebra::DMatrix;

    /// Central finite differences of `factor.error` with respect to right perturbations.
    pub fn numeric_jacobians(
        factor: &dyn Factor,
        from: &NodeState,
        to: &NodeState,
    ) -> (DMatrix<f64>, DMatrix<f64>) {
        const STEP: f64 = 1e-6;
        let dim = factor.dimension();

        let differentiate = |node: &NodeState, is_from: bool| {
            let mut jacobian = DMatrix::zeros(dim, node.dimension());
            for axis in 0..node.dimension() {
                let mut delta = vec![0.0; node.dimension()];
                delta[axis] = STEP;
                let plus = node.plus(&delta);
                delta[axis] = -STEP;
                let minus = node.plus(&delta);

                let (e_plus, e_minus) = if is_from {
                    (factor.error(&plus, to), factor.error(&minus, to))
                } else {
                    (factor.error(from, &plus), factor.error(from, &minus))
                };
                if let (Ok(e_plus), Ok(e_minus)) = (e_plus, e_minus) {
                    jacobian.set_column(axis, &((e_plus - e_minus) / (2.0 * STEP)));
                }
            }
            jacobian
        };

        (differentiate(from, true), differentiate(to, false))
    }
}
