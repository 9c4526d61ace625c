//! Manifold representations for optimization on non-Euclidean state spaces.
//!
//! Robot poses live on SE(2), the group of planar rigid motions. Updates are
//! applied through the exponential map (`X ⊞ δ = X ∘ Exp(δ)`) so orientation
//! never drifts off the manifold, and residuals are measured through the
//! logarithmic map so their angular component is always wrapped.
//!
//! Lie group M,° | size   | dim | X ∈ M             | T_X M       | Exp(T)     | Comp. | Action
//! ------------- | ------ | --- | ----------------- | ----------- | ---------- | ----- | ------
//! Rotation      | SO(2),.| 1   | R                 | θ ∈ R       | R = exp(θ) | R₁R₂  | Rx
//! Rigid motion  | SE(2),.| 3   | M = [R t; 0 1]    | [ρ θ] ∈ R³  | Exp([v̂])   | M₁M₂  | Rx+t
//!
//! Jacobians follow the right-perturbation convention of the
//! [manif](https://github.com/artivis/manif) library.

use std::f64::consts::{PI, TAU};

pub mod se2;

pub use se2::{SE2, SE2Tangent};

/// Core trait for Lie group operations.
///
/// Only the operations the measurement model needs are part of the trait;
/// each one optionally writes the Jacobian of its output with respect to its
/// inputs, expressed in local (right) tangent coordinates.
pub trait LieGroup: Clone + PartialEq {
    /// The tangent space vector type
    type TangentVector: Tangent<Self>;

    /// The Jacobian matrix type for this Lie group
    type JacobianMatrix: Clone + PartialEq;

    /// The neutral element.
    fn identity() -> Self;

    /// Get the inverse, with `J = -Ad(g)`.
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self;

    /// Composition `self ∘ other`.
    ///
    /// `J_self = Ad(other⁻¹)`, `J_other = I`.
    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self;

    /// Logarithmic map to the tangent space, with `J = Jr⁻¹(τ)`.
    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector;

    /// Adjoint matrix of this element.
    fn adjoint(&self) -> Self::JacobianMatrix;

    /// Approximate equality in tangent space.
    fn is_approx(&self, other: &Self, tolerance: f64) -> bool;

    /// Right plus: `g ⊞ φ = g ∘ Exp(φ)`.
    fn right_plus(&self, tangent: &Self::TangentVector) -> Self {
        self.compose(&tangent.exp(None), None, None)
    }

    /// Right minus: `g₁ ⊟ g₂ = Log(g₂⁻¹ ∘ g₁)`.
    fn right_minus(&self, other: &Self) -> Self::TangentVector {
        other.inverse(None).compose(self, None, None).log(None)
    }

    /// Relative element `self⁻¹ ∘ other`.
    fn between(&self, other: &Self) -> Self {
        self.inverse(None).compose(other, None, None)
    }
}

/// Tangent space (Lie algebra in vector form) of a Lie group.
pub trait Tangent<Group: LieGroup>: Clone + PartialEq {
    /// Dimension of the tangent space
    const DIM: usize;

    /// Exponential map to the group, with `J = Jr(τ)`.
    fn exp(&self, jacobian: Option<&mut Group::JacobianMatrix>) -> Group;

    /// Right Jacobian Jr.
    fn right_jacobian(&self) -> Group::JacobianMatrix;

    /// Inverse of the right Jacobian Jr⁻¹.
    fn right_jacobian_inv(&self) -> Group::JacobianMatrix;

    /// The zero tangent vector.
    fn zero() -> Self;
}

/// Wrap an angle into (-π, π].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI { wrapped + TAU } else { wrapped }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_angle_range() {
        for k in -50..=50 {
            let angle = k as f64 * 0.37;
            let wrapped = normalize_angle(angle);
            assert!(wrapped > -PI && wrapped <= PI, "{angle} -> {wrapped}");
            assert!(((angle - wrapped) / TAU - ((angle - wrapped) / TAU).round()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_normalize_angle_boundaries() {
        assert!((normalize_angle(PI) - PI).abs() < 1e-12);
        assert!((normalize_angle(-PI) - PI).abs() < 1e-12);
        assert!((normalize_angle(3.0 * PI) - PI).abs() < 1e-9);
        assert_eq!(normalize_angle(0.0), 0.0);
    }

    #[test]
    fn test_normalize_340_degrees_is_minus_20() {
        let wrapped = normalize_angle(340.0_f64.to_radians());
        assert!((wrapped - (-20.0_f64).to_radians()).abs() < 1e-12);
    }
}
