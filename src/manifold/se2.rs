//! SE(2) - Special Euclidean Group in 2D
//!
//! Elements are stored as a `Vector2` translation and a `UnitComplex`
//! rotation. Tangent elements are `[x, y, θ]`: translational part first,
//! rotational part last, matching the g2o `[x y theta]` convention.
//!
//! The closed forms below use the coefficients
//!
//! ```text
//! a = sin θ / θ          b = (1 - cos θ) / θ
//! p = (θ - sin θ) / θ²   q = (1 - cos θ) / θ²
//! ```
//!
//! evaluated through half-angle identities, with series expansions near θ = 0,
//! so that Jacobians stay accurate for the tiny residual angles seen close to
//! convergence.

use crate::manifold::{LieGroup, Tangent, normalize_angle};
use nalgebra::{Matrix2, Matrix2x3, Matrix3, Point2, UnitComplex, Vector2, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Below this θ² the series expansions are used.
const SMALL_ANGLE_SQ: f64 = 1e-6;

/// `(a, b)` coefficients of the SE(2) exponential.
fn exp_coefficients(theta: f64) -> (f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < SMALL_ANGLE_SQ {
        let a = 1.0 - theta_sq / 6.0 + theta_sq * theta_sq / 120.0;
        let b = theta * (0.5 - theta_sq / 24.0 + theta_sq * theta_sq / 720.0);
        (a, b)
    } else {
        let half_sin = (0.5 * theta).sin();
        (theta.sin() / theta, 2.0 * half_sin * half_sin / theta)
    }
}

/// `(p, q)` coefficients of the SE(2) right Jacobian.
fn jacobian_coefficients(theta: f64) -> (f64, f64) {
    let theta_sq = theta * theta;
    if theta_sq < SMALL_ANGLE_SQ {
        let p = theta * (1.0 / 6.0 - theta_sq / 120.0);
        let q = 0.5 - theta_sq / 24.0 + theta_sq * theta_sq / 720.0;
        (p, q)
    } else {
        let half_sin = (0.5 * theta).sin();
        (
            (theta - theta.sin()) / theta_sq,
            2.0 * half_sin * half_sin / theta_sq,
        )
    }
}

/// SE(2) group element representing a planar rigid motion.
#[derive(Debug, Clone, PartialEq)]
pub struct SE2 {
    translation: Vector2<f64>,
    rotation: UnitComplex<f64>,
}

impl Display for SE2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SE2(translation: [{:.4}, {:.4}], rotation: {:.4})",
            self.x(),
            self.y(),
            self.angle()
        )
    }
}

impl From<Vector3<f64>> for SE2 {
    fn from(data: Vector3<f64>) -> Self {
        SE2::from_xy_angle(data.x, data.y, data.z)
    }
}

impl From<&SE2> for Vector3<f64> {
    fn from(pose: &SE2) -> Self {
        Vector3::new(pose.x(), pose.y(), pose.angle())
    }
}

impl SE2 {
    /// Degrees of freedom - dimension of the tangent space
    pub const DOF: usize = 3;

    pub fn new(translation: Vector2<f64>, rotation: UnitComplex<f64>) -> Self {
        SE2 {
            translation,
            rotation,
        }
    }

    /// Create from `x`, `y` and a heading angle in radians.
    pub fn from_xy_angle(x: f64, y: f64, theta: f64) -> Self {
        SE2::new(Vector2::new(x, y), UnitComplex::new(theta))
    }

    pub fn translation(&self) -> Vector2<f64> {
        self.translation
    }

    pub fn rotation(&self) -> UnitComplex<f64> {
        self.rotation
    }

    pub fn rotation_matrix(&self) -> Matrix2<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    pub fn x(&self) -> f64 {
        self.translation.x
    }

    pub fn y(&self) -> f64 {
        self.translation.y
    }

    /// Heading in (-π, π].
    pub fn angle(&self) -> f64 {
        normalize_angle(self.rotation.angle())
    }

    /// `[x, y, θ]`.
    pub fn to_vector(&self) -> Vector3<f64> {
        self.into()
    }

    /// True when every component is finite.
    pub fn is_finite(&self) -> bool {
        self.translation.iter().all(|v| v.is_finite())
            && self.rotation.re.is_finite()
            && self.rotation.im.is_finite()
    }

    /// Transform a point from this frame into the parent frame: `R·p + t`.
    ///
    /// `J_self = [R | R·(-p_y, p_x)]`, `J_point = R`.
    pub fn act(
        &self,
        point: &Vector2<f64>,
        jacobian_self: Option<&mut Matrix2x3<f64>>,
        jacobian_point: Option<&mut Matrix2<f64>>,
    ) -> Vector2<f64> {
        let rotation = self.rotation_matrix();
        let result = self.rotation.transform_point(&Point2::from(*point)).coords + self.translation;

        if let Some(jac) = jacobian_self {
            jac.fixed_view_mut::<2, 2>(0, 0).copy_from(&rotation);
            let lever = rotation * Vector2::new(-point.y, point.x);
            jac[(0, 2)] = lever.x;
            jac[(1, 2)] = lever.y;
        }

        if let Some(jac) = jacobian_point {
            *jac = rotation;
        }

        result
    }

    /// Express a parent-frame point in this frame: `Rᵀ·(p - t)`.
    pub fn inverse_act(&self, point: &Vector2<f64>) -> Vector2<f64> {
        self.rotation.inverse_transform_vector(&(point - self.translation))
    }
}

impl LieGroup for SE2 {
    type TangentVector = SE2Tangent;
    type JacobianMatrix = Matrix3<f64>;

    fn identity() -> Self {
        SE2::new(Vector2::zeros(), UnitComplex::identity())
    }

    /// For SE(2): g⁻¹ = [Rᵀ, -Rᵀ·t; 0, 1]
    fn inverse(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self {
        let rotation_inv = self.rotation.inverse();
        let translation_inv = -(rotation_inv * self.translation);

        if let Some(jac) = jacobian {
            *jac = -self.adjoint();
        }

        SE2::new(translation_inv, rotation_inv)
    }

    fn compose(
        &self,
        other: &Self,
        jacobian_self: Option<&mut Self::JacobianMatrix>,
        jacobian_other: Option<&mut Self::JacobianMatrix>,
    ) -> Self {
        let rotation = self.rotation * other.rotation;
        let translation = self
            .rotation
            .transform_point(&Point2::from(other.translation))
            .coords
            + self.translation;

        if let Some(jac) = jacobian_self {
            *jac = other.inverse(None).adjoint();
        }

        if let Some(jac) = jacobian_other {
            *jac = Matrix3::identity();
        }

        SE2::new(translation, rotation)
    }

    fn log(&self, jacobian: Option<&mut Self::JacobianMatrix>) -> Self::TangentVector {
        let theta = self.angle();
        let (a, b) = exp_coefficients(theta);
        let scale = 1.0 / (a * a + b * b);

        let x = scale * (a * self.x() + b * self.y());
        let y = scale * (-b * self.x() + a * self.y());
        let tangent = SE2Tangent::new(x, y, theta);

        if let Some(jac) = jacobian {
            *jac = tangent.right_jacobian_inv();
        }

        tangent
    }

    /// `Ad = [R, (y, -x)ᵀ; 0, 1]`
    fn adjoint(&self) -> Self::JacobianMatrix {
        let mut adjoint = Matrix3::identity();
        adjoint
            .fixed_view_mut::<2, 2>(0, 0)
            .copy_from(&self.rotation_matrix());
        adjoint[(0, 2)] = self.y();
        adjoint[(1, 2)] = -self.x();
        adjoint
    }

    fn is_approx(&self, other: &Self, tolerance: f64) -> bool {
        self.right_minus(other).coeffs().norm() < tolerance
    }
}

/// SE(2) tangent vector `[x, y, θ]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SE2Tangent {
    data: Vector3<f64>,
}

impl Display for SE2Tangent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "se2(x: {:.4}, y: {:.4}, theta: {:.4})",
            self.data.x, self.data.y, self.data.z
        )
    }
}

impl From<Vector3<f64>> for SE2Tangent {
    fn from(data: Vector3<f64>) -> Self {
        SE2Tangent { data }
    }
}

impl SE2Tangent {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        SE2Tangent {
            data: Vector3::new(x, y, theta),
        }
    }

    pub fn x(&self) -> f64 {
        self.data.x
    }

    pub fn y(&self) -> f64 {
        self.data.y
    }

    pub fn angle(&self) -> f64 {
        self.data.z
    }

    pub fn coeffs(&self) -> Vector3<f64> {
        self.data
    }

    /// Upper-left 2x2 block `A` and last column `w` shared by Jr and Jr⁻¹.
    fn right_jacobian_blocks(&self) -> (Matrix2<f64>, Vector2<f64>) {
        let theta = self.angle();
        let (a, b) = exp_coefficients(theta);
        let (p, q) = jacobian_coefficients(theta);
        let (x, y) = (self.x(), self.y());

        let block = Matrix2::new(a, b, -b, a);
        let column = Vector2::new(p * x - q * y, q * x + p * y);
        (block, column)
    }
}

impl Tangent<SE2> for SE2Tangent {
    const DIM: usize = 3;

    fn exp(&self, jacobian: Option<&mut Matrix3<f64>>) -> SE2 {
        let theta = self.angle();
        let (a, b) = exp_coefficients(theta);

        let translation = Vector2::new(a * self.x() - b * self.y(), b * self.x() + a * self.y());

        if let Some(jac) = jacobian {
            *jac = self.right_jacobian();
        }

        SE2::new(translation, UnitComplex::new(theta))
    }

    fn right_jacobian(&self) -> Matrix3<f64> {
        let (block, column) = self.right_jacobian_blocks();

        let mut jac = Matrix3::identity();
        jac.fixed_view_mut::<2, 2>(0, 0).copy_from(&block);
        jac.fixed_view_mut::<2, 1>(0, 2).copy_from(&column);
        jac
    }

    /// Block inverse of `[A w; 0 1]`, which is `[A⁻¹ -A⁻¹w; 0 1]`.
    fn right_jacobian_inv(&self) -> Matrix3<f64> {
        let (block, column) = self.right_jacobian_blocks();

        // A is a scaled rotation, so its inverse is its transpose over the squared scale.
        let scale_sq = block[(0, 0)] * block[(0, 0)] + block[(0, 1)] * block[(0, 1)];
        let block_inv = block.transpose() / scale_sq;

        let mut jac_inv = Matrix3::identity();
        jac_inv.fixed_view_mut::<2, 2>(0, 0).copy_from(&block_inv);
        jac_inv
            .fixed_view_mut::<2, 1>(0, 2)
            .copy_from(&(-(block_inv * column)));
        jac_inv
    }

    fn zero() -> Self {
        SE2Tangent::new(0.0, 0.0, 0.0)
    }
}
