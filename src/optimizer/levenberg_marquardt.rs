//! Levenberg-Marquardt step policy.
//!
//! Each iteration solves the damped normal equations
//!
//! ```text
//! (H + λI)·Δx = -b
//! ```
//!
//! and evaluates the candidate state `x ⊞ Δx`. The gain ratio
//!
//! ```text
//! ρ = (F(x) - F(x ⊞ Δx)) / (Δxᵀ·(λΔx - b))
//! ```
//!
//! compares the actual cost reduction with the one predicted by the linear
//! model (`F = Σ eᵀΩe`). A step with `ρ > 0` is accepted and λ shrinks by
//! `max(1/3, 1 - (2ρ - 1)³)`; otherwise λ grows by `ν` and `ν` doubles
//! (Nielsen's schedule, Madsen et al. Algorithm 3.16).
//!
//! The candidate is committed to the graph only on acceptance. After
//! `max_consecutive_rejections` rejections in a row the cycle fails with
//! `Diverged`.

use faer::Mat;

/// Configuration for the Levenberg-Marquardt step policy.
///
/// ```
/// use pose_graph_slam::optimizer::LevenbergMarquardtConfig;
///
/// let config = LevenbergMarquardtConfig::new()
///     .with_damping(1e-3)
///     .with_damping_bounds(1e-10, 1e10)
///     .with_max_consecutive_rejections(20);
/// assert_eq!(config.max_consecutive_rejections, 20);
/// ```
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    /// Initial damping parameter
    pub damping: f64,
    /// Minimum damping parameter
    pub damping_min: f64,
    /// Maximum damping parameter
    pub damping_max: f64,
    /// Initial damping growth factor after a rejection
    pub damping_nu: f64,
    /// Rejected steps in a row before the cycle reports `Diverged`
    pub max_consecutive_rejections: usize,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_nu: 2.0,
            max_consecutive_rejections: 10,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn with_damping_nu(mut self, nu: f64) -> Self {
        self.damping_nu = nu;
        self
    }

    pub fn with_max_consecutive_rejections(mut self, rejections: usize) -> Self {
        self.max_consecutive_rejections = rejections;
        self
    }
}

/// Adaptive damping state for one cycle.
#[derive(Debug, Clone)]
pub(crate) struct DampingState {
    damping: f64,
    nu: f64,
    initial_nu: f64,
    min: f64,
    max: f64,
}

impl DampingState {
    pub(crate) fn new(config: &LevenbergMarquardtConfig) -> Self {
        DampingState {
            damping: config.damping.clamp(config.damping_min, config.damping_max),
            nu: config.damping_nu,
            initial_nu: config.damping_nu,
            min: config.damping_min,
            max: config.damping_max,
        }
    }

    pub(crate) fn damping(&self) -> f64 {
        self.damping
    }

    /// Update λ from the gain ratio. Returns whether the step is accepted.
    pub(crate) fn update(&mut self, rho: f64) -> bool {
        if rho > 0.0 {
            let coff = 2.0 * rho - 1.0;
            self.damping *= (1.0_f64 / 3.0).max(1.0 - coff * coff * coff);
            self.damping = self.damping.max(self.min);
            self.nu = self.initial_nu;
            true
        } else {
            self.reject();
            false
        }
    }

    /// Grow λ after a rejected or failed step.
    pub(crate) fn reject(&mut self) {
        self.damping *= self.nu;
        self.nu *= 2.0;
        self.damping = self.damping.min(self.max);
    }
}

/// Cost reduction predicted by the damped linear model.
///
/// With `(H + λI)·Δx = -b`, the model reduction `-2bᵀΔx - ΔxᵀHΔx` of
/// `F = Σ eᵀΩe` simplifies to `Δxᵀ·(λΔx - b)`.
pub(crate) fn predicted_reduction(step: &Mat<f64>, gradient: &Mat<f64>, damping: f64) -> f64 {
    (0..step.nrows())
        .map(|i| step[(i, 0)] * (damping * step[(i, 0)] - gradient[(i, 0)]))
        .sum()
}

/// Gain ratio `ρ`, guarded against a vanishing prediction.
pub(crate) fn step_quality(current_cost: f64, new_cost: f64, predicted: f64) -> f64 {
    let actual_reduction = current_cost - new_cost;
    if predicted.abs() < 1e-15 {
        if actual_reduction > 0.0 { 1.0 } else { 0.0 }
    } else {
        actual_reduction / predicted
    }
}
