//! Gauss-Newton step policy.
//!
//! Solves the undamped normal equations `H·Δx = -b` and tries the step
//! `x ⊞ αΔx` for `α = 1, ½, ¼, …`. The first scale that lowers the cost is
//! accepted. If none of the `max_step_halvings + 1` trials does, the
//! iteration counts as rejected, which for Gauss-Newton exhausts the
//! rejection budget at once.
//!
//! Without damping, `H` must be positive definite at every iteration. A
//! singular system is reported as `SingularSystem`, never regularized away.

use faer::Mat;

/// Configuration for the Gauss-Newton step policy.
#[derive(Debug, Clone)]
pub struct GaussNewtonConfig {
    /// Step halvings tried before the step is rejected
    pub max_step_halvings: usize,
}

impl Default for GaussNewtonConfig {
    fn default() -> Self {
        Self {
            max_step_halvings: 8,
        }
    }
}

impl GaussNewtonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_step_halvings(mut self, halvings: usize) -> Self {
        self.max_step_halvings = halvings;
        self
    }

    /// Step scales tried in order: `1, ½, ¼, …`.
    pub(crate) fn step_scales(&self) -> impl Iterator<Item = f64> {
        (0..=self.max_step_halvings).map(|k| 0.5_f64.powi(k as i32))
    }
}

pub(crate) fn scale_step(step: &Mat<f64>, scale: f64) -> Mat<f64> {
    Mat::from_fn(step.nrows(), 1, |i, _| scale * step[(i, 0)])
}
