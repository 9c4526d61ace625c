//! Incremental Solver.
//!
//! [`IncrementalSolver`] runs optimization cycles over a [`PoseGraph`]. Each
//! cycle consumes the graph's dirty set, relinearizes only what changed and
//! iterates a step policy until convergence, a budget or cancellation ends it:
//! - Levenberg-Marquardt with Nielsen damping updates (the default)
//! - Gauss-Newton with a step-halving line search
//!
//! Both policies share one contract. A step is committed to the graph only
//! when it lowers the cost, so a failed cycle always leaves the last accepted
//! estimate in place.
//!
//! [`PoseGraph`]: crate::graph::PoseGraph

use crate::factors::FactorError;
use crate::linalg::LinAlgError;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::{
    fmt,
    fmt::{Display, Formatter},
};
use thiserror::Error;
use tracing::{debug, error};
use web_time::Duration;

pub mod gauss_newton;
pub mod incremental;
pub mod levenberg_marquardt;

pub use gauss_newton::GaussNewtonConfig;
pub use incremental::{IncrementalSolver, SolverConfig};
pub use levenberg_marquardt::LevenbergMarquardtConfig;

/// Type of optimization solver algorithm to use
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerType {
    /// Levenberg-Marquardt algorithm (robust, adaptive damping)
    #[default]
    LevenbergMarquardt,
    /// Gauss-Newton algorithm with step halving (fast near the optimum)
    GaussNewton,
}

impl Display for OptimizerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerType::LevenbergMarquardt => write!(f, "Levenberg-Marquardt"),
            OptimizerType::GaussNewton => write!(f, "Gauss-Newton"),
        }
    }
}

/// How the anchor node removes the gauge freedom.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum AnchorMode {
    /// The anchor is excluded from the unknowns
    #[default]
    Fixed,
    /// The anchor stays among the unknowns and gets an isotropic prior
    /// `weight · I` at its estimate when it became the anchor
    Prior { weight: f64 },
}

/// Optimizer-specific error types
#[derive(Debug, Clone, Error)]
pub enum OptimizerError {
    /// Normal equations cannot be solved after anchoring
    #[error("Normal equations are singular after anchoring (disconnected or under-constrained graph)")]
    SingularSystem(#[source] LinAlgError),

    /// The step-rejection budget was exhausted
    #[error(
        "Optimization diverged: {rejections} consecutive rejected steps (damping {damping:.3e}, cost {cost:.6e})"
    )]
    Diverged {
        rejections: usize,
        damping: f64,
        cost: f64,
    },

    /// Numerical instability detected (NaN, Inf in cost, gradient, or parameters)
    #[error("Numerical instability detected: {0}")]
    NumericalInstability(String),

    /// Invalid solver parameters provided
    #[error("Invalid optimization parameters: {0}")]
    InvalidParameters(String),

    /// Residual or Jacobian evaluation failed
    #[error("Measurement model error: {0}")]
    Factor(#[from] FactorError),

    /// Linear algebra operation failed
    #[error("Linear algebra error: {0}")]
    LinAlg(#[from] LinAlgError),
}

impl OptimizerError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with the original source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for optimizer operations
pub type OptimizerResult<T> = Result<T, OptimizerError>;

/// Solver state machine.
///
/// ```text
/// Idle → Linearizing → SolvingStep ─┬─ accepted, converged ─→ Converged
///            ↑              │       ├─ accepted ─→ Linearizing
///            │              ↓       └─ rejected, budget left ─→ SolvingStep
///            └──── Idle ←── Diverged / budget / cancel
/// ```
///
/// `Converged` and `Diverged` return to `Linearizing` on the next cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SolverState {
    #[default]
    Idle,
    Linearizing,
    SolvingStep,
    Converged,
    Diverged,
}

impl Display for SolverState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SolverState::Idle => write!(f, "idle"),
            SolverState::Linearizing => write!(f, "linearizing"),
            SolverState::SolvingStep => write!(f, "solving step"),
            SolverState::Converged => write!(f, "converged"),
            SolverState::Diverged => write!(f, "diverged"),
        }
    }
}

/// How an optimization cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
    /// Nothing changed since the last converged cycle
    NoChange,
    /// Cost is below the absolute tolerance, or there is nothing to optimize
    Converged,
    /// Relative cost decrease fell below tolerance
    CostToleranceReached,
    /// Relative step size fell below tolerance
    ParameterToleranceReached,
    /// Gradient infinity norm fell below tolerance
    GradientToleranceReached,
    /// Iteration budget exhausted
    MaxIterationsReached,
    /// Time budget exhausted
    Timeout,
    /// Cancelled through the [`CancelToken`]
    Cancelled,
}

impl CycleStatus {
    pub fn is_converged(self) -> bool {
        matches!(
            self,
            CycleStatus::NoChange
                | CycleStatus::Converged
                | CycleStatus::CostToleranceReached
                | CycleStatus::ParameterToleranceReached
                | CycleStatus::GradientToleranceReached
        )
    }
}

impl Display for CycleStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CycleStatus::NoChange => write!(f, "No change"),
            CycleStatus::Converged => write!(f, "Converged"),
            CycleStatus::CostToleranceReached => write!(f, "Cost tolerance reached"),
            CycleStatus::ParameterToleranceReached => write!(f, "Parameter tolerance reached"),
            CycleStatus::GradientToleranceReached => write!(f, "Gradient tolerance reached"),
            CycleStatus::MaxIterationsReached => write!(f, "Maximum iterations reached"),
            CycleStatus::Timeout => write!(f, "Timeout"),
            CycleStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Per-iteration statistics (Ceres-style output).
#[derive(Debug, Clone)]
pub struct IterationStats {
    /// Iteration number (0-indexed)
    pub iteration: usize,
    /// Cost after this iteration
    pub cost: f64,
    /// Change in cost from the previous iteration
    pub cost_change: f64,
    /// Infinity norm of the gradient `b`
    pub gradient_norm: f64,
    /// L2 norm of the attempted step
    pub step_norm: f64,
    /// Ratio of actual to predicted reduction (LM) or step scale (GN)
    pub step_quality: f64,
    /// Damping used for the step, 0 for Gauss-Newton
    pub damping: f64,
    /// Edges relinearized before this iteration
    pub relinearized: usize,
    pub iter_time_ms: f64,
    pub total_time_ms: f64,
    pub accepted: bool,
}

impl IterationStats {
    /// Print table header in Ceres-style format
    pub fn print_header() {
        debug!(
            "{:>4}  {:>13}  {:>13}  {:>13}  {:>13}  {:>11}  {:>11}  {:>7}  {:>11}  {:>13}  {:>6}",
            "iter",
            "cost",
            "cost_change",
            "|gradient|",
            "|step|",
            "quality",
            "damping",
            "relin",
            "iter_time",
            "total_time",
            "status"
        );
    }

    /// Print single iteration line in Ceres-style format
    pub fn print_line(&self) {
        let status = if self.accepted { "✓" } else { "✗" };

        debug!(
            "{:>4}  {:>13.6e}  {:>13.2e}  {:>13.2e}  {:>13.2e}  {:>11.2e}  {:>11.2e}  {:>7}  {:>9.2}ms  {:>11.2}ms  {:>6}",
            self.iteration,
            self.cost,
            self.cost_change,
            self.gradient_norm,
            self.step_norm,
            self.step_quality,
            self.damping,
            self.relinearized,
            self.iter_time_ms,
            self.total_time_ms,
            status
        );
    }
}

/// Summary of one optimization cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub optimizer_type: OptimizerType,
    pub initial_cost: f64,
    pub final_cost: f64,
    /// Iterations performed, accepted and rejected
    pub iterations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// Edge linearizations computed during the cycle
    pub relinearized_edges: usize,
    pub final_damping: f64,
    pub elapsed: Duration,
    /// Graph version after the cycle
    pub graph_version: u64,
    pub iteration_history: Vec<IterationStats>,
}

impl CycleReport {
    pub(crate) fn unchanged(optimizer_type: OptimizerType, cost: f64, graph_version: u64) -> Self {
        CycleReport {
            status: CycleStatus::NoChange,
            optimizer_type,
            initial_cost: cost,
            final_cost: cost,
            iterations: 0,
            accepted_steps: 0,
            rejected_steps: 0,
            relinearized_edges: 0,
            final_damping: 0.0,
            elapsed: Duration::ZERO,
            graph_version,
            iteration_history: Vec::new(),
        }
    }

    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} Cycle Result", self.optimizer_type)?;
        if self.status.is_converged() {
            writeln!(f, "CONVERGED ({})", self.status)?;
        } else {
            writeln!(f, "STOPPED ({})", self.status)?;
        }

        writeln!(f)?;
        writeln!(f, "Cost:")?;
        writeln!(f, "  Initial:   {:.6e}", self.initial_cost)?;
        writeln!(f, "  Final:     {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "  Reduction: {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f)?;
        writeln!(f, "Iterations:")?;
        writeln!(f, "  Total:              {}", self.iterations)?;
        writeln!(f, "  Accepted steps:     {}", self.accepted_steps)?;
        writeln!(f, "  Rejected steps:     {}", self.rejected_steps)?;
        writeln!(f, "  Relinearized edges: {}", self.relinearized_edges)?;
        writeln!(f, "  Final damping:      {:.2e}", self.final_damping)?;
        writeln!(f)?;
        writeln!(
            f,
            "Time: {:.2}ms (graph version {})",
            self.elapsed.as_secs_f64() * 1000.0,
            self.graph_version
        )
    }
}

/// Cooperative cancellation flag shared with other threads.
///
/// Setting it makes the running (or next) cycle stop at the next iteration
/// boundary with [`CycleStatus::Cancelled`]. The cycle that observes the
/// flag clears it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Read and clear the flag.
    pub(crate) fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}
