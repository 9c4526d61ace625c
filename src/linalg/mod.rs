//! Linear System Builder and sparse solver.
//!
//! [`LinearSystemBuilder`] keeps the block-sparse normal equations
//! `H·Δx = -b` of the active edge set up to date, and
//! [`SparseCholeskySolver`] factorizes them with faer's supernodal LLT.

pub mod cholesky;
pub mod normal_equations;

use thiserror::Error;
use tracing::error;

pub use cholesky::SparseCholeskySolver;
pub use normal_equations::{Evaluation, LinearSystemBuilder, NormalEquations, VariableOrdering};

/// Failures of assembly, factorization or solve.
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Symbolic analysis or numeric factorization could not be carried out
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// The normal matrix is not positive definite at the current damping
    #[error("Normal matrix is singular or not positive definite")]
    SingularMatrix,

    /// Some variable is not determined by any active constraint
    #[error("Under-constrained system: {0}")]
    UnderConstrained(String),

    #[error("Sparse matrix assembly failed: {0}")]
    SparseMatrixCreation(String),

    #[error("Solve called without a valid factorization")]
    NotFactorized,
}

impl LinAlgError {
    /// Emit through `tracing::error!` and hand the error back.
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Like [`log`](Self::log), also printing the faer error that caused it.
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

pub type LinAlgResult<T> = Result<T, LinAlgError>;
