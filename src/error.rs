//! Error types for the pose-graph-slam library
//!
//! Every module owns a `thiserror` enum describing its own failure modes. The
//! top-level [`SlamError`] wraps them so that public APIs can propagate any
//! failure with `?` while keeping the original error reachable through
//! [`std::error::Error::source`].
//!
//! Example error chain:
//! ```text
//! SlamError::Optimizer(
//!     OptimizerError::SingularSystem(
//!         LinAlgError::SingularMatrix
//!     )
//! )
//! ```

#[cfg(feature = "io")]
use crate::io::IoError;
use crate::{
    factors::FactorError, graph::GraphError, linalg::LinAlgError, online::OnlineError,
    optimizer::OptimizerError,
};
use std::error::Error as StdError;
use thiserror::Error;

/// Main result type used throughout the library
pub type SlamResult<T> = Result<T, SlamError>;

/// Main error type for the library
///
/// # Error Chain Access
///
/// ```rust,ignore
/// if let Err(e) = slam.optimize() {
///     warn!("Full chain: {}", e.chain());
/// }
/// ```
#[derive(Debug, Error)]
pub enum SlamError {
    /// Graph store errors (invalid references, ill-conditioned information, connectivity)
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Measurement model errors
    #[error(transparent)]
    Factor(#[from] FactorError),

    /// Linear algebra errors
    #[error(transparent)]
    LinearAlgebra(#[from] LinAlgError),

    /// Solver errors (singular system, divergence)
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    /// Ingestion queue errors
    #[error(transparent)]
    Online(#[from] OnlineError),

    /// File parsing and writing errors
    #[cfg(feature = "io")]
    #[error(transparent)]
    Io(#[from] IoError),
}

impl SlamError {
    /// This error followed by each of its sources, outermost first.
    fn causes(&self) -> impl Iterator<Item = String> + '_ {
        std::iter::successors(Some(self as &dyn StdError), |&err| err.source())
            .map(|err| err.to_string())
    }

    /// Full error chain, one cause per line, for logging from binaries.
    pub fn chain(&self) -> String {
        self.causes()
            .enumerate()
            .map(|(depth, cause)| if depth == 0 { cause } else { format!("  → {cause}") })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Single-line form of [`chain`](Self::chain).
    pub fn chain_compact(&self) -> String {
        self.causes().collect::<Vec<_>>().join(" → ")
    }

    /// True when the error came from an edge or node that failed validation at ingestion.
    pub fn is_rejected_input(&self) -> bool {
        matches!(
            self,
            SlamError::Graph(
                GraphError::InvalidReference { .. }
                    | GraphError::IllConditioned(_)
                    | GraphError::IncompatibleNodes { .. }
                    | GraphError::SelfLoop { .. }
                    | GraphError::DimensionMismatch { .. }
                    | GraphError::NonFiniteValue(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeId;

    #[test]
    fn test_graph_error_conversion() {
        let graph_error = GraphError::InvalidReference { node: NodeId(7) };
        let slam_error: SlamError = graph_error.into();

        assert!(matches!(slam_error, SlamError::Graph(_)));
        assert!(slam_error.to_string().contains("7"));
        assert!(slam_error.is_rejected_input());
    }

    #[test]
    fn test_error_chain_includes_source() {
        let optimizer_error = OptimizerError::SingularSystem(LinAlgError::SingularMatrix);
        let slam_error: SlamError = optimizer_error.into();

        let chain = slam_error.chain();
        assert!(chain.contains("singular"));
        assert!(chain.contains("  → "));

        let compact = slam_error.chain_compact();
        assert!(compact.contains(" → "));
        assert!(!compact.contains('\n'));
    }

    #[test]
    fn test_diverged_is_not_rejected_input() {
        let slam_error: SlamError = OptimizerError::Diverged {
            rejections: 11,
            damping: 1e6,
            cost: 3.0,
        }
        .into();
        assert!(!slam_error.is_rejected_input());
        assert!(slam_error.to_string().contains("11"));
    }
}
