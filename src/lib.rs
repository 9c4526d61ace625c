//! # Pose Graph SLAM
//!
//! An online 2D graph-SLAM back-end. Robot poses live on SE(2), landmarks in
//! R², and the two are tied together by odometry, loop-closure and landmark
//! observation constraints. Estimates are refined by an incremental
//! nonlinear least-squares solver that relinearizes only what changed
//! since its previous cycle.
//!
//! ## Layers
//!
//! - **Graph Store** ([`graph`]): append-only arenas of nodes and edges with
//!   validated insertion, edge deactivation, anchoring and snapshots
//! - **Measurement model** ([`factors`]): residuals and analytic Jacobians
//!   for between, observation and prior factors
//! - **Linear system** ([`linalg`]): incremental assembly of the sparse normal
//!   equations and a sparse Cholesky solver
//! - **Solver** ([`optimizer`]): Levenberg-Marquardt and Gauss-Newton cycles
//!   with iteration, time and cancellation budgets
//! - **Online layer** ([`online`]): ingestion API, loop-closure queue and
//!   snapshot publication for other threads
//! - **Interchange** ([`io`]): g2o and a lossless native format
//!
//! ## Example
//!
//! ```
//! use nalgebra::Matrix3;
//! use pose_graph_slam::graph::{EdgeKind, PoseGraph};
//! use pose_graph_slam::manifold::SE2;
//! use pose_graph_slam::optimizer::IncrementalSolver;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = PoseGraph::new();
//! let a = graph.add_pose_node(SE2::from_xy_angle(0.0, 0.0, 0.0));
//! let b = graph.add_pose_node(SE2::from_xy_angle(1.2, 0.1, 0.05));
//! graph.add_between_edge(
//!     EdgeKind::Odometry,
//!     a,
//!     b,
//!     SE2::from_xy_angle(1.0, 0.0, 0.0),
//!     Matrix3::identity(),
//! )?;
//!
//! let mut solver = IncrementalSolver::new();
//! let report = solver.run_cycle(&mut graph)?;
//! assert!(report.is_converged());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod factors;
pub mod graph;
#[cfg(feature = "io")]
pub mod io;
pub mod linalg;
#[cfg(feature = "logging")]
pub mod logger;
pub mod manifold;
pub mod online;
pub mod optimizer;

pub use error::{SlamError, SlamResult};

pub use factors::{BetweenFactor, Factor, ObservationFactor, PriorFactor};
pub use graph::{
    Edge, EdgeId, EdgeKind, GraphSnapshot, Node, NodeId, NodeKind, NodeState, PoseGraph,
};
#[cfg(feature = "io")]
pub use io::{GraphLoader, load_graph, write_graph};
pub use linalg::SparseCholeskySolver;
#[cfg(feature = "logging")]
pub use logger::{init_logger, init_logger_with_level};
pub use manifold::SE2;
pub use online::{LoopClosureProposal, OnlineConfig, OnlineSlam};
pub use optimizer::{
    AnchorMode, CycleReport, CycleStatus, IncrementalSolver, OptimizerType, SolverConfig,
    SolverState,
};
