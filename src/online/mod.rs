//! Online SLAM front door.
//!
//! [`OnlineSlam`] owns a [`PoseGraph`] and an [`IncrementalSolver`] and
//! exposes the ingestion and query operations a sensor front-end needs:
//!
//! - `push_odometry` appends a pose seeded by composing the previous estimate
//!   with the measured motion
//! - `push_landmark_observation` attaches a landmark position measured in
//!   the pose frame, creating the landmark on first sight
//! - `propose_loop_closure` validates a candidate and queues it
//!
//! Loop-closure candidates may come from any thread through a
//! [`LoopClosureSender`]. They are merged into the graph only at the start
//! of [`OnlineSlam::optimize`] and between solver iterations, never while a
//! linearization is in progress.
//!
//! Readers on other threads go through a [`SnapshotHandle`], which is
//! republished after every ingestion and every accepted solver step.
//!
//! # Example
//!
//! ```
//! use nalgebra::Matrix3;
//! use pose_graph_slam::manifold::SE2;
//! use pose_graph_slam::online::OnlineSlam;
//!
//! # fn main() -> Result<(), pose_graph_slam::SlamError> {
//! let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
//! let covariance = Matrix3::identity() * 0.01;
//! for _ in 0..4 {
//!     slam.push_odometry(&SE2::from_xy_angle(1.0, 0.0, std::f64::consts::FRAC_PI_2), &covariance)?;
//! }
//! let report = slam.optimize()?;
//! assert!(report.cycle.final_cost < 1e-9);
//! # Ok(())
//! # }
//! ```

pub mod loop_closure;
pub mod shared;

pub use loop_closure::{
    LoopClosureDetector, LoopClosureOutcome, LoopClosureProposal, LoopClosureSender,
};
pub use shared::SnapshotHandle;

use crate::error::SlamResult;
use crate::graph::{
    EdgeId, EdgeKind, GraphError, GraphSnapshot, NodeId, NodeKind, NodeState, PoseGraph,
    information_from_covariance,
};
use crate::manifold::{LieGroup, SE2};
use crate::optimizer::{CancelToken, CycleReport, IncrementalSolver, SolverConfig, SolverState};
use crossbeam_channel::{Receiver, bounded};
use nalgebra::{DMatrix, Matrix2, Matrix3, Vector2};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Online layer error types
#[derive(Debug, Clone, Error)]
pub enum OnlineError {
    /// The proposal queue is at capacity
    #[error("Loop-closure queue is full ({capacity} pending proposals)")]
    QueueFull { capacity: usize },

    /// The receiving side of the proposal queue is gone
    #[error("Loop-closure queue is closed")]
    QueueClosed,
}

impl OnlineError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying cause
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Configuration for [`OnlineSlam`].
#[derive(Debug, Clone)]
pub struct OnlineConfig {
    pub solver: SolverConfig,
    /// Chi² above which a merged loop closure is deactivated right away.
    /// `None` accepts every valid proposal.
    pub loop_closure_gate: Option<f64>,
    pub proposal_queue_capacity: usize,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            solver: SolverConfig::default(),
            loop_closure_gate: None,
            proposal_queue_capacity: 256,
        }
    }
}

impl OnlineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_loop_closure_gate(mut self, gate: f64) -> Self {
        self.loop_closure_gate = Some(gate);
        self
    }

    pub fn with_proposal_queue_capacity(mut self, capacity: usize) -> Self {
        self.proposal_queue_capacity = capacity;
        self
    }
}

/// Result of [`OnlineSlam::optimize`].
#[derive(Debug, Clone)]
pub struct OptimizeReport {
    pub cycle: CycleReport,
    /// Every proposal merged during the call, in merge order
    pub loop_closures: Vec<(LoopClosureProposal, LoopClosureOutcome)>,
}

/// Drain the proposal queue into the graph.
fn merge_proposals(
    graph: &mut PoseGraph,
    receiver: &Receiver<LoopClosureProposal>,
    gate: Option<f64>,
) -> Vec<(LoopClosureProposal, LoopClosureOutcome)> {
    let mut merged = Vec::new();
    while let Ok(proposal) = receiver.try_recv() {
        let outcome = merge_proposal(graph, &proposal, gate);
        info!(
            "Loop closure {} -> {} {}",
            proposal.from, proposal.to, outcome
        );
        merged.push((proposal, outcome));
    }
    merged
}

fn merge_proposal(
    graph: &mut PoseGraph,
    proposal: &LoopClosureProposal,
    gate: Option<f64>,
) -> LoopClosureOutcome {
    let edge = match graph.add_between_edge(
        EdgeKind::LoopClosure,
        proposal.from,
        proposal.to,
        proposal.measurement.clone(),
        proposal.information,
    ) {
        Ok(edge) => edge,
        Err(e) => return LoopClosureOutcome::Rejected(e.to_string()),
    };

    let Some(gate) = gate else {
        return LoopClosureOutcome::Accepted(edge);
    };
    match graph.edge_cost(edge) {
        Ok(chi2) if chi2 > gate => match graph.deactivate_edge(edge) {
            Ok(()) => LoopClosureOutcome::Gated { edge, chi2 },
            Err(e) => {
                warn!("Could not gate edge {}: {}", edge, e);
                LoopClosureOutcome::Accepted(edge)
            }
        },
        Ok(_) => LoopClosureOutcome::Accepted(edge),
        Err(e) => {
            warn!("Could not evaluate edge {}: {}", edge, e);
            LoopClosureOutcome::Accepted(edge)
        }
    }
}

/// Online graph SLAM: ingestion, incremental optimization and queries.
#[derive(Debug)]
pub struct OnlineSlam {
    config: OnlineConfig,
    graph: PoseGraph,
    solver: IncrementalSolver,
    sender: LoopClosureSender,
    receiver: Receiver<LoopClosureProposal>,
    snapshots: SnapshotHandle,
}

impl OnlineSlam {
    /// Start a map whose anchor pose is `initial_pose`.
    pub fn new(initial_pose: SE2) -> Self {
        Self::with_config(initial_pose, OnlineConfig::default())
    }

    pub fn with_config(initial_pose: SE2, config: OnlineConfig) -> Self {
        let mut graph = PoseGraph::new();
        let anchor = graph.add_pose_node(initial_pose);
        debug!("Online map anchored at node {}", anchor);

        let (sender, receiver) = bounded(config.proposal_queue_capacity.max(1));
        let snapshots = SnapshotHandle::new(graph.snapshot());
        OnlineSlam {
            solver: IncrementalSolver::with_config(config.solver.clone()),
            config,
            graph,
            sender: LoopClosureSender::new(sender),
            receiver,
            snapshots,
        }
    }

    pub fn config(&self) -> &OnlineConfig {
        &self.config
    }

    /// Append a pose measured as `delta` from the most recent pose.
    ///
    /// The new pose is seeded with `last ∘ delta`.
    ///
    /// # Errors
    /// `IllConditioned` if `covariance` is not symmetric positive definite,
    /// `NonFiniteValue` if `delta` is not finite. The graph is unchanged on error.
    pub fn push_odometry(&mut self, delta: &SE2, covariance: &Matrix3<f64>) -> SlamResult<NodeId> {
        let information = information_from_covariance(covariance)?;
        if !delta.is_finite() {
            return Err(GraphError::NonFiniteValue("odometry delta".to_string())
                .log()
                .into());
        }
        let last = self
            .graph
            .last_pose()
            .ok_or_else(|| GraphError::MissingAnchor.log())?;
        let seed = self
            .pose_estimate(last)?
            .compose(delta, None, None);

        let pose = self.graph.add_pose_node(seed);
        self.graph
            .add_between_edge(EdgeKind::Odometry, last, pose, delta.clone(), information)?;
        self.publish();
        Ok(pose)
    }

    /// Record that `pose` observed a landmark at `measurement` in its own frame.
    ///
    /// With `landmark == None` a new landmark is created at `pose ∘ measurement`.
    /// Returns the landmark id.
    pub fn push_landmark_observation(
        &mut self,
        pose: NodeId,
        landmark: Option<NodeId>,
        measurement: &Vector2<f64>,
        covariance: &Matrix2<f64>,
    ) -> SlamResult<NodeId> {
        let information = information_from_covariance(covariance)?;
        if !measurement.iter().all(|v| v.is_finite()) {
            return Err(GraphError::NonFiniteValue("landmark measurement".to_string())
                .log()
                .into());
        }

        let landmark = match landmark {
            Some(id) => id,
            None => {
                let seed = self.pose_estimate(pose)?.act(measurement, None, None);
                self.graph.add_landmark_node(seed)
            }
        };
        self.graph
            .add_observation_edge(pose, landmark, *measurement, information)?;
        self.publish();
        Ok(landmark)
    }

    /// Validate a loop-closure candidate and queue it for the next merge.
    ///
    /// # Errors
    /// `InvalidReference` for unknown nodes, `IllConditioned` for a bad
    /// covariance, `QueueFull` if the queue is at capacity.
    pub fn propose_loop_closure(
        &self,
        from: NodeId,
        to: NodeId,
        measurement: SE2,
        covariance: &Matrix3<f64>,
    ) -> SlamResult<()> {
        let information = information_from_covariance(covariance)?;
        let kinds = (self.graph.node(from)?.kind(), self.graph.node(to)?.kind());
        if kinds != (NodeKind::Pose, NodeKind::Pose) {
            return Err(GraphError::IncompatibleNodes {
                kind: EdgeKind::LoopClosure,
                from: kinds.0,
                to: kinds.1,
            }
            .log()
            .into());
        }
        if !measurement.is_finite() {
            return Err(GraphError::NonFiniteValue("loop closure".to_string())
                .log()
                .into());
        }

        self.sender.send(LoopClosureProposal {
            from,
            to,
            measurement,
            information,
        })?;
        Ok(())
    }

    /// Handle for detectors running on other threads.
    pub fn proposal_sender(&self) -> LoopClosureSender {
        self.sender.clone()
    }

    /// Run `detector` on the latest snapshot and queue what it proposes.
    ///
    /// Returns the number of proposals queued.
    pub fn run_detector<D: LoopClosureDetector + ?Sized>(
        &self,
        detector: &mut D,
    ) -> SlamResult<usize> {
        let snapshot = self.snapshots.latest();
        let proposals = detector.detect(&snapshot);
        let count = proposals.len();
        for proposal in proposals {
            self.sender.send(proposal)?;
        }
        Ok(count)
    }

    /// Merge queued loop closures and run one solver cycle.
    ///
    /// # Errors
    /// Solver errors (`SingularSystem`, `Diverged`, ...) are returned after the
    /// last accepted estimate has been published.
    pub fn optimize(&mut self) -> SlamResult<OptimizeReport> {
        let gate = self.config.loop_closure_gate;
        let mut loop_closures = merge_proposals(&mut self.graph, &self.receiver, gate);
        if !loop_closures.is_empty() {
            self.publish();
        }

        let receiver = &self.receiver;
        let snapshots = &self.snapshots;
        let result = self.solver.run_cycle_with(&mut self.graph, |graph, stats| {
            let merged = merge_proposals(graph, receiver, gate);
            if stats.accepted || !merged.is_empty() {
                snapshots.publish(graph.snapshot());
            }
            loop_closures.extend(merged);
        });
        self.publish();

        let cycle = result?;
        Ok(OptimizeReport {
            cycle,
            loop_closures,
        })
    }

    /// Deactivate a constraint, typically a loop closure found to be spurious.
    pub fn retract_edge(&mut self, edge: EdgeId) -> SlamResult<()> {
        self.graph.deactivate_edge(edge)?;
        self.publish();
        Ok(())
    }

    pub fn current_estimate(&self, node: NodeId) -> SlamResult<NodeState> {
        Ok(self.graph.estimate(node)?.clone())
    }

    /// Detached copy of the current graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot()
    }

    /// Shared handle to the published snapshots, for other threads.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        self.snapshots.clone()
    }

    /// Total weighted residual at the current estimates.
    pub fn cost(&self) -> SlamResult<f64> {
        Ok(self.graph.total_cost()?)
    }

    pub fn marginal_covariance(&mut self, node: NodeId) -> SlamResult<DMatrix<f64>> {
        self.solver.marginal_covariance(&mut self.graph, node)
    }

    pub fn solver_state(&self) -> SolverState {
        self.solver.state()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.solver.cancel_token()
    }

    /// Replace the solver configuration for subsequent cycles.
    pub fn set_solver_config(&mut self, solver: SolverConfig) -> SlamResult<()> {
        solver.validate()?;
        self.solver.set_config(solver.clone());
        self.config.solver = solver;
        Ok(())
    }

    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    pub fn latest_snapshot(&self) -> Arc<GraphSnapshot> {
        self.snapshots.latest()
    }

    fn pose_estimate(&self, node: NodeId) -> SlamResult<SE2> {
        let state = self.graph.estimate(node)?;
        state.as_pose().cloned().ok_or_else(|| {
            GraphError::IncompatibleNodes {
                kind: EdgeKind::Observation,
                from: state.kind(),
                to: NodeKind::Landmark,
            }
            .log()
            .into()
        })
    }

    fn publish(&self) {
        self.snapshots.publish(self.graph.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::CycleStatus;
    use std::f64::consts::FRAC_PI_2;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn square(slam: &mut OnlineSlam) -> Result<Vec<NodeId>, Box<dyn std::error::Error>> {
        let covariance = Matrix3::identity() * 0.01;
        let mut poses = vec![NodeId(0)];
        for _ in 0..3 {
            poses.push(slam.push_odometry(&SE2::from_xy_angle(1.0, 0.0, FRAC_PI_2), &covariance)?);
        }
        Ok(poses)
    }

    #[test]
    fn test_odometry_seeds_by_composition() -> TestResult {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let poses = square(&mut slam)?;

        let third = slam.current_estimate(poses[2])?;
        let pose = third.as_pose().ok_or("pose")?;
        assert!((pose.x() - 1.0).abs() < 1e-12);
        assert!((pose.y() - 1.0).abs() < 1e-12);
        assert!(slam.cost()? < 1e-12);
        Ok(())
    }

    #[test]
    fn test_invalid_covariance_leaves_graph_unchanged() {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let version = slam.graph().version();
        let singular = Matrix3::zeros();

        let result = slam.push_odometry(&SE2::from_xy_angle(1.0, 0.0, 0.0), &singular);
        assert!(result.is_err());
        assert_eq!(slam.graph().node_count(), 1);
        assert_eq!(slam.graph().version(), version);
    }

    #[test]
    fn test_new_landmark_seeded_in_world_frame() -> TestResult {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(1.0, 2.0, FRAC_PI_2));
        let landmark = slam.push_landmark_observation(
            NodeId(0),
            None,
            &Vector2::new(2.0, 0.0),
            &(Matrix2::identity() * 0.1),
        )?;

        let position = slam.current_estimate(landmark)?.position();
        assert!((position - Vector2::new(1.0, 4.0)).norm() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_loop_closure_merged_on_optimize() -> TestResult {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let poses = square(&mut slam)?;
        slam.propose_loop_closure(
            poses[3],
            poses[0],
            SE2::from_xy_angle(1.0, 0.0, FRAC_PI_2),
            &(Matrix3::identity() * 0.01),
        )?;

        let report = slam.optimize()?;
        assert_eq!(report.loop_closures.len(), 1);
        assert!(matches!(
            report.loop_closures[0].1,
            LoopClosureOutcome::Accepted(_)
        ));
        assert_eq!(slam.graph().active_edge_count(), 4);
        Ok(())
    }

    #[test]
    fn test_gate_deactivates_inconsistent_closure() -> TestResult {
        let config = OnlineConfig::new().with_loop_closure_gate(10.0);
        let mut slam = OnlineSlam::with_config(SE2::from_xy_angle(0.0, 0.0, 0.0), config);
        let poses = square(&mut slam)?;
        slam.propose_loop_closure(
            poses[3],
            poses[0],
            SE2::from_xy_angle(5.0, 5.0, 0.0),
            &(Matrix3::identity() * 0.01),
        )?;

        let report = slam.optimize()?;
        let (_, outcome) = &report.loop_closures[0];
        assert!(matches!(outcome, LoopClosureOutcome::Gated { .. }));
        assert_eq!(slam.graph().active_edge_count(), 3);
        assert!(slam.cost()? < 1e-12);
        Ok(())
    }

    #[test]
    fn test_proposal_to_unknown_node_is_rejected_early() {
        let slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let result = slam.propose_loop_closure(
            NodeId(0),
            NodeId(7),
            SE2::from_xy_angle(0.0, 0.0, 0.0),
            &Matrix3::identity(),
        );
        assert!(result.is_err());
        assert_eq!(slam.proposal_sender().pending(), 0);
    }

    #[test]
    fn test_full_queue_reports_queue_full() -> TestResult {
        let config = OnlineConfig::new().with_proposal_queue_capacity(1);
        let mut slam = OnlineSlam::with_config(SE2::from_xy_angle(0.0, 0.0, 0.0), config);
        let poses = square(&mut slam)?;
        let measurement = SE2::from_xy_angle(1.0, 0.0, FRAC_PI_2);
        let covariance = Matrix3::identity();

        slam.propose_loop_closure(poses[3], poses[0], measurement.clone(), &covariance)?;
        let second = slam.propose_loop_closure(poses[3], poses[0], measurement, &covariance);
        assert!(matches!(
            second,
            Err(crate::error::SlamError::Online(OnlineError::QueueFull { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_snapshot_published_after_ingestion() -> TestResult {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        let handle = slam.snapshot_handle();
        square(&mut slam)?;
        assert_eq!(handle.latest().nodes().len(), 4);
        assert_eq!(handle.version(), slam.graph().version());
        Ok(())
    }

    #[test]
    fn test_converged_map_reports_no_change() -> TestResult {
        let mut slam = OnlineSlam::new(SE2::from_xy_angle(0.0, 0.0, 0.0));
        square(&mut slam)?;
        slam.optimize()?;
        let again = slam.optimize()?;
        assert_eq!(again.cycle.status, CycleStatus::NoChange);
        assert_eq!(slam.solver_state(), SolverState::Converged);
        Ok(())
    }
}
