//! Graph Store: poses, landmarks and the constraints between them.
//!
//! [`PoseGraph`] owns every node and edge in two append-only arenas, so
//! [`NodeId`] and [`EdgeId`] are stable for the lifetime of the graph. Nodes
//! are never destroyed and edges are never removed; a retracted edge is only
//! flagged inactive.
//!
//! Every insertion is validated before the graph is touched. A failed call
//! leaves the graph exactly as it was.
//!
//! # Gauge
//!
//! The first pose added becomes the anchor that fixes the global frame. A
//! graph is solvable only when every node is reachable from the anchor
//! through active edges; [`PoseGraph::check_connectivity`] verifies this and
//! the solver calls it before each cycle.
//!
//! # Dirty Set
//!
//! Structural changes are recorded in a [`ChangeSet`] that the solver consumes
//! at the start of each cycle and between iterations. That set is what lets
//! it relinearize only the edges touched since the previous cycle.

use crate::factors::{BetweenFactor, FactorResult, ObservationFactor};
use crate::manifold::SE2;
use nalgebra::{DMatrix, DVector, Matrix2, Matrix3, Vector2};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, error};

pub mod edge;
pub mod node;
pub mod snapshot;
pub mod validation;

pub use edge::{Edge, EdgeId, EdgeKind, EdgeModel};
pub use node::{Node, NodeId, NodeKind, NodeState};
pub use snapshot::GraphSnapshot;
pub use validation::{information_from_covariance, validate_information};

use validation::validate_measurement;

/// Graph store error types
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// An edge or query referenced a node that does not exist
    #[error("Invalid reference: unknown node {node}")]
    InvalidReference { node: NodeId },

    /// An operation referenced an edge that does not exist
    #[error("Invalid reference: unknown edge {edge}")]
    UnknownEdge { edge: EdgeId },

    /// Information or covariance matrix is asymmetric or not positive (semi-)definite
    #[error("Ill-conditioned matrix: {0}")]
    IllConditioned(String),

    /// Both endpoints of an edge are the same node
    #[error("Edge connects node {node} to itself")]
    SelfLoop { node: NodeId },

    /// Endpoint kinds do not match the edge kind
    #[error("A {kind} edge cannot connect a {from} to a {to}")]
    IncompatibleNodes {
        kind: EdgeKind,
        from: NodeKind,
        to: NodeKind,
    },

    /// Wrong vector or matrix size
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// NaN or infinity in ingested data
    #[error("Non-finite value in {0}")]
    NonFiniteValue(String),

    /// No node anchors the global frame
    #[error("Graph has no anchor node")]
    MissingAnchor,

    /// Only poses can anchor the global frame
    #[error("Node {node} is a landmark and cannot anchor the graph")]
    InvalidAnchor { node: NodeId },

    /// Some nodes cannot be reached from the anchor through active edges
    #[error("{} node(s) are not connected to the anchor (first: {})", nodes.len(), nodes.first().map_or(0, |n| n.0))]
    Disconnected { nodes: Vec<NodeId> },

    /// Retracting the edge would cut nodes off from the anchor
    #[error("Deactivating edge {edge} would disconnect the graph")]
    WouldDisconnect { edge: EdgeId },

    /// Estimate batch does not match the graph's nodes
    #[error("Estimate for node {node} has the wrong kind or is not finite")]
    InvalidEstimate { node: NodeId },
}

impl GraphError {
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

/// Result type for graph store operations
pub type GraphResult<T> = Result<T, GraphError>;

/// Structural changes since the solver last synchronized with the graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added_nodes: Vec<NodeId>,
    pub added_edges: Vec<EdgeId>,
    pub deactivated_edges: Vec<EdgeId>,
    pub anchor_changed: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.deactivated_edges.is_empty()
            && !self.anchor_changed
    }
}

/// Owner of all nodes and edges.
#[derive(Debug, Clone, Default)]
pub struct PoseGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// Edge ids incident to each node, in insertion order
    incidence: Vec<Vec<EdgeId>>,
    anchor: Option<NodeId>,
    changes: ChangeSet,
    version: u64,
}

pub(crate) fn edge_chi2(edge: &Edge, nodes: &[Node]) -> FactorResult<f64> {
    edge.factor()
        .chi2(nodes[edge.from().index()].state(), nodes[edge.to().index()].state())
}

impl PoseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pose seeded with `initial_estimate`.
    ///
    /// The first pose added becomes the anchor.
    pub fn add_pose_node(&mut self, initial_estimate: SE2) -> NodeId {
        let id = self.push_node(NodeState::Pose(initial_estimate));
        if self.anchor.is_none() {
            self.set_anchor_unchecked(id);
        }
        id
    }

    /// Append a landmark seeded with `initial_estimate` (world frame).
    pub fn add_landmark_node(&mut self, initial_estimate: Vector2<f64>) -> NodeId {
        self.push_node(NodeState::Landmark(initial_estimate))
    }

    fn push_node(&mut self, state: NodeState) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, state));
        self.incidence.push(Vec::new());
        self.changes.added_nodes.push(id);
        self.version += 1;
        id
    }

    /// Add a constraint from generic measurement and information arrays.
    ///
    /// # Errors
    /// - `InvalidReference` if either node is unknown
    /// - `IllConditioned` if `information` is not symmetric PSD
    /// - `SelfLoop`, `IncompatibleNodes`, `DimensionMismatch`, `NonFiniteValue` for malformed input
    pub fn add_edge(
        &mut self,
        kind: EdgeKind,
        from: NodeId,
        to: NodeId,
        measurement: &DVector<f64>,
        information: &DMatrix<f64>,
    ) -> GraphResult<EdgeId> {
        let dim = kind.measurement_dim();
        validate_measurement(measurement, dim)?;
        validate_information(information, dim)?;

        match kind {
            EdgeKind::Odometry | EdgeKind::LoopClosure => {
                let relative = SE2::from_xy_angle(measurement[0], measurement[1], measurement[2]);
                let information = Matrix3::from_column_slice(information.as_slice());
                self.add_between_edge(kind, from, to, relative, information)
            }
            EdgeKind::Observation => {
                let local = Vector2::new(measurement[0], measurement[1]);
                let information = Matrix2::from_column_slice(information.as_slice());
                self.add_observation_edge(from, to, local, information)
            }
        }
    }

    /// Add an odometry or loop-closure constraint measuring `from⁻¹ ∘ to`.
    pub fn add_between_edge(
        &mut self,
        kind: EdgeKind,
        from: NodeId,
        to: NodeId,
        measurement: SE2,
        information: Matrix3<f64>,
    ) -> GraphResult<EdgeId> {
        if kind == EdgeKind::Observation {
            return Err(GraphError::IncompatibleNodes {
                kind,
                from: NodeKind::Pose,
                to: NodeKind::Pose,
            }
            .log());
        }
        if !measurement.is_finite() {
            return Err(GraphError::NonFiniteValue("measurement".to_string()).log());
        }
        validate_information(&DMatrix::from_column_slice(3, 3, information.as_slice()), 3)?;
        self.check_endpoints(kind, from, to)?;

        let model = EdgeModel::Between(BetweenFactor::new(measurement, information));
        Ok(self.push_edge(kind, from, to, model))
    }

    /// Add an observation of landmark `landmark` from pose `pose`, measured in the pose frame.
    pub fn add_observation_edge(
        &mut self,
        pose: NodeId,
        landmark: NodeId,
        measurement: Vector2<f64>,
        information: Matrix2<f64>,
    ) -> GraphResult<EdgeId> {
        if !measurement.iter().all(|v| v.is_finite()) {
            return Err(GraphError::NonFiniteValue("measurement".to_string()).log());
        }
        validate_information(&DMatrix::from_column_slice(2, 2, information.as_slice()), 2)?;
        self.check_endpoints(EdgeKind::Observation, pose, landmark)?;

        let model = EdgeModel::Observation(ObservationFactor::new(measurement, information));
        Ok(self.push_edge(EdgeKind::Observation, pose, landmark, model))
    }

    fn check_endpoints(&self, kind: EdgeKind, from: NodeId, to: NodeId) -> GraphResult<()> {
        let from_node = self.node(from)?;
        let to_node = self.node(to)?;
        if from == to {
            return Err(GraphError::SelfLoop { node: from }.log());
        }

        let (expected_from, expected_to) = kind.endpoint_kinds();
        if from_node.kind() != expected_from || to_node.kind() != expected_to {
            return Err(GraphError::IncompatibleNodes {
                kind,
                from: from_node.kind(),
                to: to_node.kind(),
            }
            .log());
        }
        Ok(())
    }

    fn push_edge(&mut self, kind: EdgeKind, from: NodeId, to: NodeId, model: EdgeModel) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Edge::new(id, kind, from, to, model));
        self.incidence[from.index()].push(id);
        self.incidence[to.index()].push(id);
        self.changes.added_edges.push(id);
        self.version += 1;
        debug!("Added {} edge {} ({} -> {})", kind, id, from, to);
        id
    }

    /// Exclude an edge from future optimization without removing its identifier.
    ///
    /// Deactivating an already inactive edge is a no-op.
    ///
    /// # Errors
    /// - `UnknownEdge` if the edge does not exist
    /// - `WouldDisconnect` if a node currently reachable from the anchor would
    ///   lose its last path to it
    pub fn deactivate_edge(&mut self, edge: EdgeId) -> GraphResult<()> {
        let target = self
            .edges
            .get(edge.index())
            .ok_or_else(|| GraphError::UnknownEdge { edge }.log())?;
        if !target.is_active() {
            return Ok(());
        }

        if let Some(anchor) = self.anchor {
            let before = self.reachable_from(anchor, None);
            let after = self.reachable_from(anchor, Some(edge));
            let reached_before = before.iter().filter(|&&r| r).count();
            let reached_after = after.iter().filter(|&&r| r).count();
            if reached_after < reached_before {
                return Err(GraphError::WouldDisconnect { edge }.log());
            }
        }

        self.edges[edge.index()].set_active(false);
        self.changes.deactivated_edges.push(edge);
        self.version += 1;
        debug!("Deactivated edge {}", edge);
        Ok(())
    }

    /// Make `node` the single node anchoring the global frame.
    pub fn set_anchor(&mut self, node: NodeId) -> GraphResult<()> {
        if self.node(node)?.kind() != NodeKind::Pose {
            return Err(GraphError::InvalidAnchor { node }.log());
        }
        self.set_anchor_unchecked(node);
        Ok(())
    }

    fn set_anchor_unchecked(&mut self, node: NodeId) {
        if let Some(previous) = self.anchor {
            self.nodes[previous.index()].set_fixed(false);
        }
        self.nodes[node.index()].set_fixed(true);
        self.anchor = Some(node);
        self.changes.anchor_changed = true;
        self.version += 1;
    }

    /// Breadth-first reachability over active edges, optionally ignoring one edge.
    fn reachable_from(&self, start: NodeId, excluded: Option<EdgeId>) -> Vec<bool> {
        let mut reached = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        reached[start.index()] = true;

        while let Some(current) = queue.pop_front() {
            for &edge_id in &self.incidence[current.index()] {
                let edge = &self.edges[edge_id.index()];
                if !edge.is_active() || Some(edge_id) == excluded {
                    continue;
                }
                let next = edge.other(current);
                if !reached[next.index()] {
                    reached[next.index()] = true;
                    queue.push_back(next);
                }
            }
        }
        reached
    }

    /// Verify every node is reachable from the anchor through active edges.
    pub fn check_connectivity(&self) -> GraphResult<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let anchor = self.anchor.ok_or_else(|| GraphError::MissingAnchor.log())?;
        let reached = self.reachable_from(anchor, None);
        let isolated: Vec<NodeId> = reached
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(index, _)| NodeId(index))
            .collect();

        if isolated.is_empty() {
            Ok(())
        } else {
            Err(GraphError::Disconnected { nodes: isolated }.log())
        }
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes
            .get(id.index())
            .ok_or_else(|| GraphError::InvalidReference { node: id }.log())
    }

    pub fn edge(&self, id: EdgeId) -> GraphResult<&Edge> {
        self.edges
            .get(id.index())
            .ok_or_else(|| GraphError::UnknownEdge { edge: id }.log())
    }

    pub fn estimate(&self, id: NodeId) -> GraphResult<&NodeState> {
        self.node(id).map(Node::state)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Edges incident to `node`, active or not, in insertion order.
    pub fn incident_edges(&self, node: NodeId) -> &[EdgeId] {
        self.incidence
            .get(node.index())
            .map_or(&[], |edges| edges.as_slice())
    }

    pub fn active_edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(|edge| edge.is_active())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn active_edge_count(&self) -> usize {
        self.active_edges().count()
    }

    pub fn anchor(&self) -> Option<NodeId> {
        self.anchor
    }

    /// Monotonic counter bumped by every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Most recently added pose, if any.
    pub fn last_pose(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .rev()
            .find(|node| node.kind() == NodeKind::Pose)
            .map(Node::id)
    }

    /// Clone of every node estimate, indexed by `NodeId`.
    pub fn states(&self) -> Vec<NodeState> {
        self.nodes.iter().map(|node| node.state().clone()).collect()
    }

    /// Total weighted residual `Σ eᵀΩe` over active edges at the current estimates.
    pub fn total_cost(&self) -> FactorResult<f64> {
        self.active_edges()
            .map(|edge| edge_chi2(edge, &self.nodes))
            .sum()
    }

    /// Weighted residual of one edge at the current estimates.
    pub fn edge_cost(&self, id: EdgeId) -> Result<f64, crate::error::SlamError> {
        let edge = self.edge(id)?;
        Ok(edge_chi2(edge, &self.nodes)?)
    }

    /// Detached read-only copy of the current graph.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot::new(
            self.version,
            self.anchor,
            self.nodes.clone(),
            self.edges.clone(),
        )
    }

    /// Hand the accumulated dirty set to the caller and start a new one.
    pub(crate) fn take_changes(&mut self) -> ChangeSet {
        std::mem::take(&mut self.changes)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Replace every node estimate at once.
    ///
    /// The batch is validated in full before any node is written, so the
    /// graph is never left partially updated.
    pub(crate) fn commit_estimates(&mut self, states: Vec<NodeState>) -> GraphResult<()> {
        if states.len() != self.nodes.len() {
            return Err(GraphError::DimensionMismatch {
                what: "estimate batch",
                expected: self.nodes.len(),
                actual: states.len(),
            }
            .log());
        }
        for (node, state) in self.nodes.iter().zip(&states) {
            if node.kind() != state.kind() || !state.is_finite() {
                return Err(GraphError::InvalidEstimate { node: node.id() }.log());
            }
        }

        for (node, state) in self.nodes.iter_mut().zip(states) {
            node.set_state(state);
        }
        self.version += 1;
        Ok(())
    }

    /// Insert an edge with a given active flag, skipping the connectivity check.
    ///
    /// Used when replaying a stored graph whose inactive edges may precede the
    /// edges that keep the graph connected.
    pub(crate) fn insert_edge_with_flag(
        &mut self,
        kind: EdgeKind,
        from: NodeId,
        to: NodeId,
        measurement: &DVector<f64>,
        information: &DMatrix<f64>,
        active: bool,
    ) -> GraphResult<EdgeId> {
        let id = self.add_edge(kind, from, to, measurement, information)?;
        if !active {
            self.edges[id.index()].set_active(false);
            self.changes.deactivated_edges.push(id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifold::LieGroup;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn chain(length: usize) -> Result<PoseGraph, GraphError> {
        let mut graph = PoseGraph::new();
        let mut previous = graph.add_pose_node(SE2::identity());
        for i in 1..length {
            let next = graph.add_pose_node(SE2::from_xy_angle(i as f64, 0.0, 0.0));
            graph.add_between_edge(
                EdgeKind::Odometry,
                previous,
                next,
                SE2::from_xy_angle(1.0, 0.0, 0.0),
                Matrix3::identity(),
            )?;
            previous = next;
        }
        Ok(graph)
    }

    #[test]
    fn test_first_pose_is_anchor() {
        let mut graph = PoseGraph::new();
        let first = graph.add_pose_node(SE2::identity());
        let second = graph.add_pose_node(SE2::identity());

        assert_eq!(graph.anchor(), Some(first));
        assert!(graph.nodes()[first.index()].is_fixed());
        assert!(!graph.nodes()[second.index()].is_fixed());
    }

    #[test]
    fn test_unknown_node_is_invalid_reference() -> TestResult {
        let mut graph = chain(2)?;
        let version = graph.version();
        let result = graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(0),
            NodeId(9),
            SE2::identity(),
            Matrix3::identity(),
        );

        assert!(matches!(result, Err(GraphError::InvalidReference { node: NodeId(9) })));
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.version(), version);
        Ok(())
    }

    #[test]
    fn test_non_psd_information_is_ill_conditioned() -> TestResult {
        let mut graph = chain(2)?;
        let information = DMatrix::from_row_slice(
            3,
            3,
            &[1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0],
        );
        let result = graph.add_edge(
            EdgeKind::LoopClosure,
            NodeId(0),
            NodeId(1),
            &DVector::from_vec(vec![1.0, 0.0, 0.0]),
            &information,
        );

        assert!(matches!(result, Err(GraphError::IllConditioned(_))));
        assert_eq!(graph.edge_count(), 1);
        Ok(())
    }

    #[test]
    fn test_observation_requires_landmark_target() -> TestResult {
        let mut graph = chain(2)?;
        let result = graph.add_observation_edge(
            NodeId(0),
            NodeId(1),
            Vector2::new(1.0, 0.0),
            Matrix2::identity(),
        );
        assert!(matches!(result, Err(GraphError::IncompatibleNodes { .. })));

        let landmark = graph.add_landmark_node(Vector2::new(2.0, 1.0));
        graph.add_observation_edge(NodeId(1), landmark, Vector2::new(1.0, 1.0), Matrix2::identity())?;
        assert_eq!(graph.edge_count(), 2);
        Ok(())
    }

    #[test]
    fn test_self_loop_rejected() -> TestResult {
        let mut graph = chain(2)?;
        let result = graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(1),
            NodeId(1),
            SE2::identity(),
            Matrix3::identity(),
        );
        assert!(matches!(result, Err(GraphError::SelfLoop { .. })));
        Ok(())
    }

    #[test]
    fn test_connectivity_detects_isolated_nodes() -> TestResult {
        let mut graph = chain(3)?;
        assert!(graph.check_connectivity().is_ok());

        let isolated = graph.add_landmark_node(Vector2::new(5.0, 5.0));
        match graph.check_connectivity() {
            Err(GraphError::Disconnected { nodes }) => assert_eq!(nodes, vec![isolated]),
            other => panic!("expected Disconnected, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_deactivate_keeps_identifier() -> TestResult {
        let mut graph = chain(3)?;
        let closure = graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(0),
            NodeId(2),
            SE2::from_xy_angle(2.0, 0.0, 0.0),
            Matrix3::identity(),
        )?;

        graph.deactivate_edge(closure)?;
        graph.deactivate_edge(closure)?;

        assert_eq!(graph.edge_count(), 3);
        assert!(!graph.edge(closure)?.is_active());
        assert_eq!(graph.active_edge_count(), 2);
        Ok(())
    }

    #[test]
    fn test_deactivate_bridge_would_disconnect() -> TestResult {
        let mut graph = chain(3)?;
        let result = graph.deactivate_edge(EdgeId(1));
        assert!(matches!(result, Err(GraphError::WouldDisconnect { .. })));
        assert!(graph.edge(EdgeId(1))?.is_active());
        Ok(())
    }

    #[test]
    fn test_changes_are_consumed_once() -> TestResult {
        let mut graph = chain(3)?;
        let changes = graph.take_changes();
        assert_eq!(changes.added_nodes.len(), 3);
        assert_eq!(changes.added_edges.len(), 2);
        assert!(changes.anchor_changed);
        assert!(graph.take_changes().is_empty());
        Ok(())
    }

    #[test]
    fn test_commit_is_all_or_nothing() -> TestResult {
        let mut graph = chain(2)?;
        let before = graph.states();

        let mut bad = before.clone();
        bad[1] = NodeState::Landmark(Vector2::zeros());
        assert!(graph.commit_estimates(bad).is_err());
        assert_eq!(graph.states(), before);

        let mut good = before.clone();
        good[1] = NodeState::Pose(SE2::from_xy_angle(1.1, 0.0, 0.0));
        graph.commit_estimates(good.clone())?;
        assert_eq!(graph.states(), good);
        Ok(())
    }

    #[test]
    fn test_total_cost_ignores_inactive_edges() -> TestResult {
        let mut graph = chain(3)?;
        let closure = graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(0),
            NodeId(2),
            SE2::from_xy_angle(2.5, 0.0, 0.0),
            Matrix3::identity(),
        )?;
        assert!((graph.total_cost()? - 0.25).abs() < 1e-12);

        graph.deactivate_edge(closure)?;
        assert!(graph.total_cost()?.abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_snapshot_is_detached() -> TestResult {
        let mut graph = chain(2)?;
        let snapshot = graph.snapshot();
        graph.add_pose_node(SE2::identity());

        assert_eq!(snapshot.nodes().len(), 2);
        assert!(snapshot.version() < graph.version());
        Ok(())
    }
}
