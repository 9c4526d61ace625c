use crate::factors::FactorResult;
use crate::graph::{Edge, EdgeId, Node, NodeId, NodeState, edge_chi2};
use crate::manifold::SE2;
use nalgebra::Vector2;

/// Read-only copy of the graph at one version.
///
/// Snapshots are detached from the live graph, so consumers on other threads
/// can inspect them while the solver keeps mutating the original.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    version: u64,
    anchor: Option<NodeId>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub(crate) fn new(version: u64, anchor: Option<NodeId>, nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        GraphSnapshot {
            version,
            anchor,
            nodes,
            edges,
        }
    }

    /// Graph version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn anchor(&self) -> Option<NodeId> {
        self.anchor
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.index())
    }

    pub fn estimate(&self, id: NodeId) -> Option<&NodeState> {
        self.node(id).map(Node::state)
    }

    /// All pose estimates in id order.
    pub fn poses(&self) -> Vec<(NodeId, SE2)> {
        self.nodes
            .iter()
            .filter_map(|node| node.state().as_pose().map(|pose| (node.id(), pose.clone())))
            .collect()
    }

    /// All landmark estimates in id order.
    pub fn landmarks(&self) -> Vec<(NodeId, Vector2<f64>)> {
        self.nodes
            .iter()
            .filter_map(|node| node.state().as_landmark().map(|p| (node.id(), *p)))
            .collect()
    }

    pub fn active_edge_count(&self) -> usize {
        self.edges.iter().filter(|edge| edge.is_active()).count()
    }

    /// Total weighted residual over active edges at the snapshot estimates.
    pub fn cost(&self) -> FactorResult<f64> {
        self.edges
            .iter()
            .filter(|edge| edge.is_active())
            .map(|edge| edge_chi2(edge, &self.nodes))
            .sum()
    }
}
