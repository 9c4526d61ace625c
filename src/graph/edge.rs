use crate::factors::{BetweenFactor, Factor, ObservationFactor};
use crate::graph::{NodeId, NodeKind};
use nalgebra::{DMatrix, DVector};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Stable edge identifier, equal to the edge's position in the graph arena.
///
/// Edges are never removed, so an `EdgeId` stays valid for the lifetime of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for EdgeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Relative motion between consecutive poses
    Odometry,
    /// Relative motion between a pose and a revisited earlier pose
    LoopClosure,
    /// Landmark position measured from a pose
    Observation,
}

impl EdgeKind {
    /// Residual dimension of this edge kind.
    pub fn measurement_dim(self) -> usize {
        match self {
            EdgeKind::Odometry | EdgeKind::LoopClosure => 3,
            EdgeKind::Observation => 2,
        }
    }

    /// Required `(from, to)` node kinds.
    pub fn endpoint_kinds(self) -> (NodeKind, NodeKind) {
        match self {
            EdgeKind::Odometry | EdgeKind::LoopClosure => (NodeKind::Pose, NodeKind::Pose),
            EdgeKind::Observation => (NodeKind::Pose, NodeKind::Landmark),
        }
    }

    /// Tag used by the native graph file format.
    pub fn tag(self) -> &'static str {
        match self {
            EdgeKind::Odometry => "ODOMETRY",
            EdgeKind::LoopClosure => "LOOP_CLOSURE",
            EdgeKind::Observation => "OBSERVATION",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "ODOMETRY" => Some(EdgeKind::Odometry),
            "LOOP_CLOSURE" => Some(EdgeKind::LoopClosure),
            "OBSERVATION" => Some(EdgeKind::Observation),
            _ => None,
        }
    }
}

impl Display for EdgeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EdgeKind::Odometry => write!(f, "odometry"),
            EdgeKind::LoopClosure => write!(f, "loop closure"),
            EdgeKind::Observation => write!(f, "observation"),
        }
    }
}

/// Measurement model attached to an edge.
#[derive(Debug, Clone)]
pub enum EdgeModel {
    Between(BetweenFactor),
    Observation(ObservationFactor),
}

impl EdgeModel {
    pub fn factor(&self) -> &dyn Factor {
        match self {
            EdgeModel::Between(factor) => factor,
            EdgeModel::Observation(factor) => factor,
        }
    }
}

/// A constraint between two nodes.
///
/// Immutable once created except for its active flag.
#[derive(Debug, Clone)]
pub struct Edge {
    id: EdgeId,
    kind: EdgeKind,
    from: NodeId,
    to: NodeId,
    model: EdgeModel,
    active: bool,
}

impl Edge {
    pub(crate) fn new(id: EdgeId, kind: EdgeKind, from: NodeId, to: NodeId, model: EdgeModel) -> Self {
        Edge {
            id,
            kind,
            from,
            to,
            model,
            active: true,
        }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn kind(&self) -> EdgeKind {
        self.kind
    }

    pub fn from(&self) -> NodeId {
        self.from
    }

    pub fn to(&self) -> NodeId {
        self.to
    }

    /// Both endpoints, `from` first.
    pub fn endpoints(&self) -> (NodeId, NodeId) {
        (self.from, self.to)
    }

    pub fn model(&self) -> &EdgeModel {
        &self.model
    }

    pub fn factor(&self) -> &dyn Factor {
        self.model.factor()
    }

    pub fn measurement(&self) -> DVector<f64> {
        self.factor().measurement()
    }

    pub fn information(&self) -> &DMatrix<f64> {
        self.factor().information()
    }

    /// False once the edge has been retracted.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn connects(&self, node: NodeId) -> bool {
        self.from == node || self.to == node
    }

    /// The endpoint opposite to `node`.
    pub fn other(&self, node: NodeId) -> NodeId {
        if self.from == node { self.to } else { self.from }
    }

    pub(crate) fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}
