use crate::manifold::{LieGroup, SE2, SE2Tangent};
use nalgebra::{DVector, Vector2, Vector3};
use std::{
    fmt,
    fmt::{Display, Formatter},
};

/// Stable node identifier, equal to the node's position in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Pose,
    Landmark,
}

impl NodeKind {
    /// Tangent-space dimension of a node of this kind.
    pub fn dimension(self) -> usize {
        match self {
            NodeKind::Pose => SE2::DOF,
            NodeKind::Landmark => 2,
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Pose => write!(f, "pose"),
            NodeKind::Landmark => write!(f, "landmark"),
        }
    }
}

/// Current estimate of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Robot pose in the world frame
    Pose(SE2),
    /// Landmark position in the world frame
    Landmark(Vector2<f64>),
}

impl NodeState {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeState::Pose(_) => NodeKind::Pose,
            NodeState::Landmark(_) => NodeKind::Landmark,
        }
    }

    pub fn dimension(&self) -> usize {
        self.kind().dimension()
    }

    pub fn as_pose(&self) -> Option<&SE2> {
        match self {
            NodeState::Pose(pose) => Some(pose),
            NodeState::Landmark(_) => None,
        }
    }

    pub fn as_landmark(&self) -> Option<&Vector2<f64>> {
        match self {
            NodeState::Pose(_) => None,
            NodeState::Landmark(position) => Some(position),
        }
    }

    /// World-frame position of the node.
    pub fn position(&self) -> Vector2<f64> {
        match self {
            NodeState::Pose(pose) => pose.translation(),
            NodeState::Landmark(position) => *position,
        }
    }

    /// Apply a tangent-space update.
    ///
    /// Poses are updated through the exponential map, landmarks additively.
    /// `delta` must hold exactly [`NodeState::dimension`] values.
    pub fn plus(&self, delta: &[f64]) -> NodeState {
        match self {
            NodeState::Pose(pose) => {
                let tangent = SE2Tangent::from(Vector3::new(delta[0], delta[1], delta[2]));
                NodeState::Pose(pose.right_plus(&tangent))
            }
            NodeState::Landmark(position) => {
                NodeState::Landmark(position + Vector2::new(delta[0], delta[1]))
            }
        }
    }

    /// `[x, y, θ]` for poses, `[x, y]` for landmarks.
    pub fn to_vector(&self) -> DVector<f64> {
        match self {
            NodeState::Pose(pose) => DVector::from_column_slice(pose.to_vector().as_slice()),
            NodeState::Landmark(position) => DVector::from_column_slice(position.as_slice()),
        }
    }

    pub fn is_finite(&self) -> bool {
        match self {
            NodeState::Pose(pose) => pose.is_finite(),
            NodeState::Landmark(position) => position.iter().all(|v| v.is_finite()),
        }
    }
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Pose(pose) => write!(f, "{pose}"),
            NodeState::Landmark(p) => write!(f, "Landmark([{:.4}, {:.4}])", p.x, p.y),
        }
    }
}

/// A graph node: identifier, current estimate and gauge flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: NodeId,
    state: NodeState,
    fixed: bool,
}

impl Node {
    pub(crate) fn new(id: NodeId, state: NodeState) -> Self {
        Node {
            id,
            state,
            fixed: false,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.state.kind()
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    /// True for the node anchoring the global frame.
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    pub(crate) fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_plus_uses_exponential_map() {
        let state = NodeState::Pose(SE2::from_xy_angle(1.0, 0.0, std::f64::consts::FRAC_PI_2));
        let updated = state.plus(&[1.0, 0.0, 0.0]);

        // A forward step in the body frame moves along world +y when facing +y.
        let pose = updated.as_pose().cloned().unwrap_or_else(SE2::identity);
        assert!((pose.x() - 1.0).abs() < 1e-12);
        assert!((pose.y() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_landmark_plus_is_additive() {
        let state = NodeState::Landmark(Vector2::new(1.0, 2.0));
        let updated = state.plus(&[0.5, -0.5]);
        assert_eq!(updated, NodeState::Landmark(Vector2::new(1.5, 1.5)));
        assert_eq!(updated.dimension(), 2);
    }

    #[test]
    fn test_state_vector_layout() {
        let pose = NodeState::Pose(SE2::from_xy_angle(1.0, 2.0, 0.5));
        assert_eq!(pose.to_vector().len(), 3);
        assert!((pose.to_vector()[2] - 0.5).abs() < 1e-15);
        assert_eq!(pose.kind(), NodeKind::Pose);
    }
}
