//! Loop-closure proposals from external place-recognition collaborators.
//!
//! Detectors never touch the graph. They push [`LoopClosureProposal`]s into a
//! bounded queue, and [`OnlineSlam`](crate::online::OnlineSlam) merges the
//! queue into the graph between solver iterations.

use crate::graph::{EdgeId, GraphSnapshot, NodeId};
use crate::manifold::SE2;
use crate::online::OnlineError;
use crossbeam_channel::{Sender, TrySendError};
use nalgebra::Matrix3;
use std::fmt::{self, Display, Formatter};

/// A candidate constraint `from⁻¹ ∘ to ≈ measurement` between two poses.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopClosureProposal {
    pub from: NodeId,
    pub to: NodeId,
    pub measurement: SE2,
    /// Information matrix, already inverted from the proposed covariance
    pub information: Matrix3<f64>,
}

/// What happened to a proposal once it was merged.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopClosureOutcome {
    /// Added as an active edge
    Accepted(EdgeId),
    /// Added, then deactivated because its chi² at the current estimate
    /// exceeded the gate
    Gated { edge: EdgeId, chi2: f64 },
    /// Not added
    Rejected(String),
}

impl LoopClosureOutcome {
    pub fn edge(&self) -> Option<EdgeId> {
        match self {
            LoopClosureOutcome::Accepted(edge) | LoopClosureOutcome::Gated { edge, .. } => {
                Some(*edge)
            }
            LoopClosureOutcome::Rejected(_) => None,
        }
    }
}

impl Display for LoopClosureOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LoopClosureOutcome::Accepted(edge) => write!(f, "accepted as edge {edge}"),
            LoopClosureOutcome::Gated { edge, chi2 } => {
                write!(f, "gated as inactive edge {edge} (chi2 {chi2:.3e})")
            }
            LoopClosureOutcome::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Cloneable handle that lets detectors on other threads enqueue proposals.
#[derive(Debug, Clone)]
pub struct LoopClosureSender {
    sender: Sender<LoopClosureProposal>,
}

impl LoopClosureSender {
    pub(crate) fn new(sender: Sender<LoopClosureProposal>) -> Self {
        LoopClosureSender { sender }
    }

    /// Enqueue without blocking.
    ///
    /// # Errors
    /// `QueueFull` when the queue is at capacity, `QueueClosed` once the
    /// owning [`OnlineSlam`](crate::online::OnlineSlam) is dropped.
    pub fn send(&self, proposal: LoopClosureProposal) -> Result<(), OnlineError> {
        self.sender.try_send(proposal).map_err(|e| match e {
            TrySendError::Full(_) => OnlineError::QueueFull {
                capacity: self.sender.capacity().unwrap_or(0),
            }
            .log(),
            TrySendError::Disconnected(_) => OnlineError::QueueClosed.log(),
        })
    }

    /// Proposals waiting to be merged.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

/// Place-recognition collaborator.
///
/// Implementations inspect a consistent snapshot and return candidate loop
/// closures. They run outside the solver, typically on their own thread,
/// and submit through a [`LoopClosureSender`].
pub trait LoopClosureDetector {
    fn detect(&mut self, snapshot: &GraphSnapshot) -> Vec<LoopClosureProposal>;
}
