//! Block-sparse normal equations with incremental accumulation.
//!
//! For every active edge the builder caches the Hessian blocks
//! `JᵢᵀΩJᵢ`, `JᵢᵀΩJⱼ`, `JⱼᵀΩJⱼ` and the weighted Jacobians `JᵀΩ` computed at
//! the edge's last linearization point. Node-pair blocks of `H` are the sum of
//! the cached contributions of the edges touching them:
//!
//! ```text
//! H[a,b] = Σ_{e ∈ edges(a,b)} H_e[a,b]
//! b[a]   = Σ_{e ∋ a} (JₐᵀΩ)_e · e_e
//! ```
//!
//! When an edge is added, relinearized or deactivated only the blocks it
//! touches are re-summed, always from scratch and in `EdgeId` order. An
//! incremental update therefore produces exactly the blocks a full rebuild
//! would, with no subtract-and-add drift.
//!
//! The gradient always uses residuals evaluated at the current estimates,
//! even when some Jacobians are stale.

use crate::factors::{FactorResult, Linearization, PriorFactor, weighted_squared_norm};
use crate::graph::{ChangeSet, Edge, EdgeId, Node, NodeId, NodeState, PoseGraph};
use crate::linalg::{LinAlgError, LinAlgResult};
use crate::manifold::LieGroup;
use faer::{
    Mat,
    sparse::{SparseColMat, Triplet},
};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Node-pair block key, smaller id first.
type BlockKey = (NodeId, NodeId);

fn block_key(a: NodeId, b: NodeId) -> BlockKey {
    if a <= b { (a, b) } else { (b, a) }
}

/// Mapping from unknown nodes to their offset in the state-update vector.
///
/// Nodes appear in id order. Poses take 3 entries and landmarks 2. The
/// excluded node (the anchor in fixed mode) has no offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableOrdering {
    offsets: Vec<Option<usize>>,
    variables: Vec<NodeId>,
    dimension: usize,
}

impl VariableOrdering {
    pub fn new(nodes: &[Node], excluded: Option<NodeId>) -> Self {
        let mut offsets = Vec::with_capacity(nodes.len());
        let mut variables = Vec::with_capacity(nodes.len());
        let mut dimension = 0;

        for node in nodes {
            if Some(node.id()) == excluded {
                offsets.push(None);
                continue;
            }
            offsets.push(Some(dimension));
            variables.push(node.id());
            dimension += node.kind().dimension();
        }

        VariableOrdering {
            offsets,
            variables,
            dimension,
        }
    }

    /// First row of `node` in the unknown vector, `None` if it is held fixed.
    pub fn offset(&self, node: NodeId) -> Option<usize> {
        self.offsets.get(node.index()).copied().flatten()
    }

    /// Total number of scalar unknowns.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn variables(&self) -> &[NodeId] {
        &self.variables
    }

    /// Number of nodes this ordering was built for, fixed ones included.
    pub fn node_count(&self) -> usize {
        self.offsets.len()
    }

    /// Apply a tangent-space step to every unknown node.
    ///
    /// Returns the candidate states; `states` itself is left untouched.
    pub fn retract(&self, states: &[NodeState], step: &Mat<f64>) -> Vec<NodeState> {
        states
            .iter()
            .enumerate()
            .map(|(index, state)| match self.offsets.get(index).copied().flatten() {
                Some(offset) => {
                    let delta: Vec<f64> = (0..state.dimension())
                        .map(|k| step[(offset + k, 0)])
                        .collect();
                    state.plus(&delta)
                }
                None => state.clone(),
            })
            .collect()
    }
}

/// Cached linearization of one edge.
#[derive(Debug, Clone)]
struct EdgeContribution {
    from: NodeId,
    to: NodeId,
    /// `J_fromᵀ·Ω`
    weighted_from: DMatrix<f64>,
    /// `J_toᵀ·Ω`
    weighted_to: DMatrix<f64>,
    hessian_from_from: DMatrix<f64>,
    hessian_from_to: DMatrix<f64>,
    hessian_to_to: DMatrix<f64>,
}

impl EdgeContribution {
    fn new(edge: &Edge, linearization: Linearization) -> Self {
        let information = edge.information();
        let weighted_from = linearization.jacobian_from.transpose() * information;
        let weighted_to = linearization.jacobian_to.transpose() * information;

        EdgeContribution {
            from: edge.from(),
            to: edge.to(),
            hessian_from_from: &weighted_from * &linearization.jacobian_from,
            hessian_from_to: &weighted_from * &linearization.jacobian_to,
            hessian_to_to: &weighted_to * &linearization.jacobian_to,
            weighted_from,
            weighted_to,
        }
    }

    fn block_keys(&self) -> [BlockKey; 3] {
        [
            (self.from, self.from),
            (self.to, self.to),
            block_key(self.from, self.to),
        ]
    }

    /// Add this edge's share of block `key` into `target`.
    fn accumulate(&self, key: BlockKey, target: &mut DMatrix<f64>) {
        if key == (self.from, self.from) {
            *target += &self.hessian_from_from;
        } else if key == (self.to, self.to) {
            *target += &self.hessian_to_to;
        } else if key.0 == self.from {
            *target += &self.hessian_from_to;
        } else {
            *target += self.hessian_from_to.transpose();
        }
    }
}

/// Linearized anchoring prior.
#[derive(Debug, Clone)]
struct PriorTerms {
    weighted: DMatrix<f64>,
    hessian: DMatrix<f64>,
}

/// Residuals and total cost at one set of node states.
#[derive(Debug, Clone)]
pub struct Evaluation {
    residuals: Vec<Option<DVector<f64>>>,
    prior_residual: Option<DVector<f64>>,
    cost: f64,
}

impl Evaluation {
    /// `Σ eᵀΩe` over active edges plus the anchoring prior, if any.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Residual of `edge`, `None` for inactive edges.
    pub fn residual(&self, edge: EdgeId) -> Option<&DVector<f64>> {
        self.residuals.get(edge.index()).and_then(Option::as_ref)
    }
}

/// Assembled system `H·Δx = -b`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    /// Full symmetric `H + λI`
    pub hessian: SparseColMat<usize, f64>,
    /// `b = Σ JᵀΩe`, as an `n × 1` column
    pub gradient: Mat<f64>,
    /// Identifies the sparsity pattern, for symbolic factorization reuse
    pub pattern: (u64, usize),
}

impl NormalEquations {
    pub fn dimension(&self) -> usize {
        self.gradient.nrows()
    }

    /// `‖b‖∞`
    pub fn gradient_norm_inf(&self) -> f64 {
        (0..self.gradient.nrows())
            .map(|i| self.gradient[(i, 0)].abs())
            .fold(0.0, f64::max)
    }
}

/// Tangent-space distance between two estimates of the same node.
fn drift(current: &NodeState, reference: &NodeState) -> f64 {
    match (current, reference) {
        (NodeState::Pose(current), NodeState::Pose(reference)) => {
            current.right_minus(reference).coeffs().norm()
        }
        (NodeState::Landmark(current), NodeState::Landmark(reference)) => {
            (current - reference).norm()
        }
        _ => f64::INFINITY,
    }
}

/// Incrementally maintained block-sparse normal equations.
#[derive(Debug, Clone, Default)]
pub struct LinearSystemBuilder {
    contributions: Vec<Option<EdgeContribution>>,
    block_edges: BTreeMap<BlockKey, BTreeSet<EdgeId>>,
    blocks: BTreeMap<BlockKey, DMatrix<f64>>,
    dirty_blocks: BTreeSet<BlockKey>,
    pending_edges: BTreeSet<EdgeId>,
    /// State of each node when its edges were last linearized
    linearized_at: Vec<Option<NodeState>>,
    prior: Option<(NodeId, PriorFactor)>,
    prior_terms: Option<PriorTerms>,
    structure_version: u64,
}

impl LinearSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes whenever the block pattern changes.
    pub fn structure_version(&self) -> u64 {
        self.structure_version
    }

    /// Number of edges with a cached linearization.
    pub fn linearized_edge_count(&self) -> usize {
        self.contributions.iter().flatten().count()
    }

    /// True when some edges are waiting for their first linearization.
    pub fn has_pending_edges(&self) -> bool {
        !self.pending_edges.is_empty()
    }

    /// Install or clear a unary prior that anchors the gauge.
    pub fn set_prior(&mut self, prior: Option<(NodeId, PriorFactor)>) {
        let changed = match (&self.prior, &prior) {
            (Some((old, _)), Some((new, _))) => old != new,
            (None, None) => false,
            _ => true,
        };
        if changed {
            self.structure_version += 1;
        }
        self.prior = prior;
        self.prior_terms = None;
    }

    /// Drop every cached contribution.
    pub fn reset(&mut self) {
        let prior = self.prior.take();
        let version = self.structure_version + 1;
        *self = Self::default();
        self.prior = prior;
        self.structure_version = version;
    }

    /// Register structural changes from the graph's dirty set.
    ///
    /// New active edges are queued for linearization. Deactivated edges are
    /// removed and the blocks they touched are re-summed.
    pub fn apply_changes(&mut self, graph: &PoseGraph, changes: &ChangeSet) {
        self.linearized_at.resize(graph.node_count(), None);
        if self.contributions.len() < graph.edge_count() {
            self.contributions.resize(graph.edge_count(), None);
        }

        for &id in &changes.added_edges {
            if graph.edges().get(id.index()).is_some_and(Edge::is_active) {
                self.pending_edges.insert(id);
            }
        }
        for &id in &changes.deactivated_edges {
            self.remove_edge(id);
        }
        if changes.anchor_changed {
            self.structure_version += 1;
        }

        self.resum_dirty_blocks(graph.nodes());
    }

    fn remove_edge(&mut self, id: EdgeId) {
        self.pending_edges.remove(&id);
        let Some(contribution) = self.contributions.get_mut(id.index()).and_then(Option::take)
        else {
            return;
        };

        for key in contribution.block_keys() {
            let now_empty = match self.block_edges.get_mut(&key) {
                Some(edges) => {
                    edges.remove(&id);
                    edges.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.block_edges.remove(&key);
                self.blocks.remove(&key);
                self.dirty_blocks.remove(&key);
                self.structure_version += 1;
            } else {
                self.dirty_blocks.insert(key);
            }
        }
    }

    /// Relinearize queued edges and every edge incident to a node that drifted
    /// more than `threshold` from its last linearization point.
    ///
    /// Returns the number of edges relinearized.
    pub fn relinearize(&mut self, graph: &PoseGraph, threshold: f64) -> FactorResult<usize> {
        self.linearized_at.resize(graph.node_count(), None);

        let mut dirty = self.pending_edges.clone();
        let mut moved = Vec::new();
        for node in graph.nodes() {
            let stale = match &self.linearized_at[node.id().index()] {
                None => true,
                Some(reference) => drift(node.state(), reference) > threshold,
            };
            if stale {
                moved.push(node.id());
                dirty.extend(
                    graph
                        .incident_edges(node.id())
                        .iter()
                        .copied()
                        .filter(|id| graph.edges()[id.index()].is_active()),
                );
            }
        }

        let count = self.linearize_edges(graph, dirty)?;
        for id in moved {
            self.linearized_at[id.index()] = Some(graph.nodes()[id.index()].state().clone());
        }
        Ok(count)
    }

    /// True when some node moved since its edges were last linearized.
    pub fn has_stale_linearization(&self, graph: &PoseGraph) -> bool {
        graph
            .nodes()
            .iter()
            .any(|node| match self.linearized_at.get(node.id().index()) {
                Some(Some(reference)) => drift(node.state(), reference) > 0.0,
                _ => true,
            })
    }

    /// Relinearize every active edge at the current estimates.
    pub fn relinearize_all(&mut self, graph: &PoseGraph) -> FactorResult<usize> {
        self.linearized_at.resize(graph.node_count(), None);
        let dirty: BTreeSet<EdgeId> = graph.active_edges().map(Edge::id).collect();

        let count = self.linearize_edges(graph, dirty)?;
        for node in graph.nodes() {
            self.linearized_at[node.id().index()] = Some(node.state().clone());
        }
        Ok(count)
    }

    fn linearize_edges(&mut self, graph: &PoseGraph, dirty: BTreeSet<EdgeId>) -> FactorResult<usize> {
        if self.contributions.len() < graph.edge_count() {
            self.contributions.resize(graph.edge_count(), None);
        }

        let nodes = graph.nodes();
        let edges = graph.edges();
        let ids: Vec<EdgeId> = dirty.into_iter().collect();

        let linearized = ids
            .par_iter()
            .map(|id| {
                let edge = &edges[id.index()];
                let linearization = edge.factor().linearize(
                    nodes[edge.from().index()].state(),
                    nodes[edge.to().index()].state(),
                )?;
                Ok(EdgeContribution::new(edge, linearization))
            })
            .collect::<FactorResult<Vec<_>>>()?;

        for (&id, contribution) in ids.iter().zip(linearized) {
            for key in contribution.block_keys() {
                let members = self.block_edges.entry(key).or_default();
                if members.is_empty() {
                    self.structure_version += 1;
                }
                members.insert(id);
                self.dirty_blocks.insert(key);
            }
            self.contributions[id.index()] = Some(contribution);
            self.pending_edges.remove(&id);
        }

        if let Some((node, prior)) = &self.prior {
            let (_, jacobian) = prior.linearize(nodes[node.index()].state())?;
            let weighted = jacobian.transpose() * prior.information();
            self.prior_terms = Some(PriorTerms {
                hessian: &weighted * &jacobian,
                weighted,
            });
        }

        self.resum_dirty_blocks(nodes);
        if !ids.is_empty() {
            debug!("Relinearized {} edge(s)", ids.len());
        }
        Ok(ids.len())
    }

    fn resum_dirty_blocks(&mut self, nodes: &[Node]) {
        for key in std::mem::take(&mut self.dirty_blocks) {
            let Some(members) = self.block_edges.get(&key) else {
                self.blocks.remove(&key);
                continue;
            };

            let rows = nodes[key.0.index()].kind().dimension();
            let cols = nodes[key.1.index()].kind().dimension();
            let mut block = DMatrix::zeros(rows, cols);
            for id in members {
                if let Some(contribution) = &self.contributions[id.index()] {
                    contribution.accumulate(key, &mut block);
                }
            }
            self.blocks.insert(key, block);
        }
    }

    /// Residuals and cost of all active edges at `states`.
    pub fn evaluate(&self, graph: &PoseGraph, states: &[NodeState]) -> FactorResult<Evaluation> {
        let edges = graph.edges();
        let residuals = edges
            .par_iter()
            .map(|edge| {
                if !edge.is_active() {
                    return Ok(None);
                }
                edge.factor()
                    .error(&states[edge.from().index()], &states[edge.to().index()])
                    .map(Some)
            })
            .collect::<FactorResult<Vec<_>>>()?;

        let mut cost = 0.0;
        for (edge, residual) in edges.iter().zip(&residuals) {
            if let Some(residual) = residual {
                cost += weighted_squared_norm(residual, edge.information());
            }
        }

        let prior_residual = match &self.prior {
            Some((node, prior)) => {
                let residual = prior.error(&states[node.index()])?;
                cost += weighted_squared_norm(&residual, prior.information());
                Some(residual)
            }
            None => None,
        };

        Ok(Evaluation {
            residuals,
            prior_residual,
            cost,
        })
    }

    /// Nodes among the unknowns whose diagonal block carries no information.
    pub fn unconstrained_nodes(&self, ordering: &VariableOrdering) -> Vec<NodeId> {
        ordering
            .variables()
            .iter()
            .copied()
            .filter(|&node| {
                let from_edges = self
                    .blocks
                    .get(&(node, node))
                    .is_some_and(|block| block.diagonal().iter().all(|&v| v > 0.0));
                let from_prior = self
                    .prior
                    .as_ref()
                    .is_some_and(|(anchor, _)| *anchor == node);
                !(from_edges || from_prior)
            })
            .collect()
    }

    /// Assemble `H + λI` and `b` over the unknowns of `ordering`.
    pub fn assemble(
        &self,
        ordering: &VariableOrdering,
        evaluation: &Evaluation,
        damping: f64,
    ) -> LinAlgResult<NormalEquations> {
        let n = ordering.dimension();
        let mut triplets = Vec::with_capacity(self.blocks.len() * 18 + n);

        for (&(a, b), block) in &self.blocks {
            let (Some(row_offset), Some(col_offset)) = (ordering.offset(a), ordering.offset(b))
            else {
                continue;
            };
            for col in 0..block.ncols() {
                for row in 0..block.nrows() {
                    let value = block[(row, col)];
                    triplets.push(Triplet::new(row_offset + row, col_offset + col, value));
                    if a != b {
                        triplets.push(Triplet::new(col_offset + col, row_offset + row, value));
                    }
                }
            }
        }

        let mut gradient = Mat::zeros(n, 1);
        let mut add_gradient = |offset: usize, values: &DVector<f64>| {
            for (k, value) in values.iter().enumerate() {
                gradient[(offset + k, 0)] += value;
            }
        };

        if let (Some((node, _)), Some(terms)) = (&self.prior, &self.prior_terms)
            && let Some(offset) = ordering.offset(*node)
        {
            for col in 0..terms.hessian.ncols() {
                for row in 0..terms.hessian.nrows() {
                    triplets.push(Triplet::new(offset + row, offset + col, terms.hessian[(row, col)]));
                }
            }
            if let Some(residual) = &evaluation.prior_residual {
                add_gradient(offset, &(&terms.weighted * residual));
            }
        }

        for (index, residual) in evaluation.residuals.iter().enumerate() {
            let (Some(residual), Some(Some(contribution))) =
                (residual, self.contributions.get(index))
            else {
                continue;
            };
            if let Some(offset) = ordering.offset(contribution.from) {
                add_gradient(offset, &(&contribution.weighted_from * residual));
            }
            if let Some(offset) = ordering.offset(contribution.to) {
                add_gradient(offset, &(&contribution.weighted_to * residual));
            }
        }

        // Always present so the pattern does not depend on λ.
        for i in 0..n {
            triplets.push(Triplet::new(i, i, damping));
        }

        let hessian = SparseColMat::try_new_from_triplets(n, n, &triplets).map_err(|e| {
            LinAlgError::SparseMatrixCreation("Failed to assemble normal equations".to_string())
                .log_with_source(e)
        })?;

        Ok(NormalEquations {
            hessian,
            gradient,
            pattern: (self.structure_version, n),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::manifold::SE2;
    use nalgebra::{Matrix2, Matrix3, Vector2};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn square_graph() -> Result<PoseGraph, Box<dyn std::error::Error>> {
        let mut graph = PoseGraph::new();
        let p0 = graph.add_pose_node(SE2::identity());
        let p1 = graph.add_pose_node(SE2::from_xy_angle(1.1, 0.1, 0.05));
        let p2 = graph.add_pose_node(SE2::from_xy_angle(0.9, 1.2, 1.6));
        let l0 = graph.add_landmark_node(Vector2::new(0.4, 2.1));

        graph.add_between_edge(EdgeKind::Odometry, p0, p1, SE2::from_xy_angle(1.0, 0.0, 0.0), Matrix3::identity())?;
        graph.add_between_edge(
            EdgeKind::Odometry,
            p1,
            p2,
            SE2::from_xy_angle(0.0, 1.0, std::f64::consts::FRAC_PI_2),
            Matrix3::identity() * 2.0,
        )?;
        graph.add_observation_edge(p2, l0, Vector2::new(1.0, 0.5), Matrix2::identity())?;
        graph.add_observation_edge(p0, l0, Vector2::new(0.5, 2.0), Matrix2::identity())?;
        Ok(graph)
    }

    fn full_build(graph: &PoseGraph) -> FactorResult<LinearSystemBuilder> {
        let mut builder = LinearSystemBuilder::new();
        let changes = ChangeSet {
            added_nodes: graph.nodes().iter().map(Node::id).collect(),
            added_edges: graph.edges().iter().map(Edge::id).collect(),
            ..ChangeSet::default()
        };
        builder.apply_changes(graph, &changes);
        builder.relinearize_all(graph)?;
        Ok(builder)
    }

    fn dense(system: &NormalEquations) -> Mat<f64> {
        system.hessian.as_ref().to_dense()
    }

    #[test]
    fn test_ordering_excludes_anchor() -> TestResult {
        let graph = square_graph()?;
        let ordering = VariableOrdering::new(graph.nodes(), graph.anchor());

        assert_eq!(ordering.offset(NodeId(0)), None);
        assert_eq!(ordering.offset(NodeId(1)), Some(0));
        assert_eq!(ordering.offset(NodeId(2)), Some(3));
        assert_eq!(ordering.offset(NodeId(3)), Some(6));
        assert_eq!(ordering.dimension(), 8);
        Ok(())
    }

    #[test]
    fn test_incremental_matches_full_rebuild() -> TestResult {
        let mut graph = square_graph()?;
        let mut incremental = full_build(&graph)?;
        graph.take_changes();

        let closure = graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(2),
            NodeId(0),
            SE2::from_xy_angle(-1.2, 0.8, -1.5),
            Matrix3::identity() * 5.0,
        )?;
        let changes = graph.take_changes();
        incremental.apply_changes(&graph, &changes);
        incremental.relinearize(&graph, 0.0)?;

        graph.deactivate_edge(closure)?;
        graph.deactivate_edge(EdgeId(3))?;
        let changes = graph.take_changes();
        incremental.apply_changes(&graph, &changes);
        incremental.relinearize(&graph, 0.0)?;

        let rebuilt = full_build(&graph)?;
        let ordering = VariableOrdering::new(graph.nodes(), graph.anchor());
        let states = graph.states();

        let a = incremental.assemble(&ordering, &incremental.evaluate(&graph, &states)?, 0.0)?;
        let b = rebuilt.assemble(&ordering, &rebuilt.evaluate(&graph, &states)?, 0.0)?;

        let (ha, hb) = (dense(&a), dense(&b));
        for i in 0..ordering.dimension() {
            assert!((a.gradient[(i, 0)] - b.gradient[(i, 0)]).abs() < 1e-12);
            for j in 0..ordering.dimension() {
                assert!((ha[(i, j)] - hb[(i, j)]).abs() < 1e-12);
            }
        }
        Ok(())
    }

    #[test]
    fn test_gradient_is_half_cost_derivative() -> TestResult {
        let graph = square_graph()?;
        let builder = full_build(&graph)?;
        let ordering = VariableOrdering::new(graph.nodes(), graph.anchor());
        let states = graph.states();
        let system = builder.assemble(&ordering, &builder.evaluate(&graph, &states)?, 0.0)?;

        const STEP: f64 = 1e-6;
        for k in 0..ordering.dimension() {
            let mut step = Mat::zeros(ordering.dimension(), 1);
            step[(k, 0)] = STEP;
            let plus = builder.evaluate(&graph, &ordering.retract(&states, &step))?.cost();
            step[(k, 0)] = -STEP;
            let minus = builder.evaluate(&graph, &ordering.retract(&states, &step))?.cost();

            let numeric = 0.5 * (plus - minus) / (2.0 * STEP);
            assert!(
                (numeric - system.gradient[(k, 0)]).abs() < 1e-5,
                "component {k}: {numeric} vs {}",
                system.gradient[(k, 0)]
            );
        }
        Ok(())
    }

    #[test]
    fn test_damping_keeps_pattern() -> TestResult {
        let graph = square_graph()?;
        let builder = full_build(&graph)?;
        let ordering = VariableOrdering::new(graph.nodes(), graph.anchor());
        let evaluation = builder.evaluate(&graph, &graph.states())?;

        let undamped = builder.assemble(&ordering, &evaluation, 0.0)?;
        let damped = builder.assemble(&ordering, &evaluation, 10.0)?;

        assert_eq!(undamped.pattern, damped.pattern);
        assert!((dense(&damped)[(0, 0)] - dense(&undamped)[(0, 0)] - 10.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_threshold_skips_small_drift() -> TestResult {
        let mut graph = square_graph()?;
        let mut builder = full_build(&graph)?;
        graph.take_changes();

        let mut states = graph.states();
        states[1] = states[1].plus(&[1e-4, 0.0, 0.0]);
        graph.commit_estimates(states)?;

        assert_eq!(builder.relinearize(&graph, 1e-2)?, 0);
        assert_eq!(builder.relinearize(&graph, 0.0)?, 2);
        Ok(())
    }

    #[test]
    fn test_isolated_unknown_is_unconstrained() -> TestResult {
        let mut graph = square_graph()?;
        graph.add_landmark_node(Vector2::new(9.0, 9.0));
        let builder = full_build(&graph)?;
        let ordering = VariableOrdering::new(graph.nodes(), graph.anchor());

        assert_eq!(builder.unconstrained_nodes(&ordering), vec![NodeId(4)]);
        Ok(())
    }
}
