//! Cycle driver shared by both step policies.
//!
//! A cycle runs:
//!
//! 1. Consume the graph's dirty set and register it with the
//!    [`LinearSystemBuilder`].
//! 2. Relinearize new edges and the edges of nodes that drifted past
//!    `relinearize_threshold`.
//! 3. Check that the system is solvable: every node is connected to the
//!    anchor, and the undamped `H` factorizes when `verify_rank` is set.
//! 4. Iterate: assemble `H`, `b`, solve for a step, evaluate the candidate
//!    state and commit it only if the cost dropped.
//!
//! Budgets (iterations, wall-clock time) and cancellation end a cycle with a
//! successful partial result. A singular system and an exhausted rejection
//! budget are errors, and in both cases the graph keeps the last accepted
//! estimate.

use crate::error::SlamResult;
use crate::factors::PriorFactor;
use crate::graph::{ChangeSet, Edge, Node, NodeId, NodeState, PoseGraph};
use crate::linalg::{
    Evaluation, LinAlgError, LinearSystemBuilder, NormalEquations, SparseCholeskySolver,
    VariableOrdering,
};
use crate::optimizer::gauss_newton::scale_step;
use crate::optimizer::levenberg_marquardt::{DampingState, predicted_reduction, step_quality};
use crate::optimizer::{
    AnchorMode, CancelToken, CycleReport, CycleStatus, GaussNewtonConfig, IterationStats,
    LevenbergMarquardtConfig, OptimizerError, OptimizerResult, OptimizerType, SolverState,
};
use nalgebra::DMatrix;
use tracing::{debug, info};
use web_time::{Duration, Instant};

/// Configuration for [`IncrementalSolver`].
///
/// ```
/// use pose_graph_slam::optimizer::{OptimizerType, SolverConfig};
/// use std::time::Duration;
///
/// let config = SolverConfig::new()
///     .with_optimizer_type(OptimizerType::GaussNewton)
///     .with_max_iterations(20)
///     .with_time_budget(Duration::from_millis(30))
///     .with_relinearize_threshold(1e-3);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Step policy
    pub optimizer_type: OptimizerType,
    /// Iterations per cycle, accepted and rejected
    pub max_iterations: usize,
    /// Wall-clock budget per cycle
    pub time_budget: Option<Duration>,
    /// Relative cost decrease below which an accepted step ends the cycle
    pub cost_tolerance: f64,
    /// Cost below which the estimate is considered exact
    pub absolute_cost_tolerance: f64,
    /// Relative step size below which an accepted step ends the cycle
    pub parameter_tolerance: f64,
    /// Gradient infinity norm below which the cycle ends
    pub gradient_tolerance: f64,
    /// Tangent-space drift after which a node's edges are relinearized.
    ///
    /// `0.0` relinearizes every node that moved at all, which makes each
    /// iteration an exact LM/GN iteration.
    pub relinearize_threshold: f64,
    pub anchor_mode: AnchorMode,
    /// Factorize the undamped system at the start of each cycle and report
    /// `SingularSystem` if that fails
    pub verify_rank: bool,
    pub levenberg_marquardt: LevenbergMarquardtConfig,
    pub gauss_newton: GaussNewtonConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::default(),
            max_iterations: 50,
            time_budget: None,
            cost_tolerance: 1e-6,
            absolute_cost_tolerance: 1e-12,
            parameter_tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            relinearize_threshold: 0.0,
            anchor_mode: AnchorMode::default(),
            verify_rank: true,
            levenberg_marquardt: LevenbergMarquardtConfig::default(),
            gauss_newton: GaussNewtonConfig::default(),
        }
    }
}

impl SolverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_optimizer_type(mut self, optimizer_type: OptimizerType) -> Self {
        self.optimizer_type = optimizer_type;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_absolute_cost_tolerance(mut self, tolerance: f64) -> Self {
        self.absolute_cost_tolerance = tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_relinearize_threshold(mut self, threshold: f64) -> Self {
        self.relinearize_threshold = threshold;
        self
    }

    pub fn with_anchor_mode(mut self, anchor_mode: AnchorMode) -> Self {
        self.anchor_mode = anchor_mode;
        self
    }

    pub fn with_verify_rank(mut self, verify_rank: bool) -> Self {
        self.verify_rank = verify_rank;
        self
    }

    pub fn with_levenberg_marquardt(mut self, config: LevenbergMarquardtConfig) -> Self {
        self.levenberg_marquardt = config;
        self
    }

    pub fn with_gauss_newton(mut self, config: GaussNewtonConfig) -> Self {
        self.gauss_newton = config;
        self
    }

    /// Reject negative or non-finite tolerances and inconsistent damping bounds.
    pub fn validate(&self) -> OptimizerResult<()> {
        let tolerances = [
            ("cost_tolerance", self.cost_tolerance),
            ("absolute_cost_tolerance", self.absolute_cost_tolerance),
            ("parameter_tolerance", self.parameter_tolerance),
            ("gradient_tolerance", self.gradient_tolerance),
            ("relinearize_threshold", self.relinearize_threshold),
        ];
        for (name, value) in tolerances {
            if !value.is_finite() || value < 0.0 {
                return Err(OptimizerError::InvalidParameters(format!(
                    "{name} must be finite and non-negative, got {value}"
                ))
                .log());
            }
        }

        let lm = &self.levenberg_marquardt;
        if !(lm.damping_min > 0.0 && lm.damping_min <= lm.damping_max && lm.damping_nu > 1.0) {
            return Err(OptimizerError::InvalidParameters(format!(
                "damping bounds [{:e}, {:e}] with nu {} are inconsistent",
                lm.damping_min, lm.damping_max, lm.damping_nu
            ))
            .log());
        }

        if let AnchorMode::Prior { weight } = self.anchor_mode
            && !(weight.is_finite() && weight > 0.0)
        {
            return Err(OptimizerError::InvalidParameters(format!(
                "prior weight must be positive, got {weight}"
            ))
            .log());
        }
        Ok(())
    }
}

/// Outcome of one attempted step.
struct StepAttempt {
    step_norm: f64,
    quality: f64,
    accepted: Option<(Vec<NodeState>, Evaluation)>,
}

/// Incremental nonlinear least-squares solver for a [`PoseGraph`].
///
/// The solver keeps the linear system between cycles, so a cycle after a
/// small change (one new pose, one loop closure) only linearizes the edges
/// that the change touched and the edges of nodes that moved.
#[derive(Debug, Default)]
pub struct IncrementalSolver {
    config: SolverConfig,
    builder: LinearSystemBuilder,
    linear_solver: SparseCholeskySolver,
    state: SolverState,
    cancel: CancelToken,
    known_nodes: usize,
    known_edges: usize,
    prior_anchor: Option<NodeId>,
    /// The previous cycle did not converge
    pending_work: bool,
    last_cost: f64,
}

/// `‖x‖` over the vector forms of all node states.
fn parameter_norm(states: &[NodeState]) -> f64 {
    states
        .iter()
        .map(|state| state.to_vector().norm_squared())
        .sum::<f64>()
        .sqrt()
}

impl IncrementalSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SolverConfig) -> Self {
        IncrementalSolver {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Replace the configuration. Takes effect at the next cycle.
    pub fn set_config(&mut self, config: SolverConfig) {
        self.config = config;
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Handle that cancels the running (or next) cycle from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run one optimization cycle.
    ///
    /// # Errors
    /// - `SingularSystem` if the graph is disconnected or under-constrained
    /// - `Diverged` if the rejection budget is exhausted
    ///
    /// In both cases the graph keeps the last accepted estimate.
    pub fn run_cycle(&mut self, graph: &mut PoseGraph) -> OptimizerResult<CycleReport> {
        self.run_cycle_with(graph, |_, _| {})
    }

    /// Run one optimization cycle, calling `between_iterations` after every
    /// iteration that does not end the cycle.
    ///
    /// The callback may add nodes and edges to the graph; they are merged into
    /// the running cycle before the next iteration.
    pub fn run_cycle_with<F>(
        &mut self,
        graph: &mut PoseGraph,
        mut between_iterations: F,
    ) -> OptimizerResult<CycleReport>
    where
        F: FnMut(&mut PoseGraph, &IterationStats),
    {
        self.config.validate()?;
        let start_time = Instant::now();

        let changed = self.synchronize(graph);
        if !changed && !self.pending_work {
            debug!("No graph changes since the last converged cycle");
            return Ok(CycleReport::unchanged(
                self.config.optimizer_type,
                self.last_cost,
                graph.version(),
            ));
        }

        self.state = SolverState::Linearizing;
        let threshold = self.config.relinearize_threshold;
        let cost_before = self.last_cost;
        let result = self.builder.relinearize(graph, threshold);
        let mut relinearized = self.guard(result, cost_before)?;
        let mut ordering = self.ordering(graph);
        let mut states = graph.states();
        let result = self.builder.evaluate(graph, &states);
        let mut current = self.guard(result, cost_before)?;

        if let Err(e) = self.check_solvable(graph, &ordering, &current) {
            self.fail(SolverState::Idle, current.cost());
            return Err(e);
        }
        if !current.cost().is_finite() {
            self.fail(SolverState::Idle, current.cost());
            return Err(OptimizerError::NumericalInstability(format!(
                "initial cost is {}",
                current.cost()
            ))
            .log());
        }

        let initial_cost = current.cost();
        let rejection_budget = match self.config.optimizer_type {
            OptimizerType::LevenbergMarquardt => {
                self.config.levenberg_marquardt.max_consecutive_rejections
            }
            OptimizerType::GaussNewton => 0,
        };
        let mut damping = DampingState::new(&self.config.levenberg_marquardt);
        let mut history = Vec::new();
        let mut iteration = 0;
        let mut accepted_steps = 0;
        let mut rejected_steps = 0;
        let mut consecutive_rejections = 0;
        let mut relinearized_before = relinearized;

        if tracing::enabled!(tracing::Level::DEBUG) {
            IterationStats::print_header();
        }

        let status = loop {
            if self.cancel.take() {
                break CycleStatus::Cancelled;
            }
            if let Some(budget) = self.config.time_budget
                && start_time.elapsed() >= budget
            {
                break CycleStatus::Timeout;
            }
            if ordering.dimension() == 0 || current.cost() <= self.config.absolute_cost_tolerance {
                break CycleStatus::Converged;
            }
            if iteration >= self.config.max_iterations {
                break CycleStatus::MaxIterationsReached;
            }

            let iter_start = Instant::now();
            self.state = SolverState::SolvingStep;
            let lambda = match self.config.optimizer_type {
                OptimizerType::LevenbergMarquardt => damping.damping(),
                OptimizerType::GaussNewton => 0.0,
            };

            let result = self.builder.assemble(&ordering, &current, lambda);
            let system = self.guard(result, current.cost())?;
            let gradient_norm = system.gradient_norm_inf();
            if !gradient_norm.is_finite() {
                self.fail(SolverState::Idle, current.cost());
                return Err(OptimizerError::NumericalInstability(
                    "non-finite gradient".to_string(),
                )
                .log());
            }
            if gradient_norm <= self.config.gradient_tolerance {
                break CycleStatus::GradientToleranceReached;
            }

            let attempt = match self.config.optimizer_type {
                OptimizerType::LevenbergMarquardt => {
                    let result = self.try_damped_step(
                        graph,
                        &ordering,
                        &states,
                        &current,
                        &system,
                        &mut damping,
                    );
                    self.guard(result, current.cost())?
                }
                OptimizerType::GaussNewton => {
                    let result = self.try_halved_step(graph, &ordering, &states, &current, &system);
                    self.guard(result, current.cost())?
                }
            };

            let previous_cost = current.cost();
            let accepted = attempt.accepted.is_some();
            if let Some((candidate_states, candidate)) = attempt.accepted {
                let result = graph.commit_estimates(candidate_states.clone()).map_err(|e| {
                    OptimizerError::NumericalInstability(e.to_string()).log_with_source(&e)
                });
                self.guard(result, previous_cost)?;
                states = candidate_states;
                current = candidate;
                accepted_steps += 1;
                consecutive_rejections = 0;
            } else {
                rejected_steps += 1;
                consecutive_rejections += 1;
            }

            let stats = IterationStats {
                iteration,
                cost: current.cost(),
                cost_change: previous_cost - current.cost(),
                gradient_norm,
                step_norm: attempt.step_norm,
                step_quality: attempt.quality,
                damping: lambda,
                relinearized: relinearized_before,
                iter_time_ms: iter_start.elapsed().as_secs_f64() * 1000.0,
                total_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
                accepted,
            };
            if tracing::enabled!(tracing::Level::DEBUG) {
                stats.print_line();
            }
            history.push(stats.clone());
            iteration += 1;

            let tolerance = self.config.parameter_tolerance;
            let negligible_step =
                attempt.step_norm <= tolerance * (parameter_norm(&states) + tolerance);
            if accepted {
                if negligible_step {
                    break CycleStatus::ParameterToleranceReached;
                }
                let cost_change = previous_cost - current.cost();
                if cost_change / previous_cost.max(f64::MIN_POSITIVE) < self.config.cost_tolerance {
                    break CycleStatus::CostToleranceReached;
                }
            } else if self.builder.has_stale_linearization(graph) {
                // The retry at a fresh linearization point is not charged
                // against the rejection budget.
                debug!("Step rejected at a stale linearization point, relinearizing all edges");
                consecutive_rejections -= 1;
                let result = self.builder.relinearize_all(graph);
                relinearized += self.guard(result, current.cost())?;
            } else if negligible_step && attempt.step_norm > 0.0 {
                // Only round-off is left to gain at this point.
                break CycleStatus::ParameterToleranceReached;
            } else if consecutive_rejections > rejection_budget {
                let error = OptimizerError::Diverged {
                    rejections: consecutive_rejections,
                    damping: damping.damping(),
                    cost: current.cost(),
                };
                self.fail(SolverState::Diverged, current.cost());
                return Err(error.log());
            }

            between_iterations(graph, &stats);
            if graph.has_pending_changes() {
                self.synchronize(graph);
                if let Err(e) = graph.check_connectivity() {
                    self.fail(SolverState::Idle, current.cost());
                    return Err(OptimizerError::SingularSystem(LinAlgError::UnderConstrained(
                        e.to_string(),
                    ))
                    .log());
                }
                ordering = self.ordering(graph);
                states = graph.states();
                let result = self.builder.relinearize(graph, threshold);
                let count = self.guard(result, current.cost())?;
                let result = self.builder.evaluate(graph, &states);
                current = self.guard(result, current.cost())?;
                relinearized += count;
                relinearized_before = count;
            } else {
                self.state = SolverState::Linearizing;
                let result = self.builder.relinearize(graph, threshold);
                relinearized_before = self.guard(result, current.cost())?;
                relinearized += relinearized_before;
            }
        };

        let converged = status.is_converged();
        self.state = if converged {
            SolverState::Converged
        } else {
            SolverState::Idle
        };
        self.pending_work = !converged;
        self.last_cost = current.cost();

        let report = CycleReport {
            status,
            optimizer_type: self.config.optimizer_type,
            initial_cost,
            final_cost: current.cost(),
            iterations: iteration,
            accepted_steps,
            rejected_steps,
            relinearized_edges: relinearized,
            final_damping: match self.config.optimizer_type {
                OptimizerType::LevenbergMarquardt => damping.damping(),
                OptimizerType::GaussNewton => 0.0,
            },
            elapsed: start_time.elapsed(),
            graph_version: graph.version(),
            iteration_history: history,
        };

        info!(
            "{} cycle: {} after {} iteration(s), cost {:.6e} -> {:.6e} in {:.2}ms",
            report.optimizer_type,
            report.status,
            report.iterations,
            report.initial_cost,
            report.final_cost,
            report.elapsed.as_secs_f64() * 1000.0
        );
        if tracing::enabled!(tracing::Level::DEBUG) {
            debug!("{}", report);
        }
        Ok(report)
    }

    /// Covariance block of `node` at the current estimate, `H⁻¹[node, node]`.
    ///
    /// A node held fixed by the anchor has zero covariance.
    pub fn marginal_covariance(
        &mut self,
        graph: &mut PoseGraph,
        node: NodeId,
    ) -> SlamResult<DMatrix<f64>> {
        let dim = graph.node(node)?.kind().dimension();
        if self.synchronize(graph) {
            self.pending_work = true;
        }
        graph.check_connectivity()?;
        self.builder.relinearize(graph, 0.0)?;

        let ordering = self.ordering(graph);
        let Some(offset) = ordering.offset(node) else {
            return Ok(DMatrix::zeros(dim, dim));
        };

        let evaluation = self.builder.evaluate(graph, &graph.states())?;
        let system = self.builder.assemble(&ordering, &evaluation, 0.0)?;
        self.linear_solver
            .factorize(&system)
            .map_err(|e| OptimizerError::SingularSystem(e).log())?;

        let block = self.linear_solver.covariance_block(offset, dim)?;
        Ok(DMatrix::from_fn(dim, dim, |i, j| block[(i, j)]))
    }

    fn fail(&mut self, state: SolverState, cost: f64) {
        self.state = state;
        self.pending_work = true;
        self.last_cost = cost;
    }

    /// Pass `result` through, leaving the solver idle with work pending on error.
    fn guard<T, E>(&mut self, result: Result<T, E>, cost: f64) -> OptimizerResult<T>
    where
        E: Into<OptimizerError>,
    {
        result.map_err(|e| {
            self.fail(SolverState::Idle, cost);
            e.into()
        })
    }

    fn ordering(&self, graph: &PoseGraph) -> VariableOrdering {
        let excluded = match self.config.anchor_mode {
            AnchorMode::Fixed => graph.anchor(),
            AnchorMode::Prior { .. } => None,
        };
        VariableOrdering::new(graph.nodes(), excluded)
    }

    /// Consume the graph's dirty set. Returns whether anything changed.
    fn synchronize(&mut self, graph: &mut PoseGraph) -> bool {
        let changes = graph.take_changes();
        let changed = !changes.is_empty();

        let in_step = self.known_nodes + changes.added_nodes.len() == graph.node_count()
            && self.known_edges + changes.added_edges.len() == graph.edge_count();
        if in_step {
            self.builder.apply_changes(graph, &changes);
        } else {
            debug!("Linear system out of step with the graph, rebuilding");
            self.builder.reset();
            let everything = ChangeSet {
                added_nodes: graph.nodes().iter().map(Node::id).collect(),
                added_edges: graph.active_edges().map(Edge::id).collect(),
                deactivated_edges: Vec::new(),
                anchor_changed: true,
            };
            self.builder.apply_changes(graph, &everything);
        }

        self.known_nodes = graph.node_count();
        self.known_edges = graph.edge_count();
        self.update_prior(graph);
        changed || !in_step
    }

    fn update_prior(&mut self, graph: &PoseGraph) {
        match self.config.anchor_mode {
            AnchorMode::Fixed => {
                if self.prior_anchor.take().is_some() {
                    self.builder.set_prior(None);
                }
            }
            AnchorMode::Prior { weight } => {
                let anchor = graph.anchor();
                if anchor != self.prior_anchor {
                    let prior = anchor.and_then(|id| {
                        graph.nodes()[id.index()]
                            .state()
                            .as_pose()
                            .map(|pose| (id, PriorFactor::with_weight(pose.clone(), weight)))
                    });
                    self.builder.set_prior(prior);
                    self.prior_anchor = anchor;
                }
            }
        }
    }

    fn check_solvable(
        &mut self,
        graph: &PoseGraph,
        ordering: &VariableOrdering,
        evaluation: &Evaluation,
    ) -> OptimizerResult<()> {
        graph.check_connectivity().map_err(|e| {
            OptimizerError::SingularSystem(LinAlgError::UnderConstrained(e.to_string())).log()
        })?;
        if ordering.dimension() == 0 {
            return Ok(());
        }

        if let Some(node) = self.builder.unconstrained_nodes(ordering).first() {
            return Err(OptimizerError::SingularSystem(LinAlgError::UnderConstrained(
                format!("no active constraint determines node {node}"),
            ))
            .log());
        }

        if self.config.verify_rank {
            let system = self.builder.assemble(ordering, evaluation, 0.0)?;
            self.linear_solver
                .factorize(&system)
                .map_err(|e| OptimizerError::SingularSystem(e).log())?;
        }
        Ok(())
    }

    fn try_damped_step(
        &mut self,
        graph: &PoseGraph,
        ordering: &VariableOrdering,
        states: &[NodeState],
        current: &Evaluation,
        system: &NormalEquations,
        damping: &mut DampingState,
    ) -> OptimizerResult<StepAttempt> {
        let lambda = damping.damping();
        let step = match self.linear_solver.solve_step(system) {
            Ok(step) => step,
            Err(e) => {
                debug!("Damped system could not be solved ({}), increasing damping", e);
                damping.reject();
                return Ok(StepAttempt {
                    step_norm: 0.0,
                    quality: 0.0,
                    accepted: None,
                });
            }
        };

        let candidate_states = ordering.retract(states, &step);
        let candidate = self.builder.evaluate(graph, &candidate_states)?;
        let predicted = predicted_reduction(&step, &system.gradient, lambda);
        let rho = step_quality(current.cost(), candidate.cost(), predicted);

        let improved = candidate.cost().is_finite() && candidate.cost() < current.cost();
        let accepted = if improved {
            damping.update(rho.max(f64::EPSILON))
        } else {
            damping.reject();
            false
        };

        Ok(StepAttempt {
            step_norm: step.norm_l2(),
            quality: rho,
            accepted: accepted.then_some((candidate_states, candidate)),
        })
    }

    fn try_halved_step(
        &mut self,
        graph: &PoseGraph,
        ordering: &VariableOrdering,
        states: &[NodeState],
        current: &Evaluation,
        system: &NormalEquations,
    ) -> OptimizerResult<StepAttempt> {
        let step = self
            .linear_solver
            .solve_step(system)
            .map_err(|e| OptimizerError::SingularSystem(e).log())?;

        for scale in self.config.gauss_newton.step_scales() {
            let scaled = scale_step(&step, scale);
            let candidate_states = ordering.retract(states, &scaled);
            let candidate = self.builder.evaluate(graph, &candidate_states)?;
            if candidate.cost().is_finite() && candidate.cost() < current.cost() {
                return Ok(StepAttempt {
                    step_norm: scaled.norm_l2(),
                    quality: scale,
                    accepted: Some((candidate_states, candidate)),
                });
            }
        }

        Ok(StepAttempt {
            step_norm: step.norm_l2(),
            quality: 0.0,
            accepted: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;
    use crate::manifold::{LieGroup, SE2};
    use nalgebra::{Matrix3, Vector2};

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn odometry_chain(graph: &mut PoseGraph, count: usize) -> Result<(), Box<dyn std::error::Error>> {
        let mut previous = graph.add_pose_node(SE2::identity());
        for i in 1..count {
            let next = graph.add_pose_node(SE2::from_xy_angle(i as f64 * 1.1, 0.2, 0.1));
            graph.add_between_edge(
                EdgeKind::Odometry,
                previous,
                next,
                SE2::from_xy_angle(1.0, 0.0, 0.0),
                Matrix3::identity(),
            )?;
            previous = next;
        }
        Ok(())
    }

    #[test]
    fn test_chain_converges_to_measurements() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 4)?;
        let mut solver = IncrementalSolver::new();

        let report = solver.run_cycle(&mut graph)?;
        assert!(report.is_converged());
        assert!(report.final_cost < 1e-10);
        assert_eq!(solver.state(), SolverState::Converged);

        let last = graph.nodes()[3].state().as_pose().cloned().ok_or("pose")?;
        assert!((last.x() - 3.0).abs() < 1e-5);
        assert!(last.y().abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_second_cycle_without_changes_is_no_change() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 3)?;
        let mut solver = IncrementalSolver::new();
        solver.run_cycle(&mut graph)?;

        let version = graph.version();
        let report = solver.run_cycle(&mut graph)?;
        assert_eq!(report.status, CycleStatus::NoChange);
        assert_eq!(graph.version(), version);
        Ok(())
    }

    #[test]
    fn test_internal_error_leaves_work_pending() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 3)?;
        let mut solver = IncrementalSolver::new();
        solver.run_cycle(&mut graph)?;
        assert_eq!(solver.state(), SolverState::Converged);

        solver.state = SolverState::SolvingStep;
        let error = crate::factors::FactorError::WrongNodeKind {
            slot: "first",
            expected: crate::graph::NodeKind::Pose,
            actual: crate::graph::NodeKind::Landmark,
        };
        let result: OptimizerResult<()> = solver.guard(Err(error), 0.5);
        assert!(matches!(result, Err(OptimizerError::Factor(_))));
        assert_eq!(solver.state(), SolverState::Idle);

        let report = solver.run_cycle(&mut graph)?;
        assert_ne!(report.status, CycleStatus::NoChange);
        assert!(report.is_converged());
        Ok(())
    }

    #[test]
    fn test_gauss_newton_matches_levenberg_marquardt() -> TestResult {
        let mut lm_graph = PoseGraph::new();
        odometry_chain(&mut lm_graph, 5)?;
        lm_graph.add_between_edge(
            EdgeKind::LoopClosure,
            NodeId(0),
            NodeId(4),
            SE2::from_xy_angle(3.8, 0.1, 0.0),
            Matrix3::identity(),
        )?;
        let mut gn_graph = lm_graph.clone();

        IncrementalSolver::new().run_cycle(&mut lm_graph)?;
        IncrementalSolver::with_config(
            SolverConfig::new().with_optimizer_type(OptimizerType::GaussNewton),
        )
        .run_cycle(&mut gn_graph)?;

        for (a, b) in lm_graph.states().iter().zip(gn_graph.states()) {
            assert!((a.to_vector() - b.to_vector()).norm() < 1e-4);
        }
        Ok(())
    }

    #[test]
    fn test_disconnected_graph_is_singular() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 2)?;
        graph.add_landmark_node(Vector2::new(3.0, 3.0));
        let before = graph.states();

        let mut solver = IncrementalSolver::new();
        let result = solver.run_cycle(&mut graph);
        assert!(matches!(result, Err(OptimizerError::SingularSystem(_))));
        assert_eq!(graph.states(), before);
        assert_eq!(solver.state(), SolverState::Idle);
        Ok(())
    }

    #[test]
    fn test_iteration_budget_is_partial_result() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 6)?;
        let initial = graph.total_cost()?;

        let mut solver = IncrementalSolver::with_config(SolverConfig::new().with_max_iterations(1));
        let report = solver.run_cycle(&mut graph)?;
        assert_eq!(report.status, CycleStatus::MaxIterationsReached);
        assert_eq!(solver.state(), SolverState::Idle);
        assert!(graph.total_cost()? <= initial);

        // Unfinished work is resumed even without new changes
        let resumed = solver.run_cycle(&mut graph)?;
        assert_ne!(resumed.status, CycleStatus::NoChange);
        Ok(())
    }

    #[test]
    fn test_cancel_before_cycle() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 3)?;
        let before = graph.states();

        let mut solver = IncrementalSolver::new();
        solver.cancel_token().cancel();
        let report = solver.run_cycle(&mut graph)?;
        assert_eq!(report.status, CycleStatus::Cancelled);
        assert_eq!(graph.states(), before);
        assert!(!solver.cancel_token().is_cancelled());
        Ok(())
    }

    #[test]
    fn test_prior_anchor_mode_keeps_anchor_in_place() -> TestResult {
        let mut graph = PoseGraph::new();
        odometry_chain(&mut graph, 4)?;
        let mut solver = IncrementalSolver::with_config(
            SolverConfig::new().with_anchor_mode(AnchorMode::Prior { weight: 1000.0 }),
        );

        solver.run_cycle(&mut graph)?;
        let anchor = graph.nodes()[0].state().as_pose().cloned().ok_or("pose")?;
        assert!(anchor.is_approx(&SE2::identity(), 1e-6));
        Ok(())
    }

    #[test]
    fn test_covariance_of_single_edge_is_inverse_information() -> TestResult {
        let mut graph = PoseGraph::new();
        let a = graph.add_pose_node(SE2::identity());
        let b = graph.add_pose_node(SE2::from_xy_angle(1.0, 0.0, 0.0));
        let information = Matrix3::from_diagonal(&nalgebra::Vector3::new(100.0, 25.0, 4.0));
        graph.add_between_edge(EdgeKind::Odometry, a, b, SE2::from_xy_angle(1.0, 0.0, 0.0), information)?;

        let mut solver = IncrementalSolver::new();
        solver.run_cycle(&mut graph)?;
        let covariance = solver.marginal_covariance(&mut graph, b)?;

        assert!((covariance[(0, 0)] - 0.01).abs() < 1e-9);
        assert!((covariance[(1, 1)] - 0.04).abs() < 1e-9);
        assert!((covariance[(2, 2)] - 0.25).abs() < 1e-9);
        assert_eq!(solver.marginal_covariance(&mut graph, a)?, DMatrix::zeros(3, 3));
        Ok(())
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut graph = PoseGraph::new();
        let mut solver =
            IncrementalSolver::with_config(SolverConfig::new().with_cost_tolerance(-1.0));
        assert!(matches!(
            solver.run_cycle(&mut graph),
            Err(OptimizerError::InvalidParameters(_))
        ));
    }
}
