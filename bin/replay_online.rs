use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use nalgebra::{Matrix2, Matrix3, Vector2};
use pose_graph_slam::error::SlamError;
use pose_graph_slam::graph::{Edge, EdgeKind, GraphError, NodeId, PoseGraph};
use pose_graph_slam::manifold::SE2;
use pose_graph_slam::online::{LoopClosureOutcome, OnlineConfig, OnlineSlam};
use pose_graph_slam::optimizer::SolverConfig;
use pose_graph_slam::{init_logger, init_logger_with_level, load_graph, write_graph};
use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(name = "replay_online")]
#[command(about = "Replay a recorded pose graph edge by edge through the online SLAM back-end")]
struct Args {
    /// Graph file to replay (.g2o or .graph)
    input: PathBuf,

    /// Run an optimization cycle after this many ingested edges
    #[arg(short = 'n', long, default_value = "50")]
    optimize_every: usize,

    /// Maximum number of iterations per cycle
    #[arg(short, long, default_value = "10")]
    max_iterations: usize,

    /// Chi² gate for loop closures (disabled when omitted)
    #[arg(long)]
    gate: Option<f64>,

    /// Relinearization threshold on tangent-space drift
    #[arg(long, default_value = "0.01")]
    relinearize_threshold: f64,

    /// Optional path to save the final graph (.g2o or .graph)
    #[arg(long)]
    save_output: Option<PathBuf>,

    /// Enable debug output including per-iteration statistics
    #[arg(short, long)]
    verbose: bool,
}

/// Replays recorded edges into an [`OnlineSlam`], translating node ids.
struct Replayer {
    slam: OnlineSlam,
    node_map: HashMap<NodeId, NodeId>,
    last_source_pose: NodeId,
    skipped: usize,
}

fn covariance3(edge: &Edge) -> Option<Matrix3<f64>> {
    Matrix3::from_column_slice(edge.information().as_slice()).try_inverse()
}

fn covariance2(edge: &Edge) -> Option<Matrix2<f64>> {
    Matrix2::from_column_slice(edge.information().as_slice()).try_inverse()
}

impl Replayer {
    fn new(recorded: &PoseGraph, config: OnlineConfig) -> Result<Self, SlamError> {
        let anchor = recorded
            .anchor()
            .ok_or_else(|| GraphError::MissingAnchor.log())?;
        let initial = recorded
            .estimate(anchor)?
            .as_pose()
            .cloned()
            .ok_or_else(|| GraphError::InvalidAnchor { node: anchor }.log())?;

        let slam = OnlineSlam::with_config(initial, config);
        Ok(Replayer {
            slam,
            node_map: HashMap::from([(anchor, NodeId(0))]),
            last_source_pose: anchor,
            skipped: 0,
        })
    }

    fn skip(&mut self, edge: &Edge, reason: &str) {
        warn!("Skipping edge {} ({} -> {}): {}", edge.id(), edge.from(), edge.to(), reason);
        self.skipped += 1;
    }

    fn ingest(&mut self, edge: &Edge) -> Result<(), SlamError> {
        let from = self.node_map.get(&edge.from()).copied();
        let to = self.node_map.get(&edge.to()).copied();
        let m = edge.measurement();

        match (edge.kind(), from, to) {
            (EdgeKind::Observation, Some(pose), landmark) => {
                let Some(covariance) = covariance2(edge) else {
                    self.skip(edge, "singular information");
                    return Ok(());
                };
                let id = self.slam.push_landmark_observation(
                    pose,
                    landmark,
                    &Vector2::new(m[0], m[1]),
                    &covariance,
                )?;
                self.node_map.insert(edge.to(), id);
            }
            (EdgeKind::Odometry | EdgeKind::LoopClosure, Some(_), None)
                if edge.from() == self.last_source_pose =>
            {
                let Some(covariance) = covariance3(edge) else {
                    self.skip(edge, "singular information");
                    return Ok(());
                };
                let id = self
                    .slam
                    .push_odometry(&SE2::from_xy_angle(m[0], m[1], m[2]), &covariance)?;
                self.node_map.insert(edge.to(), id);
                self.last_source_pose = edge.to();
            }
            (EdgeKind::Odometry | EdgeKind::LoopClosure, Some(a), Some(b)) => {
                let Some(covariance) = covariance3(edge) else {
                    self.skip(edge, "singular information");
                    return Ok(());
                };
                self.slam
                    .propose_loop_closure(a, b, SE2::from_xy_angle(m[0], m[1], m[2]), &covariance)?;
            }
            _ => self.skip(edge, "endpoint not reachable in arrival order"),
        }
        Ok(())
    }

    fn optimize(&mut self, ingested: usize) -> Result<(), SlamError> {
        let start = Instant::now();
        let report = self.slam.optimize()?;
        let gated = report
            .loop_closures
            .iter()
            .filter(|(_, outcome)| matches!(outcome, LoopClosureOutcome::Gated { .. }))
            .count();
        info!(
            "{:>6} edges | {:>5} nodes | {} | cost {:.6e} | {} iters | {} relinearized | {} closures ({} gated) | {:.2}ms",
            ingested,
            self.slam.graph().node_count(),
            report.cycle.status,
            report.cycle.final_cost,
            report.cycle.iterations,
            report.cycle.relinearized_edges,
            report.loop_closures.len(),
            gated,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }
}

fn run(args: &Args) -> Result<(), SlamError> {
    let recorded = load_graph(&args.input)?;
    info!(
        "Replaying {:?}: {} nodes, {} active edges",
        args.input,
        recorded.node_count(),
        recorded.active_edge_count()
    );

    let solver = SolverConfig::new()
        .with_max_iterations(args.max_iterations)
        .with_relinearize_threshold(args.relinearize_threshold);
    let every = args.optimize_every.max(1);
    // Every edge between two optimizations may be a loop closure
    let mut config = OnlineConfig::new()
        .with_solver(solver)
        .with_proposal_queue_capacity(every.max(256));
    if let Some(gate) = args.gate {
        config = config.with_loop_closure_gate(gate);
    }

    let mut replayer = Replayer::new(&recorded, config)?;
    let start = Instant::now();
    let mut ingested = 0;
    for edge in recorded.active_edges() {
        replayer.ingest(edge)?;
        ingested += 1;
        if ingested % every == 0 {
            replayer.optimize(ingested)?;
        }
    }
    replayer.optimize(ingested)?;

    info!(
        "Replay finished in {:.2}ms: {} edges ingested, {} skipped, final cost {:.6e}",
        start.elapsed().as_secs_f64() * 1000.0,
        ingested - replayer.skipped,
        replayer.skipped,
        replayer.slam.cost()?
    );

    if let Some(output) = &args.save_output {
        write_graph(replayer.slam.graph(), output)?;
        info!("Final graph written to {:?}", output);
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    if args.verbose {
        init_logger_with_level(Level::DEBUG);
    } else {
        init_logger();
    }

    if let Err(e) = run(&args) {
        error!("Replay failed:\n{}", e.chain());
        std::process::exit(1);
    }
}
