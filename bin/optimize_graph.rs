use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use pose_graph_slam::error::SlamError;
use pose_graph_slam::optimizer::{
    AnchorMode, CycleStatus, IncrementalSolver, OptimizerType, SolverConfig,
};
use pose_graph_slam::{init_logger, init_logger_with_level, load_graph, write_graph};
use tracing::{Level, error, info, warn};

#[derive(Parser)]
#[command(name = "optimize_graph")]
#[command(about = "Batch-optimize a 2D pose graph from a .g2o or .graph file")]
struct Args {
    /// Graph file to load (.g2o or .graph)
    input: PathBuf,

    /// Optimizer type: "lm" (Levenberg-Marquardt) or "gn" (Gauss-Newton)
    #[arg(short, long, default_value = "lm")]
    optimizer: String,

    /// Maximum number of iterations per cycle
    #[arg(short, long, default_value = "100")]
    max_iterations: usize,

    /// Maximum number of cycles to run before giving up on convergence
    #[arg(long, default_value = "5")]
    max_cycles: usize,

    /// Wall-clock budget per cycle in milliseconds
    #[arg(long)]
    time_budget_ms: Option<u64>,

    /// Anchor the first pose with a prior of this weight instead of fixing it
    #[arg(long)]
    prior_weight: Option<f64>,

    /// Relinearization threshold on tangent-space drift
    #[arg(long, default_value = "0.0")]
    relinearize_threshold: f64,

    /// Optional path to save the optimized graph (.g2o or .graph)
    #[arg(long)]
    save_output: Option<PathBuf>,

    /// Enable debug output including per-iteration statistics
    #[arg(short, long)]
    verbose: bool,
}

fn solver_config(args: &Args) -> SolverConfig {
    let optimizer_type = match args.optimizer.to_lowercase().as_str() {
        "gn" | "gauss-newton" => OptimizerType::GaussNewton,
        "lm" | "levenberg-marquardt" => OptimizerType::LevenbergMarquardt,
        other => {
            warn!(
                "Invalid optimizer '{}'. Using LM (Levenberg-Marquardt) as default.",
                other
            );
            OptimizerType::LevenbergMarquardt
        }
    };

    let mut config = SolverConfig::new()
        .with_optimizer_type(optimizer_type)
        .with_max_iterations(args.max_iterations)
        .with_relinearize_threshold(args.relinearize_threshold);
    if let Some(budget) = args.time_budget_ms {
        config = config.with_time_budget(Duration::from_millis(budget));
    }
    if let Some(weight) = args.prior_weight {
        config = config.with_anchor_mode(AnchorMode::Prior { weight });
    }
    config
}

fn run(args: &Args) -> Result<(), SlamError> {
    let load_start = Instant::now();
    let mut graph = load_graph(&args.input)?;
    info!(
        "Loaded {:?} in {:.2}ms: {} nodes, {} edges ({} active)",
        args.input,
        load_start.elapsed().as_secs_f64() * 1000.0,
        graph.node_count(),
        graph.edge_count(),
        graph.active_edge_count()
    );

    let mut solver = IncrementalSolver::with_config(solver_config(args));
    let initial_cost = graph.total_cost()?;
    let start = Instant::now();
    let mut last_status = CycleStatus::NoChange;
    let mut total_iterations = 0;

    for cycle in 0..args.max_cycles {
        let report = solver.run_cycle(&mut graph)?;
        total_iterations += report.iterations;
        last_status = report.status;
        info!("Cycle {}:\n{}", cycle, report);
        if report.status.is_converged() || report.status == CycleStatus::NoChange {
            break;
        }
    }

    let final_cost = graph.total_cost()?;
    let improvement = if initial_cost > 0.0 {
        (initial_cost - final_cost) / initial_cost * 100.0
    } else {
        0.0
    };
    info!(
        "Finished: {} | cost {:.6e} -> {:.6e} ({:.2}% reduction) | {} iterations | {:.2}ms",
        last_status,
        initial_cost,
        final_cost,
        improvement,
        total_iterations,
        start.elapsed().as_secs_f64() * 1000.0
    );

    if let Some(output) = &args.save_output {
        write_graph(&graph, output)?;
        info!("Optimized graph written to {:?}", output);
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
        error!("Optimization failed:\n{}", e.chain());
        std::process::exit(1);
    }
}
