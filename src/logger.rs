//! Logging setup for the pose-graph-slam binaries
//!
//! Library code only emits `tracing` events; installing a subscriber is left to
//! the executable. This module provides the one the bundled binaries use.

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Initialize the tracing subscriber with the default INFO level
///
/// Format: `[LEVEL YYYY-MM-DD HH:MM:SS module]` for INFO/WARN/ERROR
///         `[LEVEL YYYY-MM-DD HH:MM:SS file:line]` for DEBUG/TRACE
///
/// # Example
/// ```no_run
/// use pose_graph_slam::init_logger;
///
/// init_logger();
/// tracing::info!("SLAM back-end started");
/// ```
///
/// # Environment Variables
/// Override the default log level using `RUST_LOG`:
/// ```bash
/// RUST_LOG=debug cargo run --bin optimize_graph -- data/intel.g2o
/// RUST_LOG=pose_graph_slam::optimizer=trace cargo run --bin replay_online -- data/intel.g2o
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level
///
/// `RUST_LOG` still takes precedence when set.
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(SlamFormatter)
        .init();
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

/// `[LEVEL time location] message`, with the thread name appended to the
/// location for events from detector or reader threads.
struct SlamFormatter;

impl<S, N> FormatEvent<S, N> for SlamFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        write!(
            writer,
            "[{} {} ",
            level_tag(level),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        match metadata.file() {
            Some(file) if level >= Level::DEBUG => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                write!(writer, "{}:{}", filename, metadata.line().unwrap_or(0))?;
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        let thread = std::thread::current();
        if let Some(name) = thread.name()
            && name != "main"
        {
            write!(writer, " @{name}")?;
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
