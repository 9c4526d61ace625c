//! Graph file import and export.
//!
//! Two line-based formats are supported:
//!
//! - **g2o** (`.g2o`): `VERTEX_SE2`, `VERTEX_XY`, `EDGE_SE2`, `EDGE_SE2_XY` and
//!   `FIX` records, the format most public 2D SLAM datasets ship in. Export is
//!   lossy: inactive edges are dropped and edge kinds are inferred on import.
//! - **native** (`.graph`): every node, every edge with its kind and active
//!   flag, and the anchor. Loading a written file reproduces the graph.
//!
//! Files are memory-mapped and, above a size threshold, parsed in parallel.
//! Records are always applied to the graph in file order.

use crate::graph::{GraphError, PoseGraph};
use nalgebra::DMatrix;
use rayon::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{error, info};

pub mod g2o;
pub mod graph_file;

pub use g2o::G2oLoader;
pub use graph_file::GraphFileLoader;

/// Files with more lines than this are parsed in parallel.
const MINIMUM_LINES_FOR_PARALLEL: usize = 1000;

/// Errors that can occur while reading or writing graph files
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    #[error("Duplicate vertex ID: {id}")]
    DuplicateVertex { id: usize },

    #[error("Unknown vertex ID {id} at line {line}")]
    UnknownVertex { line: usize, id: usize },

    #[error("Expected id {expected} at line {line}, found {found}")]
    NonContiguousId {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid record at line {line}: {source}")]
    InvalidRecord {
        line: usize,
        #[source]
        source: GraphError,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl IoError {
    /// Log the error using tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with source error information using tracing::error and return self for chaining
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Supported graph file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    G2o,
    Native,
}

impl GraphFormat {
    /// Pick the format from the file extension (`.g2o` or `.graph`).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, IoError> {
        let path_ref = path.as_ref();
        let extension = path_ref
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                IoError::UnsupportedFormat("No file extension".to_string())
                    .log_with_source(format!("File path: {:?}", path_ref))
            })?;

        match extension.to_lowercase().as_str() {
            "g2o" => Ok(GraphFormat::G2o),
            "graph" => Ok(GraphFormat::Native),
            _ => Err(
                IoError::UnsupportedFormat(format!("Unsupported extension: {extension}"))
                    .log_with_source(format!("File path: {:?}", path_ref)),
            ),
        }
    }
}

/// Trait for graph file loaders and writers
pub trait GraphLoader {
    /// Build a graph from file content.
    fn parse(content: &str) -> Result<PoseGraph, IoError>;

    /// Serialize a graph.
    fn write_to<W: Write>(graph: &PoseGraph, writer: &mut W) -> Result<(), IoError>;

    /// Load a graph from a file
    fn load<P: AsRef<Path>>(path: P) -> Result<PoseGraph, IoError> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to open graph file: {:?}", path_ref))
        })?;
        if file.metadata()?.len() == 0 {
            return Self::parse("");
        }

        // SAFETY: the mapping is read-only and dropped before returning. A
        // concurrent truncation of the file is outside what we guard against.
        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| {
                IoError::Io(e)
                    .log_with_source(format!("Failed to memory-map graph file: {:?}", path_ref))
            })?
        };
        let content = std::str::from_utf8(&mmap).map_err(|e| {
            IoError::Parse {
                line: 0,
                message: format!("Invalid UTF-8: {e}"),
            }
            .log()
        })?;

        let graph = Self::parse(content)?;
        info!(
            "Loaded {} nodes and {} edges from {:?}",
            graph.node_count(),
            graph.edge_count(),
            path_ref
        );
        Ok(graph)
    }

    /// Write a graph to a file
    fn write<P: AsRef<Path>>(graph: &PoseGraph, path: P) -> Result<(), IoError> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to create graph file: {:?}", path_ref))
        })?;
        let mut writer = BufWriter::new(file);
        Self::write_to(graph, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

/// Load any supported format based on the file extension.
pub fn load_graph<P: AsRef<Path>>(path: P) -> Result<PoseGraph, IoError> {
    match GraphFormat::from_path(&path)? {
        GraphFormat::G2o => G2oLoader::load(path),
        GraphFormat::Native => GraphFileLoader::load(path),
    }
}

/// Write any supported format based on the file extension.
pub fn write_graph<P: AsRef<Path>>(graph: &PoseGraph, path: P) -> Result<(), IoError> {
    match GraphFormat::from_path(&path)? {
        GraphFormat::G2o => G2oLoader::write(graph, path),
        GraphFormat::Native => GraphFileLoader::write(graph, path),
    }
}

/// Parse every non-empty, non-comment line with `parse_line`.
///
/// Returns `(line_number, record)` pairs in file order. `parse_line` returns
/// `None` for records it skips.
pub(crate) fn parse_records<T, F>(content: &str, parse_line: F) -> Result<Vec<(usize, T)>, IoError>
where
    T: Send,
    F: Fn(&[&str], usize) -> Result<Option<T>, IoError> + Sync,
{
    let lines: Vec<&str> = content.lines().collect();
    let parse = |(index, line): (usize, &&str)| -> Result<Option<(usize, T)>, IoError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let line_num = index + 1;
        Ok(parse_line(&parts, line_num)?.map(|record| (line_num, record)))
    };

    let records: Vec<Option<(usize, T)>> = if lines.len() > MINIMUM_LINES_FOR_PARALLEL {
        lines.par_iter().enumerate().map(parse).collect::<Result<_, _>>()?
    } else {
        lines.iter().enumerate().map(parse).collect::<Result<_, _>>()?
    };
    Ok(records.into_iter().flatten().collect())
}

/// Parse field `index` of a record.
pub(crate) fn parse_field<T: FromStr>(parts: &[&str], index: usize, line: usize) -> Result<T, IoError> {
    let value = parts
        .get(index)
        .ok_or(IoError::MissingFields { line })?;
    value.parse::<T>().map_err(|_| IoError::InvalidNumber {
        line,
        value: value.to_string(),
    })
}

/// Parse `count` consecutive floats starting at field `start`.
pub(crate) fn parse_floats(
    parts: &[&str],
    start: usize,
    count: usize,
    line: usize,
) -> Result<Vec<f64>, IoError> {
    (start..start + count)
        .map(|index| parse_field::<f64>(parts, index, line))
        .collect()
}

/// Symmetric `dim × dim` matrix from its row-major upper triangle.
pub(crate) fn symmetric_from_upper(values: &[f64], dim: usize) -> DMatrix<f64> {
    let mut matrix = DMatrix::zeros(dim, dim);
    let mut k = 0;
    for i in 0..dim {
        for j in i..dim {
            matrix[(i, j)] = values[k];
            matrix[(j, i)] = values[k];
            k += 1;
        }
    }
    matrix
}

/// Row-major upper triangle of a square matrix.
pub(crate) fn upper_triangle(matrix: &DMatrix<f64>) -> Vec<f64> {
    let dim = matrix.nrows();
    (0..dim)
        .flat_map(|i| (i..dim).map(move |j| (i, j)))
        .map(|(i, j)| matrix[(i, j)])
        .collect()
}

/// Comment header shared by both writers.
pub(crate) fn write_header<W: Write>(writer: &mut W, graph: &PoseGraph, format: &str) -> Result<(), IoError> {
    writeln!(writer, "# {format} file written by pose-graph-slam")?;
    writeln!(
        writer,
        "# Timestamp: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )?;
    writeln!(
        writer,
        "# Nodes: {}, edges: {} ({} active)",
        graph.node_count(),
        graph.edge_count(),
        graph.active_edge_count()
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() -> Result<(), IoError> {
        assert_eq!(GraphFormat::from_path("data/intel.g2o")?, GraphFormat::G2o);
        assert_eq!(GraphFormat::from_path("run.GRAPH")?, GraphFormat::Native);
        assert!(matches!(
            GraphFormat::from_path("poses.csv"),
            Err(IoError::UnsupportedFormat(_))
        ));
        assert!(GraphFormat::from_path("noext").is_err());
        Ok(())
    }

    #[test]
    fn test_upper_triangle_round_trip() {
        let values = [1.0, 0.1, 0.2, 2.0, 0.3, 3.0];
        let matrix = symmetric_from_upper(&values, 3);
        assert_eq!(matrix[(2, 0)], 0.2);
        assert_eq!(matrix[(1, 2)], 0.3);
        assert_eq!(upper_triangle(&matrix), values.to_vec());
    }

    #[test]
    fn test_parse_records_skips_comments_and_keeps_line_numbers() -> Result<(), IoError> {
        let content = "# header\n\nA 1\n  \nA 2\n";
        let records = parse_records(content, |parts, line| {
            Ok(Some(parse_field::<usize>(parts, 1, line)?))
        })?;
        assert_eq!(records, vec![(3, 1), (5, 2)]);
        Ok(())
    }

    #[test]
    fn test_parse_field_errors() {
        let parts = ["EDGE", "x"];
        assert!(matches!(
            parse_field::<usize>(&parts, 1, 4),
            Err(IoError::InvalidNumber { line: 4, .. })
        ));
        assert!(matches!(
            parse_field::<usize>(&parts, 2, 4),
            Err(IoError::MissingFields { line: 4 })
        ));
    }

    #[test]
    fn test_parallel_parse_preserves_order() -> Result<(), IoError> {
        let content: String = (0..2500).map(|i| format!("N {i}\n")).collect();
        let records = parse_records(&content, |parts, line| {
            Ok(Some(parse_field::<usize>(parts, 1, line)?))
        })?;
        assert_eq!(records.len(), 2500);
        assert!(records.iter().enumerate().all(|(i, (_, id))| *id == i));
        Ok(())
    }
}
