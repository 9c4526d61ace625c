//! Native `.graph` format.
//!
//! ```text
//! POSE id x y cos sin fixed
//! LANDMARK id x y fixed
//! EDGE id KIND from to active measurement... information-upper-triangle...
//! ```
//!
//! `KIND` is one of `ODOMETRY`, `LOOP_CLOSURE`, `OBSERVATION`. `fixed` and
//! `active` are `0` or `1`. Node and edge ids must start at 0 and appear in
//! order, so they load back as the same [`NodeId`]s and [`EdgeId`]s.
//! Inactive edges are kept, which makes the format suitable for replaying a
//! session exactly.
//!
//! Poses store their rotation as the unit complex `(cos, sin)` and every value
//! is written with 17 significant digits, so node estimates load back
//! bit-for-bit. Between-edge measurements are stored as `(x, y, theta)`.

use crate::graph::{EdgeId, EdgeKind, NodeId, NodeState, PoseGraph};
use crate::io::{
    GraphLoader, IoError, parse_field, parse_floats, parse_records, symmetric_from_upper,
    upper_triangle, write_header,
};
use crate::manifold::SE2;
use nalgebra::{Complex, DMatrix, DVector, UnitComplex, Vector2};
use std::io::Write;

#[derive(Debug, Clone)]
enum Record {
    Pose {
        id: usize,
        pose: SE2,
        fixed: bool,
    },
    Landmark {
        id: usize,
        position: Vector2<f64>,
        fixed: bool,
    },
    Edge {
        id: usize,
        kind: EdgeKind,
        from: usize,
        to: usize,
        active: bool,
        measurement: DVector<f64>,
        information: DMatrix<f64>,
    },
}

fn parse_flag(parts: &[&str], index: usize, line: usize) -> Result<bool, IoError> {
    match parse_field::<u8>(parts, index, line)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(IoError::Parse {
            line,
            message: format!("flag must be 0 or 1, got {other}"),
        }
        .log()),
    }
}

/// Rotation from a stored `(cos, sin)` pair. Pairs that are unit to within
/// round-off are taken as is; others, e.g. from hand-edited files, are normalized.
fn parse_rotation(cos: f64, sin: f64, line: usize) -> Result<UnitComplex<f64>, IoError> {
    let norm_squared = cos * cos + sin * sin;
    if !norm_squared.is_finite() || norm_squared == 0.0 {
        return Err(IoError::Parse {
            line,
            message: format!("rotation ({cos}, {sin}) is not a direction"),
        }
        .log());
    }
    if (norm_squared - 1.0).abs() <= 4.0 * f64::EPSILON {
        Ok(UnitComplex::from_cos_sin_unchecked(cos, sin))
    } else {
        Ok(UnitComplex::new_normalize(Complex::new(cos, sin)))
    }
}

fn expect_next(line: usize, expected: usize, found: usize) -> Result<(), IoError> {
    if expected == found {
        Ok(())
    } else {
        Err(IoError::NonContiguousId {
            line,
            expected,
            found,
        }
        .log())
    }
}

/// Lossless graph file loader and writer
pub struct GraphFileLoader;

impl GraphLoader for GraphFileLoader {
    fn parse(content: &str) -> Result<PoseGraph, IoError> {
        let records = parse_records(content, Self::parse_line)?;

        let mut graph = PoseGraph::new();
        let mut anchor: Option<(usize, NodeId)> = None;
        for (line, record) in records {
            match record {
                Record::Pose { id, pose, fixed } => {
                    expect_next(line, graph.node_count(), id)?;
                    let node = graph.add_pose_node(pose);
                    if fixed {
                        Self::mark_anchor(&mut anchor, line, node)?;
                    }
                }
                Record::Landmark {
                    id,
                    position,
                    fixed,
                } => {
                    expect_next(line, graph.node_count(), id)?;
                    let node = graph.add_landmark_node(position);
                    if fixed {
                        Self::mark_anchor(&mut anchor, line, node)?;
                    }
                }
                Record::Edge {
                    id,
                    kind,
                    from,
                    to,
                    active,
                    measurement,
                    information,
                } => {
                    expect_next(line, graph.edge_count(), id)?;
                    let inserted = graph
                        .insert_edge_with_flag(
                            kind,
                            NodeId(from),
                            NodeId(to),
                            &measurement,
                            &information,
                            active,
                        )
                        .map_err(|source| IoError::InvalidRecord { line, source }.log())?;
                    debug_assert_eq!(inserted, EdgeId(id));
                }
            }
        }

        if let Some((line, node)) = anchor {
            graph
                .set_anchor(node)
                .map_err(|source| IoError::InvalidRecord { line, source }.log())?;
        }
        Ok(graph)
    }

    fn write_to<W: Write>(graph: &PoseGraph, writer: &mut W) -> Result<(), IoError> {
        write_header(writer, graph, "Graph")?;

        for node in graph.nodes() {
            let fixed = u8::from(graph.anchor() == Some(node.id()));
            match node.state() {
                NodeState::Pose(pose) => {
                    let rotation = pose.rotation();
                    writeln!(
                        writer,
                        "POSE {} {:.17e} {:.17e} {:.17e} {:.17e} {}",
                        node.id().index(),
                        pose.x(),
                        pose.y(),
                        rotation.cos_angle(),
                        rotation.sin_angle(),
                        fixed
                    )?
                }
                NodeState::Landmark(position) => writeln!(
                    writer,
                    "LANDMARK {} {:.17e} {:.17e} {}",
                    node.id().index(),
                    position.x,
                    position.y,
                    fixed
                )?,
            }
        }

        for edge in graph.edges() {
            write!(
                writer,
                "EDGE {} {} {} {} {}",
                edge.id().index(),
                edge.kind().tag(),
                edge.from().index(),
                edge.to().index(),
                u8::from(edge.is_active())
            )?;
            for value in edge.measurement().iter() {
                write!(writer, " {:.17e}", value)?;
            }
            for value in upper_triangle(edge.information()) {
                write!(writer, " {:.17e}", value)?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }
}

impl GraphFileLoader {
    fn mark_anchor(anchor: &mut Option<(usize, NodeId)>, line: usize, node: NodeId) -> Result<(), IoError> {
        if let Some((first, _)) = anchor {
            return Err(IoError::Parse {
                line,
                message: format!("second fixed node, first one at line {first}"),
            }
            .log());
        }
        *anchor = Some((line, node));
        Ok(())
    }

    fn parse_line(parts: &[&str], line: usize) -> Result<Option<Record>, IoError> {
        let record = match parts[0] {
            "POSE" => {
                let values = parse_floats(parts, 2, 4, line)?;
                let rotation = parse_rotation(values[2], values[3], line)?;
                Record::Pose {
                    id: parse_field(parts, 1, line)?,
                    pose: SE2::new(Vector2::new(values[0], values[1]), rotation),
                    fixed: parse_flag(parts, 6, line)?,
                }
            }
            "LANDMARK" => {
                let values = parse_floats(parts, 2, 2, line)?;
                Record::Landmark {
                    id: parse_field(parts, 1, line)?,
                    position: Vector2::new(values[0], values[1]),
                    fixed: parse_flag(parts, 4, line)?,
                }
            }
            "EDGE" => {
                let tag = parts.get(2).ok_or(IoError::MissingFields { line })?;
                let kind = EdgeKind::from_tag(tag).ok_or_else(|| {
                    IoError::Parse {
                        line,
                        message: format!("unknown edge kind {tag}"),
                    }
                    .log()
                })?;
                let dim = kind.measurement_dim();
                let triangle = dim * (dim + 1) / 2;
                let expected_fields = 6 + dim + triangle;
                if parts.len() != expected_fields {
                    return Err(IoError::Parse {
                        line,
                        message: format!(
                            "{tag} edge needs {expected_fields} fields, found {}",
                            parts.len()
                        ),
                    }
                    .log());
                }
                Record::Edge {
                    id: parse_field(parts, 1, line)?,
                    kind,
                    from: parse_field(parts, 3, line)?,
                    to: parse_field(parts, 4, line)?,
                    active: parse_flag(parts, 5, line)?,
                    measurement: DVector::from_vec(parse_floats(parts, 6, dim, line)?),
                    information: symmetric_from_upper(
                        &parse_floats(parts, 6 + dim, triangle, line)?,
                        dim,
                    ),
                }
            }
            other => {
                return Err(IoError::Parse {
                    line,
                    message: format!("unknown record {other}"),
                }
                .log());
            }
        };
        Ok(Some(record))
    }
}
