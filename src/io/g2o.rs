//! g2o import and export for 2D graphs.
//!
//! ```text
//! VERTEX_SE2 id x y theta
//! VERTEX_XY id x y
//! EDGE_SE2 from to dx dy dtheta i11 i12 i13 i22 i23 i33
//! EDGE_SE2_XY pose landmark x y i11 i12 i22
//! FIX id
//! ```
//!
//! Vertex ids may be sparse and in any order. They are remapped to dense
//! [`NodeId`]s in ascending g2o id order. An `EDGE_SE2` from a pose to the
//! next pose in that order becomes an odometry edge, any other one a loop
//! closure.

use crate::graph::{EdgeKind, NodeId, NodeState, PoseGraph};
use crate::io::{
    GraphLoader, IoError, parse_field, parse_floats, parse_records, symmetric_from_upper,
    upper_triangle, write_header,
};
use crate::manifold::SE2;
use nalgebra::{DMatrix, DVector, Vector2};
use std::collections::BTreeMap;
use std::io::Write;
use tracing::warn;

/// One parsed g2o record.
#[derive(Debug, Clone)]
enum Record {
    Pose { id: usize, pose: SE2 },
    Point { id: usize, position: Vector2<f64> },
    Edge {
        from: usize,
        to: usize,
        measurement: DVector<f64>,
        information: DMatrix<f64>,
    },
    Fix { id: usize },
}

/// g2o file loader and writer
pub struct G2oLoader;

impl GraphLoader for G2oLoader {
    fn parse(content: &str) -> Result<PoseGraph, IoError> {
        let records = parse_records(content, Self::parse_line)?;

        // Vertices first, in ascending g2o id order
        let mut by_id: BTreeMap<usize, &Record> = BTreeMap::new();
        for (_, record) in &records {
            if let Record::Pose { id, .. } | Record::Point { id, .. } = record
                && by_id.insert(*id, record).is_some()
            {
                return Err(IoError::DuplicateVertex { id: *id }.log());
            }
        }
        let mut graph = PoseGraph::new();
        let mut remap = BTreeMap::new();
        // Position of each pose in vertex order, for odometry inference
        let mut pose_rank = BTreeMap::new();
        for (id, record) in by_id {
            let node = match record {
                Record::Pose { pose, .. } => {
                    let node = graph.add_pose_node(pose.clone());
                    pose_rank.insert(node, pose_rank.len());
                    node
                }
                Record::Point { position, .. } => graph.add_landmark_node(*position),
                _ => continue,
            };
            remap.insert(id, node);
        }

        let lookup = |id: usize, line: usize| -> Result<NodeId, IoError> {
            remap
                .get(&id)
                .copied()
                .ok_or_else(|| IoError::UnknownVertex { line, id }.log())
        };

        let mut fixed = None;
        for (line, record) in &records {
            match record {
                Record::Edge {
                    from,
                    to,
                    measurement,
                    information,
                } => {
                    let (from_node, to_node) = (lookup(*from, *line)?, lookup(*to, *line)?);
                    let kind = match (pose_rank.get(&from_node), pose_rank.get(&to_node)) {
                        (Some(a), Some(b)) if *b == a + 1 => EdgeKind::Odometry,
                        (Some(_), Some(_)) => EdgeKind::LoopClosure,
                        _ => EdgeKind::Observation,
                    };
                    graph
                        .add_edge(kind, from_node, to_node, measurement, information)
                        .map_err(|source| IoError::InvalidRecord { line: *line, source }.log())?;
                }
                Record::Fix { id } => {
                    let node = lookup(*id, *line)?;
                    if fixed.is_some() {
                        warn!("Ignoring additional FIX of vertex {} at line {}", id, line);
                    } else {
                        fixed = Some((*line, node));
                    }
                }
                _ => {}
            }
        }

        if let Some((line, node)) = fixed {
            graph
                .set_anchor(node)
                .map_err(|source| IoError::InvalidRecord { line, source }.log())?;
        }
        Ok(graph)
    }

    fn write_to<W: Write>(graph: &PoseGraph, writer: &mut W) -> Result<(), IoError> {
        write_header(writer, graph, "G2O")?;

        for node in graph.nodes() {
            match node.state() {
                NodeState::Pose(pose) => writeln!(
                    writer,
                    "VERTEX_SE2 {} {:.17e} {:.17e} {:.17e}",
                    node.id().index(),
                    pose.x(),
                    pose.y(),
                    pose.angle()
                )?,
                NodeState::Landmark(position) => writeln!(
                    writer,
                    "VERTEX_XY {} {:.17e} {:.17e}",
                    node.id().index(),
                    position.x,
                    position.y
                )?,
            }
        }
        if let Some(anchor) = graph.anchor() {
            writeln!(writer, "FIX {}", anchor.index())?;
        }

        for edge in graph.active_edges() {
            let tag = match edge.kind() {
                EdgeKind::Odometry | EdgeKind::LoopClosure => "EDGE_SE2",
                EdgeKind::Observation => "EDGE_SE2_XY",
            };
            write!(writer, "{} {} {}", tag, edge.from().index(), edge.to().index())?;
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

impl G2oLoader {
    fn parse_line(parts: &[&str], line: usize) -> Result<Option<Record>, IoError> {
        let record = match parts[0] {
            "VERTEX_SE2" => {
                let values = parse_floats(parts, 2, 3, line)?;
                Record::Pose {
                    id: parse_field(parts, 1, line)?,
                    pose: SE2::from_xy_angle(values[0], values[1], values[2]),
                }
            }
            "VERTEX_XY" => {
                let values = parse_floats(parts, 2, 2, line)?;
                Record::Point {
                    id: parse_field(parts, 1, line)?,
                    position: Vector2::new(values[0], values[1]),
                }
            }
            "EDGE_SE2" => Record::Edge {
                from: parse_field(parts, 1, line)?,
                to: parse_field(parts, 2, line)?,
                measurement: DVector::from_vec(parse_floats(parts, 3, 3, line)?),
                information: symmetric_from_upper(&parse_floats(parts, 6, 6, line)?, 3),
            },
            "EDGE_SE2_XY" => Record::Edge {
                from: parse_field(parts, 1, line)?,
                to: parse_field(parts, 2, line)?,
                measurement: DVector::from_vec(parse_floats(parts, 3, 2, line)?),
                information: symmetric_from_upper(&parse_floats(parts, 5, 3, line)?, 2),
            },
            "FIX" => Record::Fix {
                id: parse_field(parts, 1, line)?,
            },
            other => {
                warn!("Skipping unsupported g2o record {} at line {}", other, line);
                return Ok(None);
            }
        };
        Ok(Some(record))
    }
}
