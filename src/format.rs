//! Graph file formats.
//!
//! - `nde`: first line `n`; then `n` lines `vertex degree`; then one edge `u v` per line until
//!   end of file. Degrees are read for validation of the vertex id only.
//! - `oly`: first line `n m`; then `m` lines `u v`. Ids may be one-based (`--one-based`).
//!
//! Blank lines and lines starting with `#` or `%` are ignored in both formats.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use clap::ValueEnum;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::{Graph, GraphBuilder, NodeId};

/// Supported on-disk graph formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    /// Vertex count, per-vertex degree lines, then edges.
    #[default]
    Nde,
    /// `n m` header followed by exactly `m` edges.
    Oly,
}

/// Loads a graph from `path`.
///
/// `one_based` only affects the `oly` format.
///
/// # Errors
/// Returns an error if the file cannot be opened or read, or is malformed.
pub fn load_graph<N: NodeId>(
    path: impl AsRef<Path>,
    format: GraphFormat,
    one_based: bool,
) -> Result<Graph<N>, GraphError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| GraphError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let graph = read_graph(BufReader::new(file), format, one_based)?;
    debug!(
        path = %path.display(),
        vertices = graph.vertex_count(),
        edges = graph.edge_count(),
        "graph loaded"
    );
    Ok(graph)
}

/// Reads a graph from any buffered reader.
///
/// # Errors
/// Returns an error if reading fails or the input is malformed.
pub fn read_graph<N: NodeId, R: BufRead>(
    reader: R,
    format: GraphFormat,
    one_based: bool,
) -> Result<Graph<N>, GraphError> {
    let mut lines = DataLines::new(reader);
    match format {
        GraphFormat::Nde => read_nde(&mut lines),
        GraphFormat::Oly => read_oly(&mut lines, one_based),
    }
}

/// Vertices an `oly` file may declare beyond the endpoints its edges can touch.
const MAX_ISOLATED_VERTICES: u64 = 1 << 26;

fn read_nde<N: NodeId, R: BufRead>(lines: &mut DataLines<R>) -> Result<Graph<N>, GraphError> {
    let (line, header) = lines.expect_next("vertex count")?;
    let [n] = parse_fields::<1>(line, &header)?;
    let n = to_count(line, n)?;

    // The degree lines vouch for n before anything is allocated.
    for _ in 0..n {
        let (line, text) = lines.expect_next("degree line")?;
        let [vertex, _degree] = parse_fields::<2>(line, &text)?;
        if usize::try_from(vertex).map_or(true, |v| v >= n) {
            return Err(GraphError::VertexOutOfRange { line, vertex, n });
        }
    }
    let mut builder = GraphBuilder::<N>::new(n)?;

    while let Some((line, text)) = lines.next_line()? {
        let [u, v] = parse_fields::<2>(line, &text)?;
        builder.add_edge(u, v, line)?;
    }
    Ok(builder.build())
}

fn read_oly<N: NodeId, R: BufRead>(
    lines: &mut DataLines<R>,
    one_based: bool,
) -> Result<Graph<N>, GraphError> {
    let (header_line, header) = lines.expect_next("`n m` header")?;
    let [declared, m] = parse_fields::<2>(header_line, &header)?;
    let n = to_count(header_line, declared)?;

    let mut edges = Vec::new();
    for read in 0..m {
        let Some((line, text)) = lines.next_line()? else {
            return Err(GraphError::Parse {
                line: lines.last_line(),
                message: format!("expected {m} edges, found {read}"),
            });
        };
        let [u, v] = parse_fields::<2>(line, &text)?;
        let (u, v) = if one_based {
            (shift_one_based(line, u, n)?, shift_one_based(line, v, n)?)
        } else {
            (u, v)
        };
        edges.push((u, v, line));
    }

    if declared > m.saturating_mul(2).saturating_add(MAX_ISOLATED_VERTICES) {
        return Err(GraphError::Parse {
            line: header_line,
            message: format!(
                "{declared} vertices declared for {m} edges, more than {MAX_ISOLATED_VERTICES} would be isolated"
            ),
        });
    }
    let mut builder = GraphBuilder::<N>::new(n)?;
    for (u, v, line) in edges {
        builder.add_edge(u, v, line)?;
    }
    Ok(builder.build())
}

fn shift_one_based(line: usize, raw: u64, n: usize) -> Result<u64, GraphError> {
    raw.checked_sub(1)
        .ok_or(GraphError::VertexOutOfRange { line, vertex: raw, n })
}

fn to_count(line: usize, raw: u64) -> Result<usize, GraphError> {
    usize::try_from(raw).map_err(|_| GraphError::Parse {
        line,
        message: format!("vertex count {raw} does not fit this platform"),
    })
}

/// Parses exactly `K` unsigned integers separated by whitespace.
fn parse_fields<const K: usize>(line: usize, text: &str) -> Result<[u64; K], GraphError> {
    let mut out = [0u64; K];
    let mut fields = text.split_whitespace();
    for slot in &mut out {
        let field = fields.next().ok_or_else(|| GraphError::Parse {
            line,
            message: format!("expected {K} fields, found fewer in {text:?}"),
        })?;
        *slot = field.parse().map_err(|_| GraphError::Parse {
            line,
            message: format!("{field:?} is not a non-negative integer"),
        })?;
    }
    if fields.next().is_some() {
        return Err(GraphError::Parse {
            line,
            message: format!("expected {K} fields, found more in {text:?}"),
        });
    }
    Ok(out)
}

// ============================================================================
// Line reader
// ============================================================================

/// Yields non-blank, non-comment lines together with their 1-based line number.
struct DataLines<R> {
    inner: std::io::Lines<R>,
    line: usize,
}

impl<R: BufRead> DataLines<R> {
    fn new(reader: R) -> Self {
        Self {
            inner: reader.lines(),
            line: 0,
        }
    }

    fn last_line(&self) -> usize {
        self.line
    }

    fn next_line(&mut self) -> Result<Option<(usize, String)>, GraphError> {
        for text in self.inner.by_ref() {
            let text = text?;
            self.line += 1;
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('%') {
                continue;
            }
            return Ok(Some((self.line, trimmed.to_owned())));
        }
        Ok(None)
    }

    fn expect_next(&mut self, what: &str) -> Result<(usize, String), GraphError> {
        self.next_line()?.ok_or_else(|| GraphError::Parse {
            line: self.line,
            message: format!("unexpected end of input, expected {what}"),
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    fn read<N: NodeId>(text: &str, format: GraphFormat, one_based: bool) -> Result<Graph<N>, GraphError> {
        read_graph(Cursor::new(text), format, one_based)
    }

    #[test]
    fn nde_triangle() {
        let text = "3\n0 2\n1 2\n2 2\n0 1\n1 2\n0 2\n";
        let g: Graph<u32> = read(text, GraphFormat::Nde, false).unwrap();
        assert_eq!(g.vertex_count(), 3);
        assert_eq!(g.edge_count(), 3);
        assert!(g.are_adjacent(0, 2));
    }

    #[test]
    fn nde_skips_comments_and_blank_lines() {
        let text = "# a path\n3\n\n0 1\n1 2\n2 1\n% edges\n0 1\n1 2\n";
        let g: Graph<u64> = read(text, GraphFormat::Nde, false).unwrap();
        assert_eq!(g.edge_count(), 2);
        assert!(!g.are_adjacent(0, 2));
    }

    #[test]
    fn nde_rejects_missing_degree_lines() {
        let err = read::<u32>("3\n0 1\n", GraphFormat::Nde, false).unwrap_err();
        assert!(matches!(err, GraphError::Parse { .. }), "{err}");
    }

    #[test]
    fn nde_rejects_out_of_range_edge() {
        let err = read::<u32>("2\n0 1\n1 1\n0 5\n", GraphFormat::Nde, false).unwrap_err();
        assert!(matches!(err, GraphError::VertexOutOfRange { line: 4, vertex: 5, n: 2 }));
    }

    #[test]
    fn nde_rejects_garbage() {
        let err = read::<u32>("2\n0 1\n1 x\n", GraphFormat::Nde, false).unwrap_err();
        assert!(matches!(err, GraphError::Parse { line: 3, .. }));
    }

    #[test]
    fn oly_zero_based() {
        let g: Graph<u32> = read("3 2\n0 1\n1 2\n", GraphFormat::Oly, false).unwrap();
        assert_eq!(g.edge_count(), 2);
        assert!(g.are_adjacent(1, 2));
    }

    #[test]
    fn oly_one_based_shifts_ids() {
        let g: Graph<u32> = read("3 2\n1 2\n2 3\n", GraphFormat::Oly, true).unwrap();
        assert!(g.are_adjacent(0, 1));
        assert!(g.are_adjacent(1, 2));
        assert!(!g.are_adjacent(0, 2));
    }

    #[test]
    fn oly_one_based_rejects_zero() {
        let err = read::<u32>("2 1\n0 1\n", GraphFormat::Oly, true).unwrap_err();
        assert!(matches!(err, GraphError::VertexOutOfRange { vertex: 0, .. }));
    }

    #[test]
    fn oly_reports_short_edge_list() {
        let err = read::<u32>("3 3\n0 1\n", GraphFormat::Oly, false).unwrap_err();
        match err {
            GraphError::Parse { message, .. } => assert!(message.contains("expected 3 edges")),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn header_with_extra_fields_is_rejected() {
        let err = read::<u32>("3 2 1\n", GraphFormat::Oly, false).unwrap_err();
        assert!(matches!(err, GraphError::Parse { line: 1, .. }));
    }

    #[test]
    fn nde_vertex_count_needs_its_degree_lines() {
        let err = read::<u64>("4000000000\n0 0\n", GraphFormat::Nde, false).unwrap_err();
        match err {
            GraphError::Parse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("degree line"), "{message}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn oly_rejects_a_vertex_count_its_edges_cannot_justify() {
        let err = read::<u64>("4000000000 0\n", GraphFormat::Oly, false).unwrap_err();
        match err {
            GraphError::Parse { line, message } => {
                assert_eq!(line, 1);
                assert!(message.contains("isolated"), "{message}");
            }
            other => panic!("unexpected error {other}"),
        }
        let err = read::<u32>("# huge\n5000000000 1\n0 1\n", GraphFormat::Oly, false).unwrap_err();
        assert!(matches!(err, GraphError::Parse { line: 2, .. }), "{err}");
    }

    #[test]
    fn oly_keeps_isolated_vertices() {
        let g: Graph<u32> = read("10 1\n0 1\n", GraphFormat::Oly, false).unwrap();
        assert_eq!(g.vertex_count(), 10);
        assert_eq!(g.edge_count(), 1);
    }

    #[test]
    fn load_graph_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "4 3\n0 1\n1 2\n2 3\n").unwrap();
        let g: Graph<u32> = load_graph(file.path(), GraphFormat::Oly, false).unwrap();
        assert_eq!(g.vertex_count(), 4);
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn load_graph_missing_file() {
        let err = load_graph::<u32>("/definitely/not/here.nde", GraphFormat::Nde, false).unwrap_err();
        assert!(matches!(err, GraphError::Open { .. }));
    }
}
