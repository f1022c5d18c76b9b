//! Maximal clique enumeration.
//!
//! Bron–Kerbosch with Tomita pivoting, rooted on a degeneracy ordering (Eppstein, Löffler and
//! Strash): root `v` searches the cliques whose earliest vertex in the ordering is `v`, with the
//! later neighbours of `v` as candidates and the earlier ones as the exclusion set. Each maximal
//! clique is therefore reached from exactly one root and one branch.

use serde::{Deserialize, Serialize};

use crate::enumerable::{EnumerableSystem, Expansion};
use crate::error::ExpandError;
use crate::graph::{Graph, NodeId, intersect_into, intersection_count, sorted_insert, sorted_remove};

/// A Bron–Kerbosch search state `(R, P, X)`. All three sets are sorted by id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct CliqueNode<N: NodeId> {
    /// The clique built so far.
    pub clique: Vec<N>,
    /// Vertices adjacent to all of `clique` that may still be added.
    pub candidates: Vec<N>,
    /// Vertices adjacent to all of `clique` whose branches were already explored.
    pub excluded: Vec<N>,
}

/// Maximal cliques of a graph.
#[derive(Debug)]
pub struct CliqueEnumeration<'g, N: NodeId> {
    graph: &'g Graph<N>,
    order: Vec<N>,
    position: Vec<usize>,
}

impl<'g, N: NodeId> CliqueEnumeration<'g, N> {
    /// Prepares the degeneracy ordering of `graph`.
    pub fn new(graph: &'g Graph<N>) -> Self {
        let order = graph.degeneracy_order();
        let mut position = vec![0; order.len()];
        for (i, v) in order.iter().enumerate() {
            position[v.index()] = i;
        }
        Self {
            graph,
            order,
            position,
        }
    }

    /// The graph being enumerated.
    pub fn graph(&self) -> &'g Graph<N> {
        self.graph
    }

    /// Vertex in `candidates ∪ excluded` with the most neighbours in `candidates`.
    fn pivot(&self, node: &CliqueNode<N>) -> Option<N> {
        node.candidates
            .iter()
            .chain(&node.excluded)
            .copied()
            .max_by_key(|&u| intersection_count(&node.candidates, self.graph.neighbors(u)))
    }
}

impl<N: NodeId> EnumerableSystem for CliqueEnumeration<'_, N> {
    type Node = CliqueNode<N>;
    type Item = Vec<N>;

    fn name(&self) -> &'static str {
        "clique"
    }

    fn root_count(&self) -> usize {
        self.order.len()
    }

    fn root(&self, index: usize) -> Option<Self::Node> {
        let v = *self.order.get(index)?;
        let (mut candidates, mut excluded) = (Vec::new(), Vec::new());
        for &u in self.graph.neighbors(v) {
            if self.position[u.index()] > index {
                candidates.push(u);
            } else {
                excluded.push(u);
            }
        }
        Some(CliqueNode {
            clique: vec![v],
            candidates,
            excluded,
        })
    }

    fn expand(
        &self,
        node: Self::Node,
        out: &mut Expansion<Self::Node, Self::Item>,
    ) -> Result<(), ExpandError> {
        let Some(pivot) = self.pivot(&node) else {
            // P and X both empty: R is maximal.
            out.emit(node.clique);
            return Ok(());
        };
        if node.candidates.is_empty() {
            return Ok(());
        }

        let pivot_neighbors = self.graph.neighbors(pivot);
        let branches: Vec<N> = node
            .candidates
            .iter()
            .copied()
            .filter(|v| pivot_neighbors.binary_search(v).is_err())
            .collect();

        let CliqueNode {
            clique,
            mut candidates,
            mut excluded,
        } = node;
        for v in branches {
            let neighbors = self.graph.neighbors(v);
            let mut child_clique = clique.clone();
            sorted_insert(&mut child_clique, v);
            let mut child_candidates = Vec::new();
            intersect_into(&candidates, neighbors, &mut child_candidates);
            let mut child_excluded = Vec::new();
            intersect_into(&excluded, neighbors, &mut child_excluded);
            out.push_child(CliqueNode {
                clique: child_clique,
                candidates: child_candidates,
                excluded: child_excluded,
            });
            sorted_remove(&mut candidates, v);
            sorted_insert(&mut excluded, v);
        }
        Ok(())
    }
}
