//! Maximal diameter-2 k-plex enumeration.
//!
//! A k-plex is a vertex set in which every member is non-adjacent to at most `k - 1` other
//! members. The system emits every maximal k-plex of the graph that has diameter at most two
//! inside itself and at least `q` vertices.
//!
//! Roots follow the degeneracy ordering. Root `v` searches the sets whose earliest vertex is `v`;
//! since such a set has diameter two, its other members are later vertices within distance two of
//! `v` through later intermediates. Below a root the search is binary: include a candidate or
//! exclude it. Candidates that can no longer join are filtered out, excluded vertices that could
//! still join are kept to reject non-maximal leaves early, and branches that cannot reach `q`
//! vertices are cut.
//!
//! With pivoting enabled the search branches on the most constrained candidate and, when the
//! current set plus all candidates is already a k-plex, jumps straight to that set.

use serde::{Deserialize, Serialize};

use crate::enumerable::{EnumerableSystem, Expansion};
use crate::error::ExpandError;
use crate::graph::{Graph, NodeId, sorted_insert, sorted_remove};
use crate::validate::{extends_kplex, has_diameter_two, is_maximal_kplex};

/// A search state of the k-plex system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct KplexNode<N: NodeId> {
    /// Members in insertion order.
    members: Vec<N>,
    /// `missing[i]`: members not adjacent to `members[i]`.
    missing: Vec<usize>,
    /// Vertices that may still join, sorted.
    candidates: Vec<N>,
    /// Vertices that could join but whose branches were explored elsewhere, sorted.
    excluded: Vec<N>,
}

impl<N: NodeId> KplexNode<N> {
    /// Members in insertion order.
    pub fn members(&self) -> &[N] {
        &self.members
    }

    /// Remaining candidates.
    pub fn candidates(&self) -> &[N] {
        &self.candidates
    }
}

/// Maximal k-plexes of diameter at most two.
#[derive(Debug)]
pub struct Diam2KplexEnumeration<'g, N: NodeId> {
    graph: &'g Graph<N>,
    k: usize,
    q: usize,
    pivoting: bool,
    order: Vec<N>,
    position: Vec<usize>,
}

impl<'g, N: NodeId> Diam2KplexEnumeration<'g, N> {
    /// Prepares the system. `k` and `q` are clamped to at least 1.
    pub fn new(graph: &'g Graph<N>, k: usize, q: usize, pivoting: bool) -> Self {
        let order = graph.degeneracy_order();
        let mut position = vec![0; order.len()];
        for (i, v) in order.iter().enumerate() {
            position[v.index()] = i;
        }
        Self {
            graph,
            k: k.max(1),
            q: q.max(1),
            pivoting,
            order,
            position,
        }
    }

    /// The k of the k-plexes.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Minimum emitted size.
    pub fn q(&self) -> usize {
        self.q
    }

    /// Later vertices within distance two of `order[index]` through later intermediates.
    fn region(&self, index: usize, v: N) -> Vec<N> {
        let later = |u: N| self.position[u.index()] > index;
        let mut region: Vec<N> = Vec::new();
        for &w in self.graph.neighbors(v) {
            if !later(w) {
                continue;
            }
            region.push(w);
            region.extend(
                self.graph
                    .neighbors(w)
                    .iter()
                    .copied()
                    .filter(|&u| u != v && later(u)),
            );
        }
        region.sort_unstable();
        region.dedup();
        region
    }

    fn fits(&self, u: N, members: &[N], missing: &[usize]) -> bool {
        extends_kplex(self.graph, u, members, missing, self.k)
    }

    /// Adds `w` to the member list, updating every missing count.
    fn with_member(&self, node: &KplexNode<N>, w: N) -> (Vec<N>, Vec<usize>) {
        let mut members = node.members.clone();
        let mut missing = node.missing.clone();
        let mut own = 0;
        for (m, miss) in members.iter().zip(missing.iter_mut()) {
            if !self.graph.are_adjacent(*m, w) {
                *miss += 1;
                own += 1;
            }
        }
        members.push(w);
        missing.push(own);
        (members, missing)
    }

    /// Leaf check: the member set is a solution.
    fn is_solution(&self, members: &[N]) -> bool {
        members.len() >= self.q
            && has_diameter_two(self.graph, members)
            && is_maximal_kplex(self.graph, members, self.k)
    }

    /// Non-adjacency counts inside `members ∪ candidates`, members first.
    fn union_missing(&self, node: &KplexNode<N>) -> Vec<usize> {
        let mut counts = Vec::with_capacity(node.members.len() + node.candidates.len());
        for (&m, &miss) in node.members.iter().zip(&node.missing) {
            let extra = node
                .candidates
                .iter()
                .filter(|&&p| !self.graph.are_adjacent(m, p))
                .count();
            counts.push(miss + extra);
        }
        for &p in &node.candidates {
            let outside = node
                .members
                .iter()
                .chain(&node.candidates)
                .filter(|&&x| x != p && !self.graph.are_adjacent(p, x))
                .count();
            counts.push(outside);
        }
        counts
    }

    fn push_include(
        &self,
        node: &KplexNode<N>,
        w: N,
        out: &mut Expansion<KplexNode<N>, Vec<N>>,
    ) {
        let (members, missing) = self.with_member(node, w);
        let candidates: Vec<N> = node
            .candidates
            .iter()
            .copied()
            .filter(|&u| u != w && self.fits(u, &members, &missing))
            .collect();
        if members.len() + candidates.len() < self.q {
            return;
        }
        let excluded = node
            .excluded
            .iter()
            .copied()
            .filter(|&u| self.fits(u, &members, &missing))
            .collect();
        out.push_child(KplexNode {
            members,
            missing,
            candidates,
            excluded,
        });
    }

    fn push_exclude(
        &self,
        node: KplexNode<N>,
        w: N,
        out: &mut Expansion<KplexNode<N>, Vec<N>>,
    ) {
        if node.members.len() + node.candidates.len() - 1 < self.q {
            return;
        }
        let KplexNode {
            members,
            missing,
            mut candidates,
            mut excluded,
        } = node;
        sorted_remove(&mut candidates, w);
        sorted_insert(&mut excluded, w);
        out.push_child(KplexNode {
            members,
            missing,
            candidates,
            excluded,
        });
    }
}

impl<N: NodeId> EnumerableSystem for Diam2KplexEnumeration<'_, N> {
    type Node = KplexNode<N>;
    type Item = Vec<N>;

    fn name(&self) -> &'static str {
        "d2kplex"
    }

    fn root_count(&self) -> usize {
        self.order.len()
    }

    fn root(&self, index: usize) -> Option<Self::Node> {
        let v = *self.order.get(index)?;
        let members = vec![v];
        let missing = vec![0];
        let candidates: Vec<N> = self
            .region(index, v)
            .into_iter()
            .filter(|&u| self.fits(u, &members, &missing))
            .collect();
        if 1 + candidates.len() < self.q {
            return None;
        }
        let excluded = self
            .graph
            .neighbors(v)
            .iter()
            .copied()
            .filter(|u| self.position[u.index()] < index)
            .collect();
        Some(KplexNode {
            members,
            missing,
            candidates,
            excluded,
        })
    }

    fn expand(
        &self,
        node: Self::Node,
        out: &mut Expansion<Self::Node, Self::Item>,
    ) -> Result<(), ExpandError> {
        if node.candidates.is_empty() {
            if node.excluded.is_empty() && self.is_solution(&node.members) {
                let mut item = node.members;
                item.sort_unstable();
                out.emit(item);
            }
            return Ok(());
        }

        let branch = if self.pivoting {
            let counts = self.union_missing(&node);
            if counts.iter().all(|&c| c < self.k) {
                // Members plus candidates already form a k-plex: only that set can be maximal.
                let (member_counts, candidate_counts) = counts.split_at(node.members.len());
                let mut members = node.members.clone();
                members.extend_from_slice(&node.candidates);
                let mut missing = member_counts.to_vec();
                missing.extend_from_slice(candidate_counts);
                let excluded = node
                    .excluded
                    .iter()
                    .copied()
                    .filter(|&u| self.fits(u, &members, &missing))
                    .collect();
                out.push_child(KplexNode {
                    members,
                    missing,
                    candidates: Vec::new(),
                    excluded,
                });
                return Ok(());
            }
            let offset = node.members.len();
            let mut best = 0;
            for i in 1..node.candidates.len() {
                if counts[offset + i] > counts[offset + best] {
                    best = i;
                }
            }
            node.candidates[best]
        } else {
            node.candidates[0]
        };

        self.push_include(&node, branch, out);
        self.push_exclude(node, branch, out);
        Ok(())
    }
}
