//! Deterministic checks of emitted items against their defining properties.
//!
//! The predicates here are the ground truth: the k-plex system uses them at its leaves, and
//! `--validate` and the tests run them over whole result sets.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::graph::{Graph, NodeId};

// ============================================================================
// Cliques
// ============================================================================

/// Returns true iff every two members of `set` are adjacent.
pub fn is_clique<N: NodeId>(graph: &Graph<N>, set: &[N]) -> bool {
    set.iter()
        .enumerate()
        .all(|(i, &a)| set[i + 1..].iter().all(|&b| graph.are_adjacent(a, b)))
}

/// Returns true iff `set` is a clique that no vertex of `graph` extends.
pub fn is_maximal_clique<N: NodeId>(graph: &Graph<N>, set: &[N]) -> bool {
    if !is_clique(graph, set) {
        return false;
    }
    let Some(&first) = set.first() else {
        return graph.vertex_count() == 0;
    };
    !graph
        .neighbors(first)
        .iter()
        .filter(|u| !set.contains(u))
        .any(|&u| set.iter().all(|&m| graph.are_adjacent(u, m)))
}

// ============================================================================
// k-plexes
// ============================================================================

/// For each member, the number of other members it is not adjacent to.
pub fn missing_counts<N: NodeId>(graph: &Graph<N>, set: &[N]) -> Vec<usize> {
    set.iter()
        .map(|&a| {
            set.iter()
                .filter(|&&b| b != a && !graph.are_adjacent(a, b))
                .count()
        })
        .collect()
}

/// Returns true iff every member of `set` is non-adjacent to at most `k - 1` other members.
pub fn is_kplex<N: NodeId>(graph: &Graph<N>, set: &[N], k: usize) -> bool {
    missing_counts(graph, set).iter().all(|&m| m < k)
}

/// Returns true iff `set ∪ {u}` is still a k-plex, given the members' current `missing` counts.
///
/// `u` must not be a member of `set`.
#[inline]
pub fn extends_kplex<N: NodeId>(
    graph: &Graph<N>,
    u: N,
    set: &[N],
    missing: &[usize],
    k: usize,
) -> bool {
    let limit = k.saturating_sub(1);
    let mut non_adjacent = 0;
    for (&m, &miss) in set.iter().zip(missing) {
        if !graph.are_adjacent(u, m) {
            non_adjacent += 1;
            if non_adjacent > limit || miss + 1 > limit {
                return false;
            }
        }
    }
    true
}

/// Returns true iff every two members of `set` are adjacent or share a neighbour in `set`.
pub fn has_diameter_two<N: NodeId>(graph: &Graph<N>, set: &[N]) -> bool {
    set.iter().enumerate().all(|(i, &a)| {
        set[i + 1..].iter().all(|&b| {
            graph.are_adjacent(a, b)
                || set
                    .iter()
                    .any(|&c| graph.are_adjacent(a, c) && graph.are_adjacent(b, c))
        })
    })
}

/// Returns true iff the k-plex `set` cannot be extended by any vertex of `graph`.
///
/// A set smaller than `k` extends by any vertex, so it is maximal only if it is the whole
/// vertex set. Otherwise an extending vertex must be adjacent to some member.
pub fn is_maximal_kplex<N: NodeId>(graph: &Graph<N>, set: &[N], k: usize) -> bool {
    if set.len() < k {
        return set.len() == graph.vertex_count();
    }
    let missing = missing_counts(graph, set);
    let members: HashSet<N> = set.iter().copied().collect();
    let mut seen = HashSet::new();
    for &m in set {
        for &u in graph.neighbors(m) {
            if members.contains(&u) || !seen.insert(u) {
                continue;
            }
            if extends_kplex(graph, u, set, &missing, k) {
                return false;
            }
        }
    }
    true
}

/// The emission predicate of the diameter-2 k-plex system.
pub fn is_diam2_kplex_solution<N: NodeId>(graph: &Graph<N>, set: &[N], k: usize, q: usize) -> bool {
    set.len() >= q
        && is_kplex(graph, set, k)
        && has_diameter_two(graph, set)
        && is_maximal_kplex(graph, set, k)
}

// ============================================================================
// Result sets
// ============================================================================

/// Property every item of a result set must satisfy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemCheck {
    /// Maximal clique.
    MaximalClique,
    /// Maximal k-plex with diameter at most two and at least `q` vertices.
    Diam2Kplex {
        /// The k of the k-plex.
        k: usize,
        /// Minimum size.
        q: usize,
    },
}

/// Checks that every item is sorted, unique within the set, and satisfies `check`.
///
/// # Errors
/// Returns the first offending item.
pub fn validate_items<N: NodeId>(
    graph: &Graph<N>,
    items: &[Vec<N>],
    check: ItemCheck,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        let fail = |reason: &str| ValidationError {
            item: item.iter().map(|v| v.to_u64()).collect(),
            reason: reason.to_owned(),
        };
        if !item.windows(2).all(|w| w[0] < w[1]) {
            return Err(fail("vertices are not strictly increasing"));
        }
        if !seen.insert(item.as_slice()) {
            return Err(fail("reported more than once"));
        }
        let ok = match check {
            ItemCheck::MaximalClique => is_maximal_clique(graph, item),
            ItemCheck::Diam2Kplex { k, q } => is_diam2_kplex_solution(graph, item, k, q),
        };
        if !ok {
            let reason = match check {
                ItemCheck::MaximalClique => "not a maximal clique",
                ItemCheck::Diam2Kplex { .. } => "not a maximal diameter-2 k-plex of the required size",
            };
            return Err(fail(reason));
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
