//! Immutable undirected graph shared read-only by every worker.
//!
//! Adjacency is stored in CSR form: `neighbors(v)` is a sorted slice, so membership tests are
//! binary searches and set intersections are linear merges. The vertex id width is a type
//! parameter ([`NodeId`]): `u32` for ordinary inputs, `u64` for graphs that need it.

use rayon::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::hash::Hash;

use crate::error::GraphError;

// ============================================================================
// Vertex ids
// ============================================================================

/// Dense vertex identifier.
pub trait NodeId:
    Copy
    + Ord
    + Hash
    + Default
    + fmt::Debug
    + fmt::Display
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Width of the id type in bits.
    const BITS: u32;

    /// Converts a dense index into an id. The caller guarantees it fits.
    fn from_index(index: usize) -> Self;

    /// Converts a raw value into an id, if it fits.
    fn try_from_u64(value: u64) -> Option<Self>;

    /// Returns the dense index of this id.
    fn index(self) -> usize;

    /// Widens the id to `u64`.
    fn to_u64(self) -> u64;
}

macro_rules! impl_node_id {
    ($t:ty) => {
        impl NodeId for $t {
            const BITS: u32 = <$t>::BITS;

            #[inline(always)]
            fn from_index(index: usize) -> Self {
                debug_assert!(<$t>::try_from(index).is_ok(), "vertex index {index} overflows");
                index as $t
            }

            #[inline]
            fn try_from_u64(value: u64) -> Option<Self> {
                <$t>::try_from(value).ok()
            }

            #[inline(always)]
            fn index(self) -> usize {
                self as usize
            }

            #[inline(always)]
            fn to_u64(self) -> u64 {
                u64::from(self)
            }
        }
    };
}

impl_node_id!(u32);
impl_node_id!(u64);

// ============================================================================
// Graph
// ============================================================================

/// Undirected simple graph in compressed sparse row form.
#[derive(Clone, Debug)]
pub struct Graph<N: NodeId = u32> {
    /// `offsets[v]..offsets[v + 1]` indexes the neighbours of `v`.
    offsets: Vec<usize>,
    /// Concatenated, sorted neighbour lists.
    adjacency: Vec<N>,
}

impl<N: NodeId> Graph<N> {
    /// Builds a graph from an edge list. Self-loops are dropped and parallel edges collapsed.
    ///
    /// # Errors
    /// Returns an error if `n` does not fit the id type or an endpoint is `>= n`.
    pub fn from_edges(n: usize, edges: &[(u64, u64)]) -> Result<Self, GraphError> {
        let mut builder = GraphBuilder::new(n)?;
        for (line, &(u, v)) in edges.iter().enumerate() {
            builder.add_edge(u, v, line + 1)?;
        }
        Ok(builder.build())
    }

    /// Number of vertices.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Number of undirected edges.
    #[inline]
    pub fn edge_count(&self) -> usize {
        self.adjacency.len() / 2
    }

    /// Iterates over all vertex ids in increasing order.
    pub fn vertices(&self) -> impl Iterator<Item = N> + '_ {
        (0..self.vertex_count()).map(N::from_index)
    }

    /// Sorted neighbours of `v`.
    #[inline]
    pub fn neighbors(&self, v: N) -> &[N] {
        let i = v.index();
        &self.adjacency[self.offsets[i]..self.offsets[i + 1]]
    }

    /// Degree of `v`.
    #[inline]
    pub fn degree(&self, v: N) -> usize {
        let i = v.index();
        self.offsets[i + 1] - self.offsets[i]
    }

    /// Returns true iff `{u, v}` is an edge. Searches the shorter of the two lists.
    #[inline]
    pub fn are_adjacent(&self, u: N, v: N) -> bool {
        if self.degree(u) <= self.degree(v) {
            self.neighbors(u).binary_search(&v).is_ok()
        } else {
            self.neighbors(v).binary_search(&u).is_ok()
        }
    }

    /// Returns the vertices in a degeneracy order (smallest-last).
    ///
    /// Every vertex has at most `d` neighbours later in the order, where `d` is the degeneracy
    /// of the graph. Uses the bucket algorithm of Batagelj and Zaversnik, `O(n + m)`.
    pub fn degeneracy_order(&self) -> Vec<N> {
        let n = self.vertex_count();
        let mut degree: Vec<usize> = (0..n).map(|v| self.degree(N::from_index(v))).collect();
        let max_degree = degree.iter().copied().max().unwrap_or(0);

        // bin[d] = first position of degree-d vertices in `order`.
        let mut bin = vec![0usize; max_degree + 1];
        for &d in &degree {
            bin[d] += 1;
        }
        let mut start = 0;
        for slot in &mut bin {
            let count = *slot;
            *slot = start;
            start += count;
        }

        let mut position = vec![0usize; n];
        let mut order = vec![0usize; n];
        for v in 0..n {
            position[v] = bin[degree[v]];
            order[position[v]] = v;
            bin[degree[v]] += 1;
        }
        for d in (1..=max_degree).rev() {
            bin[d] = bin[d - 1];
        }
        bin[0] = 0;

        for i in 0..n {
            let v = order[i];
            for &u in self.neighbors(N::from_index(v)) {
                let u = u.index();
                if degree[u] > degree[v] {
                    let du = degree[u];
                    let pu = position[u];
                    let pw = bin[du];
                    let w = order[pw];
                    if u != w {
                        position[u] = pw;
                        order[pu] = w;
                        position[w] = pu;
                        order[pw] = u;
                    }
                    bin[du] += 1;
                    degree[u] -= 1;
                }
            }
        }

        order.into_iter().map(N::from_index).collect()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Incremental graph construction used by the loaders.
#[derive(Debug)]
pub struct GraphBuilder<N: NodeId> {
    lists: Vec<Vec<N>>,
}

impl<N: NodeId> GraphBuilder<N> {
    /// Creates a builder for `n` vertices.
    ///
    /// # Errors
    /// Returns [`GraphError::TooManyVertices`] if `n` ids do not fit `N`, and
    /// [`GraphError::Allocation`] if the lists cannot be allocated.
    pub fn new(n: usize) -> Result<Self, GraphError> {
        let fits = n == 0 || N::try_from_u64((n - 1) as u64).is_some();
        if !fits {
            return Err(GraphError::TooManyVertices { n, bits: N::BITS });
        }
        let mut lists = Vec::new();
        lists
            .try_reserve_exact(n)
            .map_err(|_| GraphError::Allocation { n })?;
        lists.resize_with(n, Vec::new);
        Ok(Self { lists })
    }

    /// Number of vertices the builder was created with.
    pub fn vertex_count(&self) -> usize {
        self.lists.len()
    }

    /// Adds the undirected edge `{u, v}`; `line` is reported in range errors.
    ///
    /// # Errors
    /// Returns [`GraphError::VertexOutOfRange`] if an endpoint is `>= n`.
    pub fn add_edge(&mut self, u: u64, v: u64, line: usize) -> Result<(), GraphError> {
        let a = self.checked(u, line)?;
        let b = self.checked(v, line)?;
        if a != b {
            self.lists[a.index()].push(b);
            self.lists[b.index()].push(a);
        }
        Ok(())
    }

    fn checked(&self, raw: u64, line: usize) -> Result<N, GraphError> {
        let n = self.lists.len();
        match usize::try_from(raw) {
            Ok(i) if i < n => Ok(N::from_index(i)),
            _ => Err(GraphError::VertexOutOfRange {
                line,
                vertex: raw,
                n,
            }),
        }
    }

    /// Sorts and deduplicates the adjacency lists and packs them into CSR form.
    pub fn build(mut self) -> Graph<N> {
        self.lists.par_iter_mut().for_each(|list| {
            list.sort_unstable();
            list.dedup();
        });

        let mut offsets = Vec::with_capacity(self.lists.len() + 1);
        offsets.push(0);
        let total: usize = self.lists.iter().map(Vec::len).sum();
        let mut adjacency = Vec::with_capacity(total);
        for list in &self.lists {
            adjacency.extend_from_slice(list);
            offsets.push(adjacency.len());
        }
        Graph { offsets, adjacency }
    }
}

// ============================================================================
// Sorted-set helpers
// ============================================================================

/// Intersection of two sorted slices, appended to `out`.
///
/// Gallops through the longer slice when the sizes are very different.
pub fn intersect_into<N: NodeId>(a: &[N], b: &[N], out: &mut Vec<N>) {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if small.len() * 16 < large.len() {
        out.extend(small.iter().copied().filter(|x| large.binary_search(x).is_ok()));
        return;
    }
    let (mut i, mut j) = (0, 0);
    while i < small.len() && j < large.len() {
        match small[i].cmp(&large[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(small[i]);
                i += 1;
                j += 1;
            }
        }
    }
}

/// Size of the intersection of two sorted slices.
pub fn intersection_count<N: NodeId>(a: &[N], b: &[N]) -> usize {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if small.len() * 16 < large.len() {
        return small.iter().filter(|x| large.binary_search(x).is_ok()).count();
    }
    let (mut i, mut j, mut count) = (0, 0, 0);
    while i < small.len() && j < large.len() {
        match small[i].cmp(&large[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                count += 1;
                i += 1;
                j += 1;
            }
        }
    }
    count
}

/// Inserts `v` into a sorted vector, keeping it sorted. No-op if already present.
#[inline]
pub fn sorted_insert<N: NodeId>(set: &mut Vec<N>, v: N) {
    if let Err(pos) = set.binary_search(&v) {
        set.insert(pos, v);
    }
}

/// Removes `v` from a sorted vector if present.
#[inline]
pub fn sorted_remove<N: NodeId>(set: &mut Vec<N>, v: N) {
    if let Ok(pos) = set.binary_search(&v) {
        set.remove(pos);
    }
}

// ============================================================================
// Tests
// ============================================================================
