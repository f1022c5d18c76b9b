//! Shared helpers: seeded random graphs and brute-force oracles.

#![allow(dead_code)]

use std::io::Write;

use parenum::graph::Graph;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

/// Erdős–Rényi graph `G(n, p)` as an edge list.
pub fn random_edges(n: usize, p: f64, seed: u64) -> Vec<(u64, u64)> {
    let mut rng = XorShiftRng::seed_from_u64(seed);
    let mut edges = Vec::new();
    for u in 0..n as u64 {
        for v in u + 1..n as u64 {
            if rng.random_bool(p) {
                edges.push((u, v));
            }
        }
    }
    edges
}

pub fn random_graph(n: usize, p: f64, seed: u64) -> Graph<u32> {
    Graph::from_edges(n, &random_edges(n, p, seed)).unwrap()
}

/// Writes `edges` in `oly` form to a temporary file.
pub fn oly_file(n: usize, edges: &[(u64, u64)]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "{} {}", n, edges.len()).unwrap();
    for (u, v) in edges {
        writeln!(file, "{u} {v}").unwrap();
    }
    file.flush().unwrap();
    file
}

/// Adjacency bitmasks for graphs of at most 16 vertices.
fn masks(n: usize, edges: &[(u64, u64)]) -> Vec<u32> {
    assert!(n <= 16);
    let mut adj = vec![0u32; n];
    for &(u, v) in edges {
        adj[u as usize] |= 1 << v;
        adj[v as usize] |= 1 << u;
    }
    adj
}

fn members(set: u32) -> Vec<u32> {
    (0..32).filter(|&i| set & (1 << i) != 0).collect()
}

fn is_kplex(adj: &[u32], set: u32, k: usize) -> bool {
    members(set)
        .into_iter()
        .all(|v| ((set & !adj[v as usize]) & !(1 << v)).count_ones() as usize <= k - 1)
}

fn diameter_at_most_two(adj: &[u32], set: u32) -> bool {
    let vs = members(set);
    vs.iter().all(|&a| {
        vs.iter().all(|&b| {
            a == b
                || adj[a as usize] & (1 << b) != 0
                || adj[a as usize] & adj[b as usize] & set != 0
        })
    })
}

/// Every maximal clique, each sorted, the list sorted.
pub fn brute_force_cliques(n: usize, edges: &[(u64, u64)]) -> Vec<Vec<u32>> {
    brute_force_kplexes(n, edges, 1, 1)
}

/// Every maximal k-plex with diameter at most two inside and at least `q` vertices.
pub fn brute_force_kplexes(n: usize, edges: &[(u64, u64)], k: usize, q: usize) -> Vec<Vec<u32>> {
    let adj = masks(n, edges);
    let mut found = Vec::new();
    for set in 1u32..(1 << n) {
        if (set.count_ones() as usize) < q || !is_kplex(&adj, set, k) {
            continue;
        }
        let extendable = (0..n).any(|v| set & (1 << v) == 0 && is_kplex(&adj, set | (1 << v), k));
        if !extendable && diameter_at_most_two(&adj, set) {
            found.push(members(set));
        }
    }
    found.sort();
    found
}
