//! End-to-end scenarios through the library API.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};

use parenum::config::{EnumeratorKind, RunConfig, SystemKind};
use parenum::format::GraphFormat;
use parenum::prelude::*;

fn enumerators() -> Vec<EnumeratorKind> {
    let mut all = vec![EnumeratorKind::Sequential, EnumeratorKind::Parallel];
    if cfg!(feature = "distributed") {
        all.push(EnumeratorKind::Distributed);
    }
    all
}

fn run_file(file: &tempfile::NamedTempFile, system: SystemKind, k: usize, enumerator: EnumeratorKind) -> Vec<Vec<u64>> {
    let cfg = RunConfig {
        graph_path: file.path().to_path_buf(),
        graph_format: GraphFormat::Oly,
        system,
        k,
        enumerator,
        threads: 2,
        retain_items: true,
        validate: true,
        ..RunConfig::default()
    };
    let mut items = run_enumeration(&cfg).unwrap().items.unwrap();
    items.sort();
    items
}

#[test]
fn triangle_is_one_clique() {
    let file = common::oly_file(3, &[(0, 1), (1, 2), (0, 2)]);
    for enumerator in enumerators() {
        assert_eq!(run_file(&file, SystemKind::Clique, 2, enumerator), vec![vec![0, 1, 2]]);
    }
}

#[test]
fn path_gives_its_edges() {
    let file = common::oly_file(3, &[(0, 1), (1, 2)]);
    for enumerator in enumerators() {
        assert_eq!(
            run_file(&file, SystemKind::Clique, 2, enumerator),
            vec![vec![0, 1], vec![1, 2]]
        );
    }
}

#[test]
fn isolated_vertex_is_a_1plex() {
    let file = common::oly_file(1, &[]);
    for enumerator in enumerators() {
        assert_eq!(run_file(&file, SystemKind::D2Kplex, 1, enumerator), vec![vec![0]]);
    }
}

/// Counts expansions and fails on one specific root, deep in the index space.
struct Tripwire {
    roots: usize,
    trip: u32,
    expanded: AtomicU64,
}

impl EnumerableSystem for Tripwire {
    type Node = (u32, u32);
    type Item = Vec<u32>;

    fn name(&self) -> &'static str {
        "tripwire"
    }

    fn root_count(&self) -> usize {
        self.roots
    }

    fn root(&self, index: usize) -> Option<Self::Node> {
        Some((index as u32, 3))
    }

    fn expand(&self, (root, depth): Self::Node, out: &mut Expansion<Self::Node, Self::Item>) -> Result<(), ExpandError> {
        self.expanded.fetch_add(1, Ordering::Relaxed);
        if root == self.trip {
            return Err(ExpandError::new(format!("tripped on root {root}")));
        }
        if depth == 0 {
            out.emit(vec![root]);
        } else {
            out.push_child((root, depth - 1));
            out.push_child((root, depth - 1));
        }
        Ok(())
    }
}

fn tripwire() -> Tripwire {
    Tripwire {
        roots: 200,
        trip: 150,
        expanded: AtomicU64::new(0),
    }
}

#[test]
fn expand_failure_aborts_sequential() {
    let system = tripwire();
    let stats = StatsCollector::new(true);
    let err = Sequential.run(&system, &stats).unwrap_err();
    assert_eq!(err, EnumError::Expand(ExpandError::new("tripped on root 150")));
}

#[test]
fn expand_failure_aborts_work_stealing() {
    let system = tripwire();
    let stats = StatsCollector::new(true);
    let err = ParallelWorkStealing::new(4).run(&system, &stats).unwrap_err();
    assert!(matches!(err, EnumError::Expand(_)), "{err}");
}

#[cfg(feature = "distributed")]
#[test]
fn expand_failure_aborts_every_rank() {
    use parenum::chunk::ChunkOrder;

    let system = tripwire();
    let stats = StatsCollector::new(true);
    let scheduler = DistributedChunked::new(Substrate::Local { ranks: 3 }, 2, 5, ChunkOrder::Reverse);
    let err = scheduler.run(&system, &stats).unwrap_err();
    assert!(
        matches!(&err, EnumError::RankFailed { reason, .. } if reason.contains("tripped on root 150")),
        "{err}"
    );
}

#[test]
fn stats_block_has_the_expected_lines() {
    let file = common::oly_file(3, &[(0, 1), (1, 2), (0, 2)]);
    let cfg = RunConfig {
        graph_path: file.path().to_path_buf(),
        graph_format: GraphFormat::Oly,
        system: SystemKind::Clique,
        ..RunConfig::default()
    };
    let text = run_enumeration(&cfg).unwrap().stats.to_string();
    let labels: Vec<&str> = text.lines().map(|l| l.split(':').next().unwrap()).collect();
    assert_eq!(
        labels,
        [
            "Reading time",
            "Setup time",
            "Run time",
            "Solutions found",
            "Computational tree size",
            "Solutions per ms"
        ]
    );
    assert!(text.contains("Solutions found: 1\n"));
}
