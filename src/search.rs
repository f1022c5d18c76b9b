//! Run driver: load the graph, build the system, pick a scheduler, collect the results.

use tracing::info;

use crate::clique::CliqueEnumeration;
use crate::config::{EnumeratorKind, RunConfig, SystemKind};
use crate::enumerable::{EnumerableSystem, WireItem};
use crate::error::{EnumError, Error};
use crate::format::load_graph;
use crate::graph::{Graph, NodeId};
use crate::kplex::Diam2KplexEnumeration;
use crate::parallel::ParallelWorkStealing;
use crate::scheduler::Scheduler;
use crate::sequential::Sequential;
use crate::stats::{RunStats, StatsCollector};
use crate::validate::{ItemCheck, validate_items};

/// Result of a complete run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    /// Timings and counters.
    pub stats: RunStats,
    /// Emitted items as sorted vertex ids, when retained.
    pub items: Option<Vec<Vec<u64>>>,
    /// False on non-zero TCP ranks, whose stats cover only their own share.
    pub is_reporting_rank: bool,
}

/// Runs the enumeration described by `cfg`.
///
/// # Errors
/// Returns configuration, graph loading, enumeration and (with `validate`) validation errors.
pub fn run_enumeration(cfg: &RunConfig) -> Result<RunOutcome, Error> {
    cfg.validate()?;
    if cfg.huge_graph {
        run_with::<u64>(cfg)
    } else {
        run_with::<u32>(cfg)
    }
}

fn run_with<N: NodeId>(cfg: &RunConfig) -> Result<RunOutcome, Error> {
    let stats = StatsCollector::<Vec<N>>::new(cfg.retain_items || cfg.validate);
    let graph = load_graph::<N>(&cfg.graph_path, cfg.graph_format, cfg.one_based)?;
    stats.mark_read_done();
    info!(
        path = %cfg.graph_path.display(),
        vertices = graph.vertex_count(),
        edges = graph.edge_count(),
        "graph loaded"
    );

    match cfg.system {
        SystemKind::Clique => {
            let system = CliqueEnumeration::new(&graph);
            finish(cfg, &graph, &system, stats, ItemCheck::MaximalClique)
        }
        SystemKind::D2Kplex => {
            let system = Diam2KplexEnumeration::new(&graph, cfg.k, cfg.q, cfg.pivoting);
            let check = ItemCheck::Diam2Kplex {
                k: system.k(),
                q: system.q(),
            };
            finish(cfg, &graph, &system, stats, check)
        }
    }
}

fn finish<N, S>(
    cfg: &RunConfig,
    graph: &Graph<N>,
    system: &S,
    stats: StatsCollector<Vec<N>>,
    check: ItemCheck,
) -> Result<RunOutcome, Error>
where
    N: NodeId,
    S: EnumerableSystem<Item = Vec<N>>,
{
    stats.mark_run_start();
    dispatch(cfg, system, &stats)?;
    stats.mark_run_done();
    let report = stats.into_report();
    info!(
        system = system.name(),
        items_found = report.stats.items_found,
        nodes_expanded = report.stats.nodes_expanded,
        run_ms = report.stats.run_time.as_millis() as u64,
        "enumeration finished"
    );

    let is_reporting_rank = cfg.is_reporting_rank();
    if cfg.validate && is_reporting_rank {
        if let Some(items) = &report.items {
            validate_items(graph, items, check)?;
            info!(items = items.len(), "all items validated");
        }
    }

    let items = if cfg.retain_items {
        report
            .items
            .map(|items| items.iter().map(WireItem::to_wire).collect())
    } else {
        None
    };
    Ok(RunOutcome {
        stats: report.stats,
        items,
        is_reporting_rank,
    })
}

fn dispatch<S: EnumerableSystem>(
    cfg: &RunConfig,
    system: &S,
    stats: &StatsCollector<S::Item>,
) -> Result<(), EnumError> {
    match cfg.enumerator {
        EnumeratorKind::Sequential => Sequential.run(system, stats),
        EnumeratorKind::Parallel => {
            let mut scheduler = ParallelWorkStealing::new(cfg.threads);
            if let Some(seed) = cfg.seed {
                scheduler = scheduler.with_seed(seed);
            }
            info!(threads = scheduler.threads(), "work-stealing run");
            scheduler.run(system, stats)
        }
        EnumeratorKind::Distributed => run_distributed(cfg, system, stats),
    }
}

#[cfg(feature = "distributed")]
fn run_distributed<S: EnumerableSystem>(
    cfg: &RunConfig,
    system: &S,
    stats: &StatsCollector<S::Item>,
) -> Result<(), EnumError> {
    use crate::distributed::{DistributedChunked, Substrate};

    let d = &cfg.distributed;
    let substrate = match (&d.coordinator, d.rank, d.world_size) {
        (Some(address), Some(rank), Some(world_size)) => Substrate::Tcp {
            rank,
            world_size,
            coordinator: address.clone(),
        },
        _ => Substrate::Local { ranks: d.ranks },
    };
    let mut scheduler = DistributedChunked::new(substrate, cfg.threads, d.chunk_size, d.chunk_order);
    if let Some(seed) = cfg.seed {
        scheduler = scheduler.with_seed(seed);
    }
    scheduler.run(system, stats)
}

#[cfg(not(feature = "distributed"))]
fn run_distributed<S: EnumerableSystem>(
    _cfg: &RunConfig,
    _system: &S,
    _stats: &StatsCollector<S::Item>,
) -> Result<(), EnumError> {
    Err(crate::error::ConfigError::DistributedUnavailable.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    use crate::format::GraphFormat;

    fn graph_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    // Two triangles sharing the edge 1-2, in `oly` form.
    const DIAMOND: &str = "4 5\n0 1\n0 2\n1 2\n1 3\n2 3\n";

    fn config(path: PathBuf, system: SystemKind, enumerator: EnumeratorKind) -> RunConfig {
        RunConfig {
            graph_path: path,
            graph_format: GraphFormat::Oly,
            system,
            enumerator,
            threads: 3,
            retain_items: true,
            validate: true,
            ..RunConfig::default()
        }
    }

    fn sorted_items(outcome: &RunOutcome) -> Vec<Vec<u64>> {
        let mut items = outcome.items.clone().unwrap();
        items.sort();
        items
    }

    #[test]
    fn every_enumerator_finds_the_diamond_cliques() {
        let file = graph_file(DIAMOND);
        let mut expected_nodes = None;
        for enumerator in [
            EnumeratorKind::Sequential,
            EnumeratorKind::Parallel,
            EnumeratorKind::Distributed,
        ] {
            let cfg = config(file.path().to_path_buf(), SystemKind::Clique, enumerator);
            if enumerator == EnumeratorKind::Distributed && !cfg!(feature = "distributed") {
                continue;
            }
            let outcome = run_enumeration(&cfg).unwrap();
            assert_eq!(sorted_items(&outcome), vec![vec![0, 1, 2], vec![1, 2, 3]]);
            assert_eq!(outcome.stats.items_found, 2);
            assert!(outcome.is_reporting_rank);
            let nodes = *expected_nodes.get_or_insert(outcome.stats.nodes_expanded);
            assert_eq!(outcome.stats.nodes_expanded, nodes, "{enumerator:?}");
        }
    }

    #[test]
    fn diamond_is_a_single_2plex() {
        let file = graph_file(DIAMOND);
        let cfg = config(file.path().to_path_buf(), SystemKind::D2Kplex, EnumeratorKind::Sequential);
        let outcome = run_enumeration(&cfg).unwrap();
        assert_eq!(sorted_items(&outcome), vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn huge_graph_ids_give_the_same_answer() {
        let file = graph_file(DIAMOND);
        let mut cfg = config(file.path().to_path_buf(), SystemKind::Clique, EnumeratorKind::Parallel);
        let narrow = run_enumeration(&cfg).unwrap();
        cfg.huge_graph = true;
        let wide = run_enumeration(&cfg).unwrap();
        assert_eq!(sorted_items(&narrow), sorted_items(&wide));
    }

    #[test]
    fn items_are_dropped_unless_retained() {
        let file = graph_file(DIAMOND);
        let mut cfg = config(file.path().to_path_buf(), SystemKind::Clique, EnumeratorKind::Sequential);
        cfg.retain_items = false;
        let outcome = run_enumeration(&cfg).unwrap();
        assert_eq!(outcome.items, None);
        assert_eq!(outcome.stats.items_found, 2);
    }

    #[test]
    fn missing_file_is_a_graph_error() {
        let cfg = config(
            PathBuf::from("/definitely/not/here.oly"),
            SystemKind::Clique,
            EnumeratorKind::Sequential,
        );
        assert!(matches!(run_enumeration(&cfg), Err(Error::Graph(_))));
    }

    #[test]
    fn invalid_config_fails_before_loading() {
        let mut cfg = config(
            PathBuf::from("/definitely/not/here.oly"),
            SystemKind::D2Kplex,
            EnumeratorKind::Sequential,
        );
        cfg.q = 0;
        assert!(matches!(run_enumeration(&cfg), Err(Error::Config(_))));
    }
}
