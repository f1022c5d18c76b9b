//! Run configuration.

use std::path::PathBuf;

use clap::ValueEnum;

use crate::chunk::ChunkOrder;
use crate::error::ConfigError;
use crate::format::GraphFormat;

/// Which structures to enumerate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SystemKind {
    /// Maximal cliques.
    Clique,
    /// Maximal k-plexes of diameter at most two.
    #[default]
    #[value(name = "d2kplex")]
    D2Kplex,
}

/// Which scheduler drives the search tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum EnumeratorKind {
    /// Single-threaded depth-first traversal.
    #[default]
    Sequential,
    /// Work-stealing threads in this process.
    Parallel,
    /// Chunked roots over several ranks.
    Distributed,
}

/// Parameters of a distributed run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributedConfig {
    /// Number of in-process ranks when no coordinator address is given.
    pub ranks: usize,
    /// Roots per chunk; 0 selects static partitioning.
    pub chunk_size: usize,
    /// Order in which chunks are granted.
    pub chunk_order: ChunkOrder,
    /// This process's rank in a TCP cluster.
    pub rank: Option<usize>,
    /// Number of processes in a TCP cluster.
    pub world_size: Option<usize>,
    /// Address rank 0 listens on. Selects the TCP substrate.
    pub coordinator: Option<String>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            ranks: 2,
            chunk_size: 100,
            chunk_order: ChunkOrder::Reverse,
            rank: None,
            world_size: None,
            coordinator: None,
        }
    }
}

/// Everything a run needs, from the input file to the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunConfig {
    /// Graph file.
    pub graph_path: PathBuf,
    /// Graph file format.
    pub graph_format: GraphFormat,
    /// Vertex ids in the file start at 1.
    pub one_based: bool,
    /// Use 64-bit vertex ids.
    pub huge_graph: bool,
    /// Structures to enumerate.
    pub system: SystemKind,
    /// The k of the k-plexes.
    pub k: usize,
    /// Minimum k-plex size.
    pub q: usize,
    /// Enables pivot branching in the k-plex search.
    pub pivoting: bool,
    /// Scheduler.
    pub enumerator: EnumeratorKind,
    /// Worker threads (per rank for distributed runs).
    pub threads: usize,
    /// Optional deterministic seed for victim selection.
    pub seed: Option<u64>,
    /// Distributed parameters; ignored by the other schedulers.
    pub distributed: DistributedConfig,
    /// Keep the emitted items so they can be printed.
    pub retain_items: bool,
    /// Check every emitted item after the run.
    pub validate: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            graph_path: PathBuf::new(),
            graph_format: GraphFormat::Nde,
            one_based: false,
            huge_graph: false,
            system: SystemKind::D2Kplex,
            k: 2,
            q: 1,
            pivoting: true,
            enumerator: EnumeratorKind::Sequential,
            threads: num_cpus::get(),
            seed: None,
            distributed: DistributedConfig::default(),
            retain_items: false,
            validate: false,
        }
    }
}

impl RunConfig {
    /// Checks the configuration before any work starts.
    ///
    /// # Errors
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::invalid("threads", "must be at least 1"));
        }
        if self.system == SystemKind::D2Kplex {
            if self.k == 0 {
                return Err(ConfigError::invalid("k", "must be at least 1"));
            }
            if self.q == 0 {
                return Err(ConfigError::invalid("q", "must be at least 1"));
            }
        }
        if self.enumerator == EnumeratorKind::Distributed {
            if !cfg!(feature = "distributed") {
                return Err(ConfigError::DistributedUnavailable);
            }
            self.distributed.validate()?;
        }
        Ok(())
    }

    /// Returns true unless this process is a non-zero rank of a TCP cluster, which only sees its
    /// own share of the results.
    pub fn is_reporting_rank(&self) -> bool {
        self.enumerator != EnumeratorKind::Distributed
            || self.distributed.coordinator.is_none()
            || self.distributed.rank == Some(0)
    }
}

impl DistributedConfig {
    /// Checks the distributed settings.
    ///
    /// # Errors
    /// Returns the first invalid setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.coordinator, self.rank, self.world_size) {
            (None, None, None) => {
                if self.ranks == 0 {
                    return Err(ConfigError::invalid("ranks", "must be at least 1"));
                }
                Ok(())
            }
            (None, _, _) => Err(ConfigError::invalid(
                "coordinator",
                "required together with --rank and --world-size",
            )),
            (Some(address), Some(rank), Some(world_size)) => {
                if address.trim().is_empty() {
                    return Err(ConfigError::invalid("coordinator", "must not be empty"));
                }
                if world_size == 0 {
                    return Err(ConfigError::invalid("world-size", "must be at least 1"));
                }
                if rank >= world_size {
                    return Err(ConfigError::invalid(
                        "rank",
                        format!("{rank} is not below the world size {world_size}"),
                    ));
                }
                Ok(())
            }
            (Some(_), None, _) => Err(ConfigError::invalid("rank", "required with --coordinator")),
            (Some(_), _, None) => Err(ConfigError::invalid(
                "world-size",
                "required with --coordinator",
            )),
        }
    }
}
