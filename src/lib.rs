//! # parenum
//!
//! Parallel and distributed enumeration of maximal structures in graphs.
//!
//! A problem is described once as an [`EnumerableSystem`](enumerable::EnumerableSystem): a
//! sequence of root nodes plus an `expand` step that turns a node into children and emitted
//! items. Any [`Scheduler`](scheduler::Scheduler) can then traverse the resulting search tree:
//!
//! - [`Sequential`](sequential::Sequential): depth-first on the calling thread.
//! - [`ParallelWorkStealing`](parallel::ParallelWorkStealing): per-thread LIFO deques with
//!   random-victim stealing and an idle-counter termination protocol.
//! - `DistributedChunked` (feature `distributed`): ranks pull chunks of root indices from a
//!   coordinator and run work stealing locally, then steal subtrees from each other; ranks are
//!   thread groups or TCP processes.
//!
//! Two systems ship with the crate: maximal cliques ([`clique`]) and maximal k-plexes of
//! diameter at most two ([`kplex`]).
//!
//! ## Quick Start
//!
//! ```
//! use parenum::prelude::*;
//!
//! // Two triangles sharing the edge 1-2.
//! let graph: Graph<u32> =
//!     Graph::from_edges(4, &[(0, 1), (0, 2), (1, 2), (1, 3), (2, 3)]).unwrap();
//! let system = CliqueEnumeration::new(&graph);
//!
//! let stats = StatsCollector::new(true);
//! ParallelWorkStealing::new(4).run(&system, &stats).unwrap();
//!
//! let report = stats.into_report();
//! assert_eq!(report.stats.items_found, 2);
//! ```
//!
//! ## Running from a Configuration
//!
//! ```no_run
//! use parenum::config::{EnumeratorKind, RunConfig, SystemKind};
//! use parenum::search::run_enumeration;
//!
//! let cfg = RunConfig {
//!     graph_path: "graph.nde".into(),
//!     system: SystemKind::D2Kplex,
//!     k: 2,
//!     enumerator: EnumeratorKind::Parallel,
//!     ..Default::default()
//! };
//! let outcome = run_enumeration(&cfg).unwrap();
//! println!("{}", outcome.stats);
//! ```
//!
//! ## Modules
//!
//! - [`graph`] / [`format`]: CSR graph and the `nde` / `oly` loaders.
//! - [`enumerable`]: the system contract.
//! - [`sequential`], [`parallel`], `distributed`: schedulers.
//! - [`lockfree`]: task deques, cancellation and idle counting shared by the schedulers.
//! - [`validate`]: ground-truth predicates for emitted items.
//! - [`search`]: the run driver used by the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::inline_always)]
#![allow(clippy::many_single_char_names)] // Graph notation: u, v, w, k, q
#![allow(clippy::needless_range_loop)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::multiple_crate_versions)] // Cargo.lock management is external

pub mod chunk;
pub mod clique;
pub mod config;
#[cfg(feature = "distributed")]
pub mod distributed;
pub mod enumerable;
pub mod error;
pub mod format;
pub mod graph;
pub mod kplex;
pub mod lockfree;
pub mod parallel;
pub mod scheduler;
pub mod search;
pub mod sequential;
pub mod stats;
#[cfg(feature = "distributed")]
pub mod transport;
pub mod validate;

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::clique::CliqueEnumeration;
    pub use crate::config::{EnumeratorKind, RunConfig, SystemKind};
    #[cfg(feature = "distributed")]
    pub use crate::distributed::{DistributedChunked, Substrate};
    pub use crate::enumerable::{EnumerableSystem, Expansion};
    pub use crate::error::{EnumError, Error, ExpandError};
    pub use crate::graph::{Graph, NodeId};
    pub use crate::kplex::Diam2KplexEnumeration;
    pub use crate::parallel::ParallelWorkStealing;
    pub use crate::scheduler::Scheduler;
    pub use crate::search::{RunOutcome, run_enumeration};
    pub use crate::sequential::Sequential;
    pub use crate::stats::{RunStats, StatsCollector};
}
