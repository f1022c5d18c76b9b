//! The interface every execution strategy implements.

use crate::enumerable::EnumerableSystem;
use crate::error::EnumError;
use crate::stats::StatsCollector;

/// Drives an [`EnumerableSystem`] to completion.
///
/// Every scheduler expands each node of the search tree exactly once, so for a given system all
/// schedulers report the same item set and the same number of expansions. Only the order differs.
pub trait Scheduler {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Enumerates the whole tree, recording expansions and items in `stats`.
    ///
    /// # Errors
    /// Returns the first failure observed. Counts recorded by a failed run are meaningless.
    fn run<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
    ) -> Result<(), EnumError>;
}
