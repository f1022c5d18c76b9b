//! Single-threaded depth-first scheduler. Deterministic; the reference for the others.

use tracing::debug;

use crate::enumerable::{EnumerableSystem, Expansion};
use crate::error::EnumError;
use crate::scheduler::Scheduler;
use crate::stats::StatsCollector;

/// Explicit-stack depth-first search over the roots in index order.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sequential;

impl Scheduler for Sequential {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn run<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
    ) -> Result<(), EnumError> {
        let mut tally = stats.tally();
        let mut out = Expansion::new();
        let mut stack = Vec::new();

        for index in 0..system.root_count() {
            let Some(root) = system.root(index) else {
                continue;
            };
            stack.push(root);
            while let Some(node) = stack.pop() {
                tally.record_expansion();
                out.clear();
                system.expand(node, &mut out)?;
                for item in out.drain_items() {
                    tally.record_item(item);
                }
                // Reversed so that the first child is expanded first.
                stack.extend(out.drain_children().rev());
            }
        }

        debug!(
            system = system.name(),
            nodes = tally.nodes_expanded(),
            items = tally.items_found(),
            "sequential run complete"
        );
        stats.absorb(tally);
        Ok(())
    }
}
