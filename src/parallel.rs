//! Shared-memory work-stealing scheduler.
//!
//! Each worker owns a LIFO deque and explores depth-first. A worker that runs dry steals from the
//! shared injector first and then from the other workers' deques, starting at a random victim.
//!
//! # Termination
//!
//! A worker with nothing to do increments the shared [`IdleCounter`] and waits. It decrements the
//! counter *before* every steal attempt, so a worker that holds a stolen task is never counted
//! idle, and idle workers hold no tasks. Only busy workers create tasks, so once the counter equals
//! the number of workers the run is quiescent and stays so. The single holder of the refill lock
//! re-checks (injector empty, every deque empty, counter still full) and then asks the
//! [`WorkSource`] for another batch; an exhausted source means global termination.
//!
//! # Donations
//!
//! A [`DonationPort`] passed to [`ParallelWorkStealing::run_with_port`] lets a thread outside the
//! workers take the oldest queued tasks while the run is in progress. Removing tasks never breaks
//! the termination argument above: it can only make the run quiescent sooner.

use std::any::Any;
use std::ops::Range;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crossbeam::deque::Injector;
use crossbeam::utils::{Backoff, CachePadded};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

use crate::enumerable::{EnumerableSystem, Expansion};
use crate::error::EnumError;
use crate::lockfree::{CancelToken, IdleCounter, Task, TaskDeque, TaskThief, settle};
use crate::scheduler::Scheduler;
use crate::stats::{LocalTally, StatsCollector};

// ============================================================================
// Work sources
// ============================================================================

/// Work handed to a running scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Batch<Node> {
    /// Root indices, materialised by the worker that runs them.
    Roots(Range<usize>),
    /// Interior nodes, typically taken from another scheduler.
    Nodes(Vec<Node>),
}

impl<Node> Batch<Node> {
    /// Number of tasks in the batch.
    pub fn len(&self) -> usize {
        match self {
            Self::Roots(range) => range.len(),
            Self::Nodes(nodes) => nodes.len(),
        }
    }

    /// Returns true if the batch holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each_task(self, mut push: impl FnMut(Task<Node>)) {
        match self {
            Self::Roots(range) => range.for_each(|index| push(Task::Root(index))),
            Self::Nodes(nodes) => nodes.into_iter().for_each(|node| push(Task::Node(node))),
        }
    }
}

/// Supplies batches of work to a running scheduler.
///
/// Called only when every worker is idle, by one worker at a time. May block.
pub trait WorkSource<Node>: Sync {
    /// The next batch, or `None` once there is no more work anywhere.
    ///
    /// # Errors
    /// An error cancels the run.
    fn next_batch(&self) -> Result<Option<Batch<Node>>, EnumError>;
}

/// A source that yields one range of roots and is then exhausted.
#[derive(Debug)]
pub struct SingleRange {
    range: Mutex<Option<Range<usize>>>,
}

impl SingleRange {
    /// Creates a source yielding `range` once.
    pub fn new(range: Range<usize>) -> Self {
        Self {
            range: Mutex::new(Some(range)),
        }
    }
}

impl<Node> WorkSource<Node> for SingleRange {
    fn next_batch(&self) -> Result<Option<Batch<Node>>, EnumError> {
        let range = self.range.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(range.map(Batch::Roots))
    }
}

// ============================================================================
// Donations
// ============================================================================

struct Queues<Node> {
    injector: Arc<Injector<Task<Node>>>,
    thieves: Vec<TaskThief<Node>>,
}

/// Access to the queues of a running scheduler for a thread that is not one of its workers.
///
/// Closed (and empty) whenever no run is in progress.
pub struct DonationPort<Node> {
    queues: Mutex<Option<Queues<Node>>>,
}

impl<Node> Default for DonationPort<Node> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Node> DonationPort<Node> {
    /// Creates a closed port.
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(None),
        }
    }

    fn open(&self, injector: Arc<Injector<Task<Node>>>, thieves: Vec<TaskThief<Node>>) {
        *self.queues.lock().unwrap_or_else(PoisonError::into_inner) = Some(Queues { injector, thieves });
    }

    fn close(&self) {
        *self.queues.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Takes up to `limit` of the oldest queued tasks.
    ///
    /// Unclaimed injector tasks go first. After that at most one task per pass is taken from each
    /// worker deque that holds more than one, so no worker is left without its next task.
    pub fn take(&self, limit: usize) -> Vec<Task<Node>> {
        let guard = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queues) = guard.as_ref() else {
            return Vec::new();
        };
        let mut taken = Vec::new();
        while taken.len() < limit {
            match settle(|| queues.injector.steal()) {
                Some(task) => taken.push(task),
                None => break,
            }
        }
        let mut progressed = true;
        while progressed && taken.len() < limit {
            progressed = false;
            for thief in &queues.thieves {
                if taken.len() >= limit {
                    break;
                }
                if thief.len() > 1 {
                    if let Some(task) = thief.steal() {
                        taken.push(task);
                        progressed = true;
                    }
                }
            }
        }
        taken
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Multi-threaded scheduler with per-worker deques and work stealing.
#[derive(Clone, Debug)]
pub struct ParallelWorkStealing {
    threads: usize,
    seed: Option<u64>,
}

impl Default for ParallelWorkStealing {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}

impl ParallelWorkStealing {
    /// Creates a scheduler with `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            seed: None,
        }
    }

    /// Fixes the seed used for victim selection.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs the workers until `source` is exhausted and all work is done.
    ///
    /// The first batch is taken before the workers start and dealt round-robin to their deques.
    /// `cancel` may be shared with an outside party that needs to stop the run.
    ///
    /// # Errors
    /// Returns the first error recorded in `cancel`, whether raised by a worker, by the source,
    /// or from outside.
    pub fn run_with_source<S, R>(
        &self,
        system: &S,
        source: &R,
        stats: &StatsCollector<S::Item>,
        cancel: &CancelToken,
    ) -> Result<(), EnumError>
    where
        S: EnumerableSystem,
        R: WorkSource<S::Node> + ?Sized,
    {
        self.run_with_port(system, source, stats, cancel, None)
    }

    /// Like [`ParallelWorkStealing::run_with_source`], with the queues exposed through `port`
    /// for as long as the workers run.
    ///
    /// # Errors
    /// As for [`ParallelWorkStealing::run_with_source`].
    pub fn run_with_port<S, R>(
        &self,
        system: &S,
        source: &R,
        stats: &StatsCollector<S::Item>,
        cancel: &CancelToken,
        port: Option<&DonationPort<S::Node>>,
    ) -> Result<(), EnumError>
    where
        S: EnumerableSystem,
        R: WorkSource<S::Node> + ?Sized,
    {
        cancel.check()?;
        let Some(first) = source.next_batch()? else {
            return Ok(());
        };

        let deques: Vec<TaskDeque<S::Node>> = (0..self.threads).map(|_| TaskDeque::new()).collect();
        let mut slot = 0;
        first.for_each_task(|task| {
            deques[slot % self.threads].push(task);
            slot += 1;
        });

        let shared = Shared {
            system,
            source,
            injector: Arc::new(Injector::new()),
            thieves: deques.iter().map(TaskDeque::thief).collect(),
            idle: IdleCounter::new(self.threads),
            refill_lock: CachePadded::new(AtomicBool::new(false)),
            terminated: CachePadded::new(AtomicBool::new(false)),
            cancel,
        };
        if let Some(port) = port {
            port.open(Arc::clone(&shared.injector), shared.thieves.clone());
        }
        let base_seed = self.seed.unwrap_or_else(rand::random::<u64>);

        debug!(
            system = system.name(),
            threads = self.threads,
            "starting work-stealing workers"
        );
        thread::scope(|scope| {
            for (id, deque) in deques.into_iter().enumerate() {
                let shared = &shared;
                let spawned = thread::Builder::new()
                    .name(format!("parenum-worker-{id}"))
                    .spawn_scoped(scope, move || {
                        let rng = SmallRng::seed_from_u64(splitmix64(base_seed ^ id as u64));
                        let body = AssertUnwindSafe(|| shared.worker_loop(id, &deque, rng, stats));
                        if let Err(payload) = catch_unwind(body) {
                            shared.cancel.cancel(EnumError::WorkerPanicked {
                                worker: id,
                                message: panic_message(payload.as_ref()),
                            });
                        }
                    });
                if let Err(e) = spawned {
                    shared.cancel.cancel(EnumError::Spawn(e.to_string()));
                    break;
                }
            }
        });

        if let Some(port) = port {
            port.close();
        }
        cancel.check()
    }
}

impl Scheduler for ParallelWorkStealing {
    fn name(&self) -> &'static str {
        "parallel"
    }

    fn run<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
    ) -> Result<(), EnumError> {
        let source = SingleRange::new(0..system.root_count());
        self.run_with_source(system, &source, stats, &CancelToken::new())
    }
}

// ============================================================================
// Workers
// ============================================================================

struct Shared<'a, S: EnumerableSystem, R: ?Sized> {
    system: &'a S,
    source: &'a R,
    injector: Arc<Injector<Task<S::Node>>>,
    thieves: Vec<TaskThief<S::Node>>,
    idle: IdleCounter,
    refill_lock: CachePadded<AtomicBool>,
    terminated: CachePadded<AtomicBool>,
    cancel: &'a CancelToken,
}

impl<S: EnumerableSystem, R: WorkSource<S::Node> + ?Sized> Shared<'_, S, R> {
    fn worker_loop(
        &self,
        id: usize,
        deque: &TaskDeque<S::Node>,
        mut rng: SmallRng,
        stats: &StatsCollector<S::Item>,
    ) {
        let mut tally = stats.tally();
        let mut out = Expansion::new();

        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let task = match deque.pop() {
                Some(task) => task,
                None => match self.steal_once(id, deque, &mut rng) {
                    Some(task) => task,
                    None => match self.wait_for_work(id, deque, &mut rng) {
                        Some(task) => task,
                        None => break,
                    },
                },
            };
            if let Err(e) = self.execute(task, deque, &mut out, &mut tally) {
                self.cancel.cancel(e);
                return;
            }
        }

        trace!(
            worker = id,
            nodes = tally.nodes_expanded(),
            items = tally.items_found(),
            "worker finished"
        );
        stats.absorb(tally);
    }

    fn execute(
        &self,
        task: Task<S::Node>,
        deque: &TaskDeque<S::Node>,
        out: &mut Expansion<S::Node, S::Item>,
        tally: &mut LocalTally<S::Item>,
    ) -> Result<(), EnumError> {
        let node = match task {
            Task::Root(index) => match self.system.root(index) {
                Some(node) => node,
                None => return Ok(()),
            },
            Task::Node(node) => node,
        };
        tally.record_expansion();
        out.clear();
        self.system.expand(node, out)?;
        for item in out.drain_items() {
            tally.record_item(item);
        }
        for child in out.drain_children() {
            deque.push(Task::Node(child));
        }
        Ok(())
    }

    /// One pass over the injector and every other worker's deque.
    fn steal_once(
        &self,
        id: usize,
        deque: &TaskDeque<S::Node>,
        rng: &mut SmallRng,
    ) -> Option<Task<S::Node>> {
        if let Some(task) = deque.refill_from(&self.injector) {
            return Some(task);
        }
        let n = self.thieves.len();
        if n <= 1 {
            return None;
        }
        let start = rng.random_range(0..n);
        (0..n)
            .map(|offset| (start + offset) % n)
            .filter(|&victim| victim != id)
            .find_map(|victim| self.thieves[victim].steal())
    }

    fn work_visible(&self) -> bool {
        !self.injector.is_empty() || self.thieves.iter().any(|t| !t.is_empty())
    }

    /// Idle phase. Returns a task, or `None` when the run is over.
    fn wait_for_work(
        &self,
        id: usize,
        deque: &TaskDeque<S::Node>,
        rng: &mut SmallRng,
    ) -> Option<Task<S::Node>> {
        self.idle.enter();
        let backoff = Backoff::new();
        loop {
            if self.terminated.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                return None;
            }
            if self.idle.all_idle() {
                self.try_refill();
            }
            if self.work_visible() {
                self.idle.leave();
                if let Some(task) = self.steal_once(id, deque, rng) {
                    return Some(task);
                }
                self.idle.enter();
            }
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    fn try_refill(&self) {
        if self
            .refill_lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let quiescent = self.injector.is_empty()
            && self.thieves.iter().all(TaskThief::is_empty)
            && self.idle.all_idle();
        if quiescent && !self.terminated.load(Ordering::Acquire) {
            match self.source.next_batch() {
                Ok(Some(batch)) => {
                    trace!(tasks = batch.len(), "refilling injector");
                    batch.for_each_task(|task| self.injector.push(task));
                }
                Ok(None) => self.terminated.store(true, Ordering::Release),
                Err(e) => self.cancel.cancel(e),
            }
        }
        self.refill_lock.store(false, Ordering::Release);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// SplitMix64 mixer for deriving per-worker seeds from a base seed.
#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExpandError;
    use crate::sequential::Sequential;
    use std::sync::atomic::AtomicUsize;

    /// Skewed tree: root `i` is a chain of length `i` with a fan-out of `i % 4` at every level.
    struct Skewed {
        roots: usize,
        fail_at_depth: Option<u32>,
    }

    impl EnumerableSystem for Skewed {
        type Node = (u32, u32, u32);
        type Item = Vec<u32>;

        fn name(&self) -> &'static str {
            "skewed"
        }

        fn root_count(&self) -> usize {
            self.roots
        }

        fn root(&self, index: usize) -> Option<Self::Node> {
            (index % 5 != 3).then_some((index as u32, 0, 0))
        }

        fn expand(
            &self,
            (root, depth, label): Self::Node,
            out: &mut Expansion<Self::Node, Self::Item>,
        ) -> Result<(), ExpandError> {
            if Some(depth) == self.fail_at_depth && root == self.roots as u32 - 1 {
                return Err(ExpandError::new("boom"));
            }
            if depth >= root.min(6) {
                out.emit(vec![root, depth, label]);
                return Ok(());
            }
            for b in 0..=(root % 4).min(2) {
                out.push_child((root, depth + 1, label * 3 + b));
            }
            Ok(())
        }
    }

    fn sorted_items<S: Scheduler>(scheduler: &S, system: &Skewed) -> (u64, Vec<Vec<u32>>) {
        let stats = StatsCollector::new(true);
        scheduler.run(system, &stats).unwrap();
        let nodes = stats.nodes_expanded();
        let mut items = stats.into_report().items.unwrap();
        items.sort();
        (nodes, items)
    }

    #[test]
    fn matches_sequential_for_any_thread_count() {
        let system = Skewed { roots: 40, fail_at_depth: None };
        let expected = sorted_items(&Sequential, &system);
        assert!(expected.0 > 40);
        for threads in [1, 2, 3, 8] {
            let got = sorted_items(&ParallelWorkStealing::new(threads).with_seed(7), &system);
            assert_eq!(got, expected, "threads = {threads}");
        }
    }

    #[test]
    fn more_threads_than_roots() {
        let system = Skewed { roots: 2, fail_at_depth: None };
        let expected = sorted_items(&Sequential, &system);
        let got = sorted_items(&ParallelWorkStealing::new(16), &system);
        assert_eq!(got, expected);
    }

    #[test]
    fn empty_source_terminates() {
        let system = Skewed { roots: 0, fail_at_depth: None };
        let stats = StatsCollector::new(false);
        ParallelWorkStealing::new(4).run(&system, &stats).unwrap();
        assert_eq!(stats.nodes_expanded(), 0);
    }

    #[test]
    fn expand_failure_cancels_the_run() {
        let system = Skewed { roots: 30, fail_at_depth: Some(2) };
        let stats = StatsCollector::new(true);
        let err = ParallelWorkStealing::new(4).run(&system, &stats).unwrap_err();
        assert_eq!(err, EnumError::Expand(ExpandError::new("boom")));
    }

    /// Hands out `chunks` consecutive ranges of `size` roots each.
    struct Chunked {
        size: usize,
        chunks: usize,
        served: AtomicUsize,
    }

    impl<N> WorkSource<N> for Chunked {
        fn next_batch(&self) -> Result<Option<Batch<N>>, EnumError> {
            let i = self.served.fetch_add(1, Ordering::SeqCst);
            Ok((i < self.chunks).then(|| Batch::Roots(i * self.size..(i + 1) * self.size)))
        }
    }

    #[test]
    fn refills_until_source_is_exhausted() {
        let system = Skewed { roots: 48, fail_at_depth: None };
        let expected = sorted_items(&Sequential, &system);
        let source = Chunked { size: 6, chunks: 8, served: AtomicUsize::new(0) };
        let stats = StatsCollector::new(true);
        ParallelWorkStealing::new(3)
            .run_with_source(&system, &source, &stats, &CancelToken::new())
            .unwrap();
        // Eight chunks plus the final `None`.
        assert_eq!(source.served.load(Ordering::SeqCst), 9);
        let nodes = stats.nodes_expanded();
        let mut items = stats.into_report().items.unwrap();
        items.sort();
        assert_eq!((nodes, items), expected);
    }

    /// Roots first, then a batch of interior nodes, then nothing.
    struct Mixed {
        batches: Mutex<Vec<Batch<(u32, u32, u32)>>>,
    }

    impl WorkSource<(u32, u32, u32)> for Mixed {
        fn next_batch(&self) -> Result<Option<Batch<(u32, u32, u32)>>, EnumError> {
            Ok(self.batches.lock().unwrap().pop())
        }
    }

    #[test]
    fn node_batches_are_expanded_like_roots() {
        let system = Skewed { roots: 12, fail_at_depth: None };
        let roots: Vec<_> = (8..12).filter_map(|i| system.root(i)).collect();
        let source = Mixed {
            batches: Mutex::new(vec![Batch::Nodes(roots), Batch::Roots(0..8)]),
        };
        let stats = StatsCollector::new(true);
        ParallelWorkStealing::new(3)
            .run_with_source(&system, &source, &stats, &CancelToken::new())
            .unwrap();
        let nodes = stats.nodes_expanded();
        let mut items = stats.into_report().items.unwrap();
        items.sort();
        assert_eq!((nodes, items), sorted_items(&Sequential, &system));
    }

    struct FailingSource;

    impl<N> WorkSource<N> for FailingSource {
        fn next_batch(&self) -> Result<Option<Batch<N>>, EnumError> {
            Err(EnumError::Transport("link down".into()))
        }
    }

    #[test]
    fn source_error_is_returned() {
        let system = Skewed { roots: 4, fail_at_depth: None };
        let stats = StatsCollector::new(false);
        let err = ParallelWorkStealing::new(2)
            .run_with_source(&system, &FailingSource, &stats, &CancelToken::new())
            .unwrap_err();
        assert_eq!(err, EnumError::Transport("link down".into()));
    }

    #[test]
    fn port_takes_injector_tasks_then_oldest_tasks() {
        let port = DonationPort::new();
        assert!(port.take(4).is_empty());

        let injector = Arc::new(Injector::new());
        injector.push(Task::<u32>::Root(100));
        let busy = TaskDeque::new();
        for i in 0..3 {
            busy.push(Task::Node(i));
        }
        let single = TaskDeque::new();
        single.push(Task::Node(50));
        port.open(Arc::clone(&injector), vec![busy.thief(), single.thief()]);

        assert_eq!(port.take(2), vec![Task::Root(100), Task::Node(0)]);
        assert_eq!(port.take(10), vec![Task::Node(1)]);
        // Every deque keeps its last task.
        assert!(port.take(10).is_empty());
        assert_eq!(busy.pop(), Some(Task::Node(2)));
        assert_eq!(single.pop(), Some(Task::Node(50)));

        port.close();
        injector.push(Task::Root(7));
        assert!(port.take(1).is_empty());
    }

    #[test]
    fn port_is_closed_after_the_run() {
        let system = Skewed { roots: 20, fail_at_depth: None };
        let port = DonationPort::new();
        let stats = StatsCollector::new(false);
        ParallelWorkStealing::new(2)
            .run_with_port(&system, &SingleRange::new(0..20), &stats, &CancelToken::new(), Some(&port))
            .unwrap();
        assert!(port.queues.lock().unwrap().is_none());
    }

    struct Panicky;

    impl EnumerableSystem for Panicky {
        type Node = u32;
        type Item = Vec<u32>;

        fn name(&self) -> &'static str {
            "panicky"
        }

        fn root_count(&self) -> usize {
            8
        }

        fn root(&self, index: usize) -> Option<u32> {
            Some(index as u32)
        }

        fn expand(&self, node: u32, _out: &mut Expansion<u32, Vec<u32>>) -> Result<(), ExpandError> {
            assert!(node != 5, "node five");
            Ok(())
        }
    }

    #[test]
    fn worker_panic_becomes_an_error() {
        let stats = StatsCollector::new(false);
        let err = ParallelWorkStealing::new(3).run(&Panicky, &stats).unwrap_err();
        match err {
            EnumError::WorkerPanicked { message, .. } => assert_eq!(message, "node five"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn pre_cancelled_token_stops_immediately() {
        let cancel = CancelToken::new();
        cancel.cancel(EnumError::Aborted("stop".into()));
        let system = Skewed { roots: 10, fail_at_depth: None };
        let stats = StatsCollector::new(false);
        let err = ParallelWorkStealing::new(2)
            .run_with_source(&system, &SingleRange::new(0..10), &stats, &cancel)
            .unwrap_err();
        assert_eq!(err, EnumError::Aborted("stop".into()));
        assert_eq!(stats.nodes_expanded(), 0);
    }

    #[test]
    fn splitmix64_is_deterministic() {
        assert_eq!(splitmix64(0), splitmix64(0));
        assert_eq!(splitmix64(12345), splitmix64(12345));
        assert_ne!(splitmix64(0), splitmix64(1));
    }
}
