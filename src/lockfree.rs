//! Concurrent building blocks for the work-stealing scheduler.
//!
//! - [`TaskDeque`] / [`TaskThief`]: owner and thief halves of a per-worker deque. The owner works
//!   LIFO (depth-first, cache-warm); thieves take from the opposite end, which holds the oldest
//!   and usually largest subtrees.
//! - [`CancelToken`]: first-error-wins cancellation shared by all workers of a run.
//! - [`IdleCounter`]: the shared counter used to detect global quiescence.
//!
//! # Design Principles
//!
//! 1. **Ownership in the types**: only the owning worker can push or pop its deque
//! 2. **Wait-free fast path**: an uncontended pop is a couple of atomics
//! 3. **Cache-friendly**: shared counters are padded to their own cache line

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::EnumError;

// ============================================================================
// Tasks
// ============================================================================

/// A unit of scheduled work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Task<Node> {
    /// A root index not yet materialised.
    Root(usize),
    /// An interior search node.
    Node(Node),
}

// ============================================================================
// Deques
// ============================================================================

/// Owner half of a worker's deque.
pub struct TaskDeque<Node> {
    inner: Worker<Task<Node>>,
}

impl<Node> Default for TaskDeque<Node> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Node> TaskDeque<Node> {
    /// Creates an empty LIFO deque.
    pub fn new() -> Self {
        Self {
            inner: Worker::new_lifo(),
        }
    }

    /// Creates the thief half for this deque.
    pub fn thief(&self) -> TaskThief<Node> {
        TaskThief {
            inner: self.inner.stealer(),
        }
    }

    /// Pushes a task onto the owner's end.
    #[inline]
    pub fn push(&self, task: Task<Node>) {
        self.inner.push(task);
    }

    /// Pops the most recently pushed task.
    #[inline]
    pub fn pop(&self) -> Option<Task<Node>> {
        self.inner.pop()
    }

    /// Returns true if the deque holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Moves a batch from the shared injector into this deque and returns one task of it.
    pub fn refill_from(&self, injector: &Injector<Task<Node>>) -> Option<Task<Node>> {
        settle(|| injector.steal_batch_and_pop(&self.inner))
    }
}

/// Thief half of a worker's deque. Cheap to clone and share.
pub struct TaskThief<Node> {
    inner: Stealer<Task<Node>>,
}

impl<Node> Clone for TaskThief<Node> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Node> TaskThief<Node> {
    /// Steals the oldest task of the victim deque.
    pub fn steal(&self) -> Option<Task<Node>> {
        settle(|| self.inner.steal())
    }

    /// Returns true if the victim deque looks empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Approximate number of tasks in the victim deque.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Repeats a steal operation until it gives a definite answer.
pub fn settle<T>(mut attempt: impl FnMut() -> Steal<T>) -> Option<T> {
    loop {
        match attempt() {
            Steal::Success(task) => return Some(task),
            Steal::Empty => return None,
            Steal::Retry => {}
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Shared cancellation flag that remembers the first error reported.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Default)]
struct CancelState {
    cancelled: CachePadded<AtomicBool>,
    first_error: Mutex<Option<EnumError>>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the run. Only the first error is kept.
    pub fn cancel(&self, error: EnumError) {
        {
            let mut slot = self
                .inner
                .first_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(error);
            }
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns true once any worker has cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The first error reported, if any.
    pub fn error(&self) -> Option<EnumError> {
        self.inner
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `Err` with the first error if cancelled, `Ok` otherwise.
    ///
    /// # Errors
    /// Returns the first error passed to [`CancelToken::cancel`].
    pub fn check(&self) -> Result<(), EnumError> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(self
            .error()
            .unwrap_or_else(|| EnumError::Aborted("cancelled".to_owned())))
    }
}

// ============================================================================
// Idle counter
// ============================================================================

/// Number of workers currently without work.
#[derive(Debug)]
pub struct IdleCounter {
    idle: CachePadded<AtomicUsize>,
    workers: usize,
}

impl IdleCounter {
    /// Creates a counter for `workers` workers, none of them idle.
    pub fn new(workers: usize) -> Self {
        Self {
            idle: CachePadded::new(AtomicUsize::new(0)),
            workers,
        }
    }

    /// Marks the calling worker idle.
    #[inline]
    pub fn enter(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks the calling worker busy. Must be paired with a previous [`IdleCounter::enter`].
    #[inline]
    pub fn leave(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    /// Returns true if every worker is idle.
    #[inline]
    pub fn all_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst) == self.workers
    }

    /// Current number of idle workers.
    pub fn count(&self) -> usize {
        self.idle.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn owner_pops_lifo_thief_steals_fifo() {
        let deque = TaskDeque::new();
        let thief = deque.thief();
        for i in 0..4 {
            deque.push(Task::<u32>::Root(i));
        }
        assert_eq!(deque.len(), 4);
        assert_eq!(deque.pop(), Some(Task::Root(3)));
        assert_eq!(thief.steal(), Some(Task::Root(0)));
        assert_eq!(deque.pop(), Some(Task::Root(2)));
        assert_eq!(thief.steal(), Some(Task::Root(1)));
        assert!(deque.pop().is_none());
        assert!(thief.steal().is_none());
        assert!(thief.is_empty());
    }

    #[test]
    fn refill_moves_tasks_from_injector() {
        let injector = Injector::new();
        for i in 0..10 {
            injector.push(Task::<u32>::Root(i));
        }
        let deque = TaskDeque::new();
        let first = deque.refill_from(&injector);
        assert!(first.is_some());
        let mut seen = 1 + deque.len();
        while injector.steal().is_success() {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[test]
    fn concurrent_steals_take_each_task_once() {
        let deque = TaskDeque::new();
        for i in 0..10_000 {
            deque.push(Task::<u32>::Root(i));
        }
        let thieves: Vec<_> = (0..4).map(|_| deque.thief()).collect();
        let stolen: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = thieves
                .iter()
                .map(|t| {
                    s.spawn(move || {
                        let mut got = Vec::new();
                        while let Some(Task::Root(i)) = t.steal() {
                            got.push(i);
                        }
                        got
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut all = HashSet::new();
        for i in stolen.into_iter().flatten() {
            assert!(all.insert(i), "task {i} stolen twice");
        }
        while let Some(Task::Root(i)) = deque.pop() {
            assert!(all.insert(i), "task {i} popped after being stolen");
        }
        assert_eq!(all.len(), 10_000);
    }

    #[test]
    fn cancel_token_keeps_first_error() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel(EnumError::Aborted("first".into()));
        token.cancel(EnumError::Aborted("second".into()));
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(EnumError::Aborted("first".into())));
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        thread::spawn(move || clone.cancel(EnumError::Transport("gone".into())))
            .join()
            .unwrap();
        assert_eq!(token.error(), Some(EnumError::Transport("gone".into())));
    }

    #[test]
    fn idle_counter_tracks_all_idle() {
        let idle = IdleCounter::new(2);
        assert!(!idle.all_idle());
        idle.enter();
        idle.enter();
        assert!(idle.all_idle());
        idle.leave();
        assert_eq!(idle.count(), 1);
        assert!(!idle.all_idle());
    }
}
