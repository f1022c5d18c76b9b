//! Run statistics: node and item counters, optional retained items, and phase timings.
//!
//! Workers accumulate into a private [`LocalTally`] and flush it once with
//! [`StatsCollector::absorb`]; the shared counters are touched once per worker, not once per
//! node.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

// ============================================================================
// Per-worker tally
// ============================================================================

/// Counts and items gathered by one worker between flushes.
#[derive(Debug)]
pub struct LocalTally<I> {
    nodes_expanded: u64,
    items_found: u64,
    items: Vec<I>,
    retain: bool,
}

impl<I> LocalTally<I> {
    /// Creates an empty tally. Items are kept only if `retain` is set.
    pub fn new(retain: bool) -> Self {
        Self {
            nodes_expanded: 0,
            items_found: 0,
            items: Vec::new(),
            retain,
        }
    }

    /// Counts one call to `expand`.
    #[inline]
    pub fn record_expansion(&mut self) {
        self.nodes_expanded += 1;
    }

    /// Counts one emitted item, keeping it if this tally retains items.
    #[inline]
    pub fn record_item(&mut self, item: I) {
        self.items_found += 1;
        if self.retain {
            self.items.push(item);
        }
    }

    /// Expansions recorded so far.
    pub fn nodes_expanded(&self) -> u64 {
        self.nodes_expanded
    }

    /// Items recorded so far.
    pub fn items_found(&self) -> u64 {
        self.items_found
    }

    /// Consumes the tally and returns its counts and retained items.
    pub fn into_parts(self) -> (u64, u64, Vec<I>) {
        (self.nodes_expanded, self.items_found, self.items)
    }
}

// ============================================================================
// Shared collector
// ============================================================================

#[derive(Debug, Default)]
struct Marks {
    start: OnceLock<Instant>,
    read_done: OnceLock<Instant>,
    run_start: OnceLock<Instant>,
    run_done: OnceLock<Instant>,
}

/// Process-wide statistics sink shared by all workers of a run.
#[derive(Debug)]
pub struct StatsCollector<I> {
    nodes_expanded: CachePadded<AtomicU64>,
    items_found: CachePadded<AtomicU64>,
    retained: Option<Mutex<Vec<I>>>,
    marks: Marks,
}

impl<I> StatsCollector<I> {
    /// Creates a collector and records the start mark.
    pub fn new(retain_items: bool) -> Self {
        let marks = Marks::default();
        let _ = marks.start.set(Instant::now());
        Self {
            nodes_expanded: CachePadded::new(AtomicU64::new(0)),
            items_found: CachePadded::new(AtomicU64::new(0)),
            retained: retain_items.then(|| Mutex::new(Vec::new())),
            marks,
        }
    }

    /// Whether emitted items are kept for the final report.
    pub fn retains_items(&self) -> bool {
        self.retained.is_some()
    }

    /// A fresh tally matching this collector's retention setting.
    pub fn tally(&self) -> LocalTally<I> {
        LocalTally::new(self.retains_items())
    }

    /// Marks the end of input reading. Later calls are ignored.
    pub fn mark_read_done(&self) {
        let _ = self.marks.read_done.set(Instant::now());
    }

    /// Marks the start of the enumeration proper.
    pub fn mark_run_start(&self) {
        let _ = self.marks.run_start.set(Instant::now());
    }

    /// Marks the end of the enumeration.
    pub fn mark_run_done(&self) {
        let _ = self.marks.run_done.set(Instant::now());
    }

    /// Merges a worker's tally.
    pub fn absorb(&self, tally: LocalTally<I>) {
        let (nodes, found, items) = tally.into_parts();
        self.add_counts(nodes, found);
        self.extend_items(items);
    }

    /// Adds raw counts, as received from a remote rank.
    pub fn add_counts(&self, nodes_expanded: u64, items_found: u64) {
        self.nodes_expanded.fetch_add(nodes_expanded, Ordering::Relaxed);
        self.items_found.fetch_add(items_found, Ordering::Relaxed);
    }

    /// Appends items to the retained set; dropped if this collector does not retain.
    pub fn extend_items(&self, items: Vec<I>) {
        if items.is_empty() {
            return;
        }
        if let Some(retained) = &self.retained {
            retained
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(items);
        }
    }

    /// Total expansions so far.
    pub fn nodes_expanded(&self) -> u64 {
        self.nodes_expanded.load(Ordering::Relaxed)
    }

    /// Total items so far.
    pub fn items_found(&self) -> u64 {
        self.items_found.load(Ordering::Relaxed)
    }

    /// Current counters and phase durations. Missing marks count as zero-length phases.
    pub fn snapshot(&self) -> RunStats {
        let start = self.marks.start.get().copied();
        let read_done = self.marks.read_done.get().copied().or(start);
        let run_start = self.marks.run_start.get().copied().or(read_done);
        let run_done = self.marks.run_done.get().copied().or(run_start);
        RunStats {
            reading_time: span(start, read_done),
            setup_time: span(read_done, run_start),
            run_time: span(run_start, run_done),
            items_found: self.items_found(),
            nodes_expanded: self.nodes_expanded(),
        }
    }

    /// Consumes the collector into the final report.
    pub fn into_report(self) -> RunReport<I> {
        let stats = self.snapshot();
        let items = self
            .retained
            .map(|m| m.into_inner().unwrap_or_else(PoisonError::into_inner));
        RunReport { stats, items }
    }
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(a), Some(b)) => b.saturating_duration_since(a),
        _ => Duration::ZERO,
    }
}

// ============================================================================
// Results
// ============================================================================

/// Final counters and timings of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Time from process start to the end of graph loading.
    pub reading_time: Duration,
    /// Time from the end of loading to the start of enumeration.
    pub setup_time: Duration,
    /// Enumeration time.
    pub run_time: Duration,
    /// Number of emitted items.
    pub items_found: u64,
    /// Number of `expand` calls (search tree size).
    pub nodes_expanded: u64,
}

impl RunStats {
    /// Items per millisecond of run time; `0` when the run took no measurable time.
    pub fn items_per_ms(&self) -> f64 {
        let ms = self.run_time.as_secs_f64() * 1e3;
        if ms > 0.0 { self.items_found as f64 / ms } else { 0.0 }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reading time: {} ms", self.reading_time.as_millis())?;
        writeln!(f, "Setup time: {} ms", self.setup_time.as_millis())?;
        writeln!(f, "Run time: {} ms", self.run_time.as_millis())?;
        writeln!(f, "Solutions found: {}", self.items_found)?;
        writeln!(f, "Computational tree size: {}", self.nodes_expanded)?;
        write!(f, "Solutions per ms: {:.6}", self.items_per_ms())
    }
}

/// Statistics plus the retained items, if retention was requested.
#[derive(Debug)]
pub struct RunReport<I> {
    /// Counters and timings.
    pub stats: RunStats,
    /// All emitted items in no particular order; `None` unless retained.
    pub items: Option<Vec<I>>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn tally_keeps_items_only_when_retaining() {
        let mut kept = LocalTally::new(true);
        let mut dropped = LocalTally::new(false);
        for t in [&mut kept, &mut dropped] {
            t.record_expansion();
            t.record_item(vec![1u32, 2]);
        }
        assert_eq!(kept.into_parts(), (1, 1, vec![vec![1, 2]]));
        assert_eq!(dropped.into_parts(), (1, 1, Vec::<Vec<u32>>::new()));
    }

    #[test]
    fn collector_merges_concurrent_tallies() {
        let stats = StatsCollector::<u32>::new(true);
        thread::scope(|s| {
            for w in 0..8u32 {
                let stats = &stats;
                s.spawn(move || {
                    let mut t = stats.tally();
                    for i in 0..100 {
                        t.record_expansion();
                        if i % 10 == 0 {
                            t.record_item(w);
                        }
                    }
                    stats.absorb(t);
                });
            }
        });
        assert_eq!(stats.nodes_expanded(), 800);
        assert_eq!(stats.items_found(), 80);
        let report = stats.into_report();
        assert_eq!(report.items.map(|v| v.len()), Some(80));
    }

    #[test]
    fn non_retaining_collector_reports_no_items() {
        let stats = StatsCollector::<u32>::new(false);
        stats.extend_items(vec![1, 2, 3]);
        stats.add_counts(5, 3);
        let report = stats.into_report();
        assert!(report.items.is_none());
        assert_eq!(report.stats.items_found, 3);
        assert_eq!(report.stats.nodes_expanded, 5);
    }

    #[test]
    fn marks_are_monotone_and_set_once() {
        let stats = StatsCollector::<u32>::new(false);
        stats.mark_read_done();
        stats.mark_run_start();
        thread::sleep(Duration::from_millis(2));
        stats.mark_run_done();
        let first = stats.snapshot();
        stats.mark_run_done();
        assert_eq!(stats.snapshot().run_time, first.run_time);
        assert!(first.run_time >= Duration::from_millis(2));
    }

    #[test]
    fn display_matches_report_layout() {
        let stats = RunStats {
            reading_time: Duration::from_millis(3),
            setup_time: Duration::from_millis(1),
            run_time: Duration::from_millis(4),
            items_found: 2,
            nodes_expanded: 7,
        };
        let text = stats.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Reading time: 3 ms",
                "Setup time: 1 ms",
                "Run time: 4 ms",
                "Solutions found: 2",
                "Computational tree size: 7",
                "Solutions per ms: 0.500000",
            ]
        );
    }

    #[test]
    fn zero_run_time_gives_zero_rate() {
        let stats = RunStats {
            items_found: 10,
            ..RunStats::default()
        };
        assert!(stats.items_per_ms().abs() < f64::EPSILON);
    }
}
