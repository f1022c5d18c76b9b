//! Partitioning of the root index space into contiguous chunks.
//!
//! The coordinator owns a [`ChunkPlan`] and is the only party that advances it, so every root
//! index is granted to exactly one rank.

use std::ops::Range;

use clap::ValueEnum;
use tracing::warn;

/// Order in which chunks are handed out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ChunkOrder {
    /// From the end of the root sequence towards the start.
    #[default]
    Reverse,
    /// From the start of the root sequence.
    Forward,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Mode {
    /// Pull-based: `chunk_size` roots per grant.
    Dynamic { chunk_size: usize, order: ChunkOrder, next: usize },
    /// One fixed range per rank.
    Static { ranges: Vec<Option<Range<usize>>> },
}

/// Cursor over the chunks of `0..root_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    root_count: usize,
    mode: Mode,
}

impl ChunkPlan {
    /// Plans chunks of `chunk_size` roots for `ranks` ranks.
    ///
    /// A chunk size larger than `root_count / ranks` is clamped to that value (at least 1) so that
    /// every rank can receive work. A chunk size of `0` selects static partitioning: one
    /// contiguous range per rank, with the remainder spread over the first ranks.
    pub fn new(root_count: usize, chunk_size: usize, ranks: usize, order: ChunkOrder) -> Self {
        let ranks = ranks.max(1);
        if chunk_size == 0 {
            let base = root_count / ranks;
            let surplus = root_count % ranks;
            let ranges = (0..ranks)
                .map(|r| {
                    let begin = r * base + r.min(surplus);
                    let len = base + usize::from(r < surplus);
                    Some(begin..begin + len)
                })
                .collect();
            return Self {
                root_count,
                mode: Mode::Static { ranges },
            };
        }

        let limit = (root_count / ranks).max(1);
        let chunk_size = if chunk_size > limit {
            warn!(
                requested = chunk_size,
                clamped = limit,
                root_count,
                ranks,
                "chunk size too large for this graph, clamping"
            );
            limit
        } else {
            chunk_size
        };
        Self {
            root_count,
            mode: Mode::Dynamic {
                chunk_size,
                order,
                next: 0,
            },
        }
    }

    /// Total number of roots being partitioned.
    pub fn root_count(&self) -> usize {
        self.root_count
    }

    /// Effective chunk size; `None` for static partitioning.
    pub fn chunk_size(&self) -> Option<usize> {
        match &self.mode {
            Mode::Dynamic { chunk_size, .. } => Some(*chunk_size),
            Mode::Static { .. } => None,
        }
    }

    /// Number of chunks the plan hands out in total.
    pub fn chunk_count(&self) -> usize {
        match &self.mode {
            Mode::Dynamic { chunk_size, .. } => self.root_count.div_ceil(*chunk_size),
            Mode::Static { ranges } => ranges.len(),
        }
    }

    /// Number of chunks granted so far.
    pub fn granted(&self) -> usize {
        match &self.mode {
            Mode::Dynamic { next, .. } => (*next).min(self.chunk_count()),
            Mode::Static { ranges } => ranges.iter().filter(|r| r.is_none()).count(),
        }
    }

    /// Claims the next chunk for `rank`: its sequence number and index range.
    pub fn next_for(&mut self, rank: usize) -> Option<(usize, Range<usize>)> {
        let n = self.root_count;
        match &mut self.mode {
            Mode::Dynamic {
                chunk_size,
                order,
                next,
            } => {
                let i = *next;
                let range = chunk_range(n, *chunk_size, *order, i)?;
                *next += 1;
                Some((i, range))
            }
            Mode::Static { ranges } => {
                let range = ranges.get_mut(rank)?.take()?;
                Some((rank, range))
            }
        }
    }

    /// Returns true once no further chunk will be granted to anyone.
    pub fn is_exhausted(&self) -> bool {
        match &self.mode {
            Mode::Dynamic { next, .. } => *next >= self.chunk_count(),
            Mode::Static { ranges } => ranges.iter().all(Option::is_none),
        }
    }

    /// All chunks in the order they would be granted (static: in rank order).
    pub fn ranges(&self) -> Vec<Range<usize>> {
        match &self.mode {
            Mode::Dynamic {
                chunk_size, order, ..
            } => (0..self.chunk_count())
                .filter_map(|i| chunk_range(self.root_count, *chunk_size, *order, i))
                .collect(),
            Mode::Static { ranges } => ranges.iter().flatten().cloned().collect(),
        }
    }
}

fn chunk_range(n: usize, chunk_size: usize, order: ChunkOrder, i: usize) -> Option<Range<usize>> {
    let offset = i.checked_mul(chunk_size)?;
    if offset >= n {
        return None;
    }
    Some(match order {
        ChunkOrder::Forward => offset..(offset + chunk_size).min(n),
        ChunkOrder::Reverse => {
            let end = n - offset;
            end.saturating_sub(chunk_size)..end
        }
    })
}
