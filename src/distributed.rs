//! Multi-rank scheduler with a pull-based chunk protocol and inter-rank subtree stealing.
//!
//! Every rank runs a local [`ParallelWorkStealing`] whose work source asks a single coordinator
//! for more work whenever the rank has drained its queues. The coordinator lives on rank 0 as a
//! separate thread and is the only owner of the [`ChunkPlan`], so chunks are granted exactly once.
//!
//! # Protocol
//!
//! ```text
//! rank -> coordinator   Request | Idle{stats} | Retract | Donation{nodes} | Failed{reason}
//! coordinator -> rank   Grant{chunk, begin, end} | Subtree{nodes} | NoMoreWork | Steal
//!                       | Terminate | Abort{reason}
//! ```
//!
//! While chunks remain, a `Request` is answered with a `Grant`. Once the plan is exhausted the
//! requester waits while the coordinator sends `Steal` to a busy rank, picking the one whose last
//! request is oldest. That rank answers with a `Donation` of the oldest tasks in its queues, which
//! the coordinator forwards to the requester as a `Subtree`. If no rank can donate, the requester
//! gets `NoMoreWork`, finishes and reports `Idle` with the counts (and items) gathered since its
//! previous report.
//!
//! Idle ranks stay eligible: the coordinator keeps stealing on their behalf, and a rank that
//! receives a `Subtree` after reporting idle sends `Retract` and becomes active again. The
//! coordinator broadcasts `Terminate` once the plan is exhausted, no steal is in flight and every
//! rank has reported idle. Any failure is reported with `Failed`, after which the coordinator
//! broadcasts `Abort` and the run returns an error.
//!
//! Ranks are either thread groups in one process ([`Substrate::Local`]) or separate processes
//! connected over TCP ([`Substrate::Tcp`], see [`crate::transport`]).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::chunk::{ChunkOrder, ChunkPlan};
use crate::enumerable::{EnumerableSystem, WireItem};
use crate::error::EnumError;
use crate::lockfree::{CancelToken, Task};
use crate::parallel::{Batch, DonationPort, ParallelWorkStealing, WorkSource, panic_message};
use crate::scheduler::Scheduler;
use crate::stats::StatsCollector;
use crate::transport;

/// How long a non-zero rank keeps retrying its initial connection to the coordinator.
pub const CONNECT_PATIENCE: Duration = Duration::from_secs(30);

/// How often the coordinator tries again to find work for idle ranks.
const STEAL_RETRY: Duration = Duration::from_millis(10);

/// Progress is logged each time another `PROGRESS_STEP` percent of the chunks has been granted.
const PROGRESS_STEP: f64 = 2.0;

/// Longest silence between two progress lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Messages
// ============================================================================

/// A protocol message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on a TCP connection: identifies the connecting rank.
    Hello {
        /// Rank of the sender.
        rank: usize,
    },
    /// Asks for more work.
    Request,
    /// A chunk of root indices `begin..end`.
    Grant {
        /// Sequence number of the chunk.
        chunk: usize,
        /// First root index.
        begin: usize,
        /// One past the last root index.
        end: usize,
    },
    /// Search nodes taken from another rank.
    Subtree {
        /// Serialized nodes.
        nodes: Vec<Value>,
    },
    /// Nothing to hand out right now.
    NoMoreWork,
    /// Asks a busy rank to give up some of its queued tasks.
    Steal,
    /// Answer to `Steal`; empty if the rank had nothing to spare.
    Donation {
        /// Serialized nodes.
        nodes: Vec<Value>,
    },
    /// The rank has no work left. Carries what it found since its previous report.
    Idle {
        /// Expansions since the previous report.
        nodes_expanded: u64,
        /// Items since the previous report.
        items_found: u64,
        /// The items themselves, if the run retains them.
        items: Vec<Vec<u64>>,
    },
    /// The rank took on new work after reporting idle.
    Retract,
    /// The rank failed.
    Failed {
        /// Description of the failure.
        reason: String,
    },
    /// Global termination.
    Terminate,
    /// The run is aborted.
    Abort {
        /// Description of the failure that caused the abort.
        reason: String,
    },
}

/// A frame together with the rank that sent it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Sending rank.
    pub from: usize,
    /// The message.
    pub frame: Frame,
}

/// A rank's two channel ends to and from the coordinator.
#[derive(Debug)]
pub struct RankLink {
    /// This rank's index.
    pub rank: usize,
    /// Frames to the coordinator.
    pub to_coordinator: Sender<Envelope>,
    /// Frames from the coordinator.
    pub from_coordinator: Receiver<Frame>,
}

/// The coordinator's inbox and one outbox per rank.
#[derive(Debug)]
pub struct CoordinatorLink {
    /// Frames from every rank.
    pub inbox: Receiver<Envelope>,
    /// `outboxes[r]` delivers to rank `r`.
    pub outboxes: Vec<Sender<Frame>>,
}

/// In-process links for `ranks` ranks.
pub fn local_links(ranks: usize) -> (CoordinatorLink, Vec<RankLink>) {
    let (inbox_tx, inbox) = channel::unbounded();
    let mut outboxes = Vec::with_capacity(ranks);
    let mut links = Vec::with_capacity(ranks);
    for rank in 0..ranks {
        let (tx, rx) = channel::unbounded();
        outboxes.push(tx);
        links.push(RankLink {
            rank,
            to_coordinator: inbox_tx.clone(),
            from_coordinator: rx,
        });
    }
    (CoordinatorLink { inbox, outboxes }, links)
}

fn encode_nodes<S: EnumerableSystem>(
    system: &S,
    tasks: Vec<Task<S::Node>>,
) -> Result<Vec<Value>, EnumError> {
    tasks
        .into_iter()
        .filter_map(|task| match task {
            Task::Root(index) => system.root(index),
            Task::Node(node) => Some(node),
        })
        .map(|node| {
            serde_json::to_value(node)
                .map_err(|e| EnumError::Protocol(format!("could not encode a node: {e}")))
        })
        .collect()
}

fn decode_nodes<N: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<N>, EnumError> {
    values
        .into_iter()
        .map(|value| {
            serde_json::from_value(value)
                .map_err(|e| EnumError::Protocol(format!("malformed node: {e}")))
        })
        .collect()
}

// ============================================================================
// Progress
// ============================================================================

/// How far a run has come, as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    /// Chunks granted so far.
    pub chunks_granted: usize,
    /// Chunks in the plan.
    pub chunk_count: usize,
    /// Expansions reported by idle ranks so far.
    pub nodes_expanded: u64,
    /// Items reported by idle ranks so far.
    pub items_found: u64,
}

impl Progress {
    /// Share of the chunks granted, in percent.
    pub fn percent(&self) -> f64 {
        if self.chunk_count == 0 {
            return 100.0;
        }
        self.chunks_granted as f64 * 100.0 / self.chunk_count as f64
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Processed {:.1}% of the chunks ({}/{}), {} solutions reported",
            self.percent(),
            self.chunks_granted,
            self.chunk_count,
            self.items_found
        )
    }
}

/// Throttle for progress lines.
#[derive(Debug)]
struct ProgressLog {
    next_percent: f64,
    last: Instant,
}

impl ProgressLog {
    fn new(now: Instant) -> Self {
        Self {
            next_percent: PROGRESS_STEP,
            last: now,
        }
    }

    /// Returns true if `progress` is worth a line at `now`.
    fn due(&mut self, progress: &Progress, now: Instant) -> bool {
        let percent = progress.percent();
        if percent >= self.next_percent {
            while self.next_percent <= percent {
                self.next_percent += PROGRESS_STEP;
            }
            self.last = now;
            return true;
        }
        if now.duration_since(self.last) >= PROGRESS_INTERVAL {
            self.last = now;
            return true;
        }
        false
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Per-rank state as seen by the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankState {
    /// Working or waiting for an answer to a request.
    Active,
    /// Reported idle; waiting for termination or stolen work.
    LocallyIdleReported,
    /// Sent a subtree after reporting idle; its `Retract` is still on the way.
    Reactivating,
    /// Termination was broadcast.
    Terminated,
}

/// Merged statistics of all ranks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reduction {
    /// Total expansions.
    pub nodes_expanded: u64,
    /// Total items.
    pub items_found: u64,
    /// Retained items in wire form.
    pub items: Vec<Vec<u64>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingSteal {
    victim: usize,
    thief: usize,
}

/// Owner of the chunk plan, the steal bookkeeping and the termination state machine.
#[derive(Debug)]
pub struct Coordinator {
    plan: ChunkPlan,
    states: Vec<RankState>,
    reduction: Reduction,
    /// Ranks whose request is unanswered, oldest first.
    waiting: VecDeque<usize>,
    /// At most one steal is in flight.
    steal: Option<PendingSteal>,
    /// Ranks that had nothing to donate since the last retry.
    dry: Vec<bool>,
    /// Logical time of each rank's latest request.
    last_request: Vec<u64>,
    clock: u64,
    progress_log: ProgressLog,
}

impl Coordinator {
    /// Creates a coordinator for `ranks` ranks, all active.
    pub fn new(plan: ChunkPlan, ranks: usize) -> Self {
        Self {
            plan,
            states: vec![RankState::Active; ranks],
            reduction: Reduction::default(),
            waiting: VecDeque::new(),
            steal: None,
            dry: vec![false; ranks],
            last_request: vec![0; ranks],
            clock: 0,
            progress_log: ProgressLog::new(Instant::now()),
        }
    }

    /// Current rank states.
    pub fn states(&self) -> &[RankState] {
        &self.states
    }

    /// Chunks granted and results reported so far.
    pub fn progress(&self) -> Progress {
        Progress {
            chunks_granted: self.plan.granted(),
            chunk_count: self.plan.chunk_count(),
            nodes_expanded: self.reduction.nodes_expanded,
            items_found: self.reduction.items_found,
        }
    }

    /// Applies one frame from rank `from`, queueing replies in `outbox`.
    ///
    /// Returns `Ok(true)` once termination has been broadcast.
    ///
    /// # Errors
    /// Returns [`EnumError::RankFailed`] for a `Failed` frame and [`EnumError::Protocol`] for a
    /// frame that is invalid in the sender's state.
    pub fn handle(
        &mut self,
        from: usize,
        frame: Frame,
        outbox: &mut Vec<(usize, Frame)>,
    ) -> Result<bool, EnumError> {
        let Some(&state) = self.states.get(from) else {
            return Err(EnumError::Protocol(format!("frame from unknown rank {from}")));
        };
        let waiting = self.waiting.contains(&from);
        match (frame, state) {
            (Frame::Request, RankState::Active) if !waiting => {
                self.clock += 1;
                self.last_request[from] = self.clock;
                match self.plan.next_for(from) {
                    Some((chunk, range)) => {
                        debug!(rank = from, chunk, begin = range.start, end = range.end, "granting chunk");
                        outbox.push((from, Frame::Grant {
                            chunk,
                            begin: range.start,
                            end: range.end,
                        }));
                        self.log_progress();
                    }
                    None => {
                        self.waiting.push_back(from);
                        self.schedule_steal(outbox);
                    }
                }
                Ok(false)
            }
            (
                Frame::Idle {
                    nodes_expanded,
                    items_found,
                    items,
                },
                RankState::Active,
            ) if !waiting => {
                self.states[from] = RankState::LocallyIdleReported;
                self.reduction.nodes_expanded += nodes_expanded;
                self.reduction.items_found += items_found;
                self.reduction.items.extend(items);
                debug!(rank = from, nodes_expanded, items_found, "rank reported idle");
                if self.try_terminate(outbox) {
                    return Ok(true);
                }
                self.schedule_steal(outbox);
                Ok(false)
            }
            (Frame::Retract, RankState::LocallyIdleReported | RankState::Reactivating) => {
                self.states[from] = RankState::Active;
                Ok(false)
            }
            (Frame::Donation { nodes }, _) if self.steal.is_some_and(|s| s.victim == from) => {
                self.deliver(from, nodes, outbox)?;
                if self.try_terminate(outbox) {
                    return Ok(true);
                }
                self.schedule_steal(outbox);
                Ok(false)
            }
            (Frame::Failed { reason }, _) => Err(EnumError::RankFailed { rank: from, reason }),
            (frame, state) => Err(EnumError::Protocol(format!(
                "unexpected {frame:?} from rank {from} in state {state:?}"
            ))),
        }
    }

    /// Forgets which ranks had nothing to donate and tries again for any rank without work.
    pub fn retry_steals(&mut self, outbox: &mut Vec<(usize, Frame)>) {
        self.dry.fill(false);
        self.schedule_steal(outbox);
    }

    fn deliver(
        &mut self,
        victim: usize,
        nodes: Vec<Value>,
        outbox: &mut Vec<(usize, Frame)>,
    ) -> Result<(), EnumError> {
        let Some(PendingSteal { thief, .. }) = self.steal.take() else {
            return Ok(());
        };
        if nodes.is_empty() {
            trace!(victim, thief, "nothing to steal");
            self.dry[victim] = true;
            return Ok(());
        }
        if let Some(position) = self.waiting.iter().position(|&r| r == thief) {
            self.waiting.remove(position);
        } else if self.states[thief] == RankState::LocallyIdleReported {
            self.states[thief] = RankState::Reactivating;
        } else {
            return Err(EnumError::Protocol(format!(
                "rank {thief} cannot take a subtree in state {:?}",
                self.states[thief]
            )));
        }
        debug!(victim, thief, nodes = nodes.len(), "forwarding subtree");
        outbox.push((thief, Frame::Subtree { nodes }));
        Ok(())
    }

    /// Starts a steal for the longest-waiting requester, or else for an idle rank. Requesters
    /// are told `NoMoreWork` when no rank is left to ask.
    fn schedule_steal(&mut self, outbox: &mut Vec<(usize, Frame)>) {
        if self.steal.is_some() {
            return;
        }
        let thief = self.waiting.front().copied().or_else(|| {
            self.states
                .iter()
                .position(|&s| s == RankState::LocallyIdleReported)
        });
        let Some(thief) = thief else {
            return;
        };
        match self.pick_victim(thief) {
            Some(victim) => {
                trace!(victim, thief, "asking for a subtree");
                self.steal = Some(PendingSteal { victim, thief });
                outbox.push((victim, Frame::Steal));
            }
            None => {
                for rank in self.waiting.drain(..) {
                    outbox.push((rank, Frame::NoMoreWork));
                }
            }
        }
    }

    /// The busy rank whose latest request is oldest.
    fn pick_victim(&self, thief: usize) -> Option<usize> {
        (0..self.states.len())
            .filter(|&r| {
                r != thief
                    && self.states[r] == RankState::Active
                    && !self.dry[r]
                    && !self.waiting.contains(&r)
            })
            .min_by_key(|&r| self.last_request[r])
    }

    fn try_terminate(&mut self, outbox: &mut Vec<(usize, Frame)>) -> bool {
        let all_idle = self
            .states
            .iter()
            .all(|&s| s == RankState::LocallyIdleReported);
        let settled = self.steal.is_none() && self.waiting.is_empty();
        if !(all_idle && settled && self.plan.is_exhausted()) {
            return false;
        }
        for (rank, state) in self.states.iter_mut().enumerate() {
            *state = RankState::Terminated;
            outbox.push((rank, Frame::Terminate));
        }
        info!(
            nodes_expanded = self.reduction.nodes_expanded,
            items_found = self.reduction.items_found,
            "all ranks idle, terminating"
        );
        true
    }

    fn log_progress(&mut self) {
        let progress = self.progress();
        if self.progress_log.due(&progress, Instant::now()) {
            info!(
                chunks_granted = progress.chunks_granted,
                chunk_count = progress.chunk_count,
                items_found = progress.items_found,
                "{progress}"
            );
        }
    }

    /// Serves frames until termination or failure.
    ///
    /// On failure every rank is sent `Abort` before the error is returned.
    ///
    /// # Errors
    /// Returns the failure that ended the run.
    pub fn run(mut self, link: CoordinatorLink) -> Result<Reduction, EnumError> {
        let mut outbox = Vec::new();
        let mut last_retry = Instant::now();
        loop {
            let result = match link.inbox.recv_timeout(STEAL_RETRY) {
                Ok(Envelope { from, frame }) => self.handle(from, frame, &mut outbox),
                Err(RecvTimeoutError::Timeout) => Ok(false),
                Err(RecvTimeoutError::Disconnected) => Err(EnumError::Transport(
                    "every rank disconnected before termination".to_owned(),
                )),
            };
            if matches!(result, Ok(false)) && last_retry.elapsed() >= STEAL_RETRY {
                self.retry_steals(&mut outbox);
                last_retry = Instant::now();
            }
            for (to, frame) in outbox.drain(..) {
                if let Some(tx) = link.outboxes.get(to) {
                    // A rank that already exited cannot be told anything.
                    let _ = tx.send(frame);
                }
            }
            match result {
                Ok(true) => return Ok(self.reduction),
                Ok(false) => {}
                Err(e) => {
                    let reason = e.to_string();
                    for tx in &link.outboxes {
                        let _ = tx.send(Frame::Abort {
                            reason: reason.clone(),
                        });
                    }
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Rank engine
// ============================================================================

type Reply = Result<Frame, EnumError>;

/// Per-rank execution parameters.
#[derive(Clone, Debug)]
pub struct RankParams {
    /// Worker threads of the local scheduler. Also the most tasks given up per steal.
    pub threads: usize,
    /// Seed for victim selection.
    pub seed: Option<u64>,
    /// Whether items are shipped to the coordinator.
    pub retain: bool,
}

/// What one rank did on its own. Items go to the coordinator with each idle report and are not
/// kept here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RankSummary {
    /// Expansions performed by this rank.
    pub nodes_expanded: u64,
    /// Items found by this rank.
    pub items_found: u64,
}

/// Work source that asks the coordinator for chunks or stolen subtrees.
struct ChunkRequester<'a> {
    rank: usize,
    to: &'a Sender<Envelope>,
    replies: &'a Receiver<Reply>,
}

impl<Node: DeserializeOwned> WorkSource<Node> for ChunkRequester<'_> {
    fn next_batch(&self) -> Result<Option<Batch<Node>>, EnumError> {
        send(self.to, self.rank, Frame::Request)?;
        match recv(self.replies)? {
            Frame::Grant { chunk, begin, end } => {
                debug!(rank = self.rank, chunk, begin, end, "chunk received");
                Ok(Some(Batch::Roots(begin..end)))
            }
            Frame::Subtree { nodes } => {
                debug!(rank = self.rank, nodes = nodes.len(), "subtree received");
                Ok(Some(Batch::Nodes(decode_nodes(nodes)?)))
            }
            Frame::NoMoreWork => Ok(None),
            other => Err(EnumError::Protocol(format!(
                "rank {} expected work, got {other:?}",
                self.rank
            ))),
        }
    }
}

/// Yields one preloaded batch before deferring to another source.
struct Preloaded<'a, Node, R: ?Sized> {
    first: Mutex<Option<Batch<Node>>>,
    rest: &'a R,
}

impl<Node: Send, R: WorkSource<Node> + ?Sized> WorkSource<Node> for Preloaded<'_, Node, R> {
    fn next_batch(&self) -> Result<Option<Batch<Node>>, EnumError> {
        let first = self
            .first
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(batch) => Ok(Some(batch)),
            None => self.rest.next_batch(),
        }
    }
}

fn send(to: &Sender<Envelope>, rank: usize, frame: Frame) -> Result<(), EnumError> {
    to.send(Envelope { from: rank, frame })
        .map_err(|_| EnumError::Transport("coordinator is gone".to_owned()))
}

fn recv(replies: &Receiver<Reply>) -> Result<Frame, EnumError> {
    replies
        .recv()
        .map_err(|_| EnumError::Transport("coordinator listener stopped".to_owned()))?
}

/// Receives everything the coordinator sends to one rank.
struct Listener<'a, S: EnumerableSystem> {
    rank: usize,
    system: &'a S,
    port: &'a DonationPort<S::Node>,
    batch: usize,
    from: Receiver<Frame>,
    to: Sender<Envelope>,
    replies: Sender<Reply>,
    cancel: &'a CancelToken,
}

impl<S: EnumerableSystem> Listener<'_, S> {
    /// Answers `Steal` itself and forwards every other frame to the rank's driver. `Abort`,
    /// unexpected frames and disconnects also cancel the local scheduler.
    fn run(self) {
        loop {
            let (reply, last) = match self.from.recv() {
                Ok(Frame::Steal) => match self.donate() {
                    Ok(()) => continue,
                    Err(e) => {
                        self.cancel.cancel(e.clone());
                        (Err(e), true)
                    }
                },
                Ok(Frame::Abort { reason }) => {
                    debug!(rank = self.rank, %reason, "abort received");
                    let e = EnumError::Aborted(reason);
                    self.cancel.cancel(e.clone());
                    (Err(e), true)
                }
                Ok(Frame::Terminate) => (Ok(Frame::Terminate), true),
                Ok(frame @ (Frame::Grant { .. } | Frame::Subtree { .. } | Frame::NoMoreWork)) => {
                    (Ok(frame), false)
                }
                Ok(other) => {
                    let e = EnumError::Protocol(format!("rank {} received {other:?}", self.rank));
                    self.cancel.cancel(e.clone());
                    (Err(e), true)
                }
                Err(_) => {
                    let e = EnumError::Transport("lost connection to the coordinator".to_owned());
                    self.cancel.cancel(e.clone());
                    (Err(e), true)
                }
            };
            if self.replies.send(reply).is_err() || last {
                return;
            }
        }
    }

    fn donate(&self) -> Result<(), EnumError> {
        let nodes = encode_nodes(self.system, self.port.take(self.batch))?;
        trace!(rank = self.rank, nodes = nodes.len(), "donating");
        send(&self.to, self.rank, Frame::Donation { nodes })
    }
}

/// Runs one rank until global termination.
///
/// # Errors
/// Returns the local failure, or [`EnumError::Aborted`] if another rank failed.
pub fn run_rank<S: EnumerableSystem>(
    system: &S,
    params: &RankParams,
    link: RankLink,
) -> Result<RankSummary, EnumError> {
    let RankLink {
        rank,
        to_coordinator,
        from_coordinator,
    } = link;
    let cancel = CancelToken::new();
    let port = DonationPort::new();
    let (reply_tx, reply_rx) = channel::unbounded();

    thread::scope(|scope| {
        let listener = Listener {
            rank,
            system,
            port: &port,
            batch: params.threads.max(1),
            from: from_coordinator,
            to: to_coordinator.clone(),
            replies: reply_tx,
            cancel: &cancel,
        };
        thread::Builder::new()
            .name(format!("parenum-rank-{rank}-listener"))
            .spawn_scoped(scope, move || listener.run())
            .map_err(|e| EnumError::Spawn(e.to_string()))?;

        let outcome = drive(rank, system, params, &port, &to_coordinator, &reply_rx, &cancel);
        if let Err(e) = &outcome {
            if !matches!(e, EnumError::Aborted(_)) {
                let _ = send(&to_coordinator, rank, Frame::Failed {
                    reason: e.to_string(),
                });
            }
        }
        outcome
    })
}

fn drive<S: EnumerableSystem>(
    rank: usize,
    system: &S,
    params: &RankParams,
    port: &DonationPort<S::Node>,
    to: &Sender<Envelope>,
    replies: &Receiver<Reply>,
    cancel: &CancelToken,
) -> Result<RankSummary, EnumError> {
    let mut scheduler = ParallelWorkStealing::new(params.threads);
    if let Some(seed) = params.seed {
        scheduler = scheduler.with_seed(seed ^ (rank as u64).rotate_left(32));
    }
    let requester = ChunkRequester { rank, to, replies };
    let mut summary = RankSummary::default();
    let mut preloaded: Option<Batch<S::Node>> = None;

    loop {
        let phase = StatsCollector::new(params.retain);
        match preloaded.take() {
            Some(batch) => {
                let source = Preloaded {
                    first: Mutex::new(Some(batch)),
                    rest: &requester,
                };
                scheduler.run_with_port(system, &source, &phase, cancel, Some(port))?;
            }
            None => scheduler.run_with_port(system, &requester, &phase, cancel, Some(port))?,
        }

        let report = phase.into_report();
        let items = report.items.unwrap_or_default();
        send(to, rank, Frame::Idle {
            nodes_expanded: report.stats.nodes_expanded,
            items_found: report.stats.items_found,
            items: items.iter().map(WireItem::to_wire).collect(),
        })?;
        summary.nodes_expanded += report.stats.nodes_expanded;
        summary.items_found += report.stats.items_found;
        debug!(rank, nodes_expanded = summary.nodes_expanded, "locally idle");

        let work = match recv(replies)? {
            Frame::Terminate => return Ok(summary),
            Frame::Grant { begin, end, .. } => Batch::Roots(begin..end),
            Frame::Subtree { nodes } => Batch::Nodes(decode_nodes(nodes)?),
            other => {
                return Err(EnumError::Protocol(format!(
                    "rank {rank} expected termination, got {other:?}"
                )));
            }
        };
        send(to, rank, Frame::Retract)?;
        preloaded = Some(work);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Where the ranks of a distributed run live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Substrate {
    /// All ranks are thread groups in this process.
    Local {
        /// Number of ranks.
        ranks: usize,
    },
    /// This process is one rank of a TCP cluster.
    Tcp {
        /// This process's rank; rank 0 hosts the coordinator.
        rank: usize,
        /// Total number of ranks.
        world_size: usize,
        /// Address rank 0 listens on and the others connect to.
        coordinator: String,
    },
}

/// Chunked multi-rank scheduler.
#[derive(Clone, Debug)]
pub struct DistributedChunked {
    substrate: Substrate,
    threads: usize,
    chunk_size: usize,
    order: ChunkOrder,
    seed: Option<u64>,
}

impl DistributedChunked {
    /// Creates a scheduler. `threads` is per rank; `chunk_size == 0` selects static partitioning.
    pub fn new(substrate: Substrate, threads: usize, chunk_size: usize, order: ChunkOrder) -> Self {
        Self {
            substrate,
            threads: threads.max(1),
            chunk_size,
            order,
            seed: None,
        }
    }

    /// Fixes the seed used for victim selection on every rank.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Total number of ranks.
    pub fn world_size(&self) -> usize {
        match &self.substrate {
            Substrate::Local { ranks } => (*ranks).max(1),
            Substrate::Tcp { world_size, .. } => (*world_size).max(1),
        }
    }

    /// Returns true if this process hosts the coordinator.
    pub fn is_coordinator(&self) -> bool {
        match &self.substrate {
            Substrate::Local { .. } => true,
            Substrate::Tcp { rank, .. } => *rank == 0,
        }
    }

    fn params(&self, retain: bool) -> RankParams {
        RankParams {
            threads: self.threads,
            seed: self.seed,
            retain,
        }
    }

    fn plan(&self, root_count: usize) -> ChunkPlan {
        ChunkPlan::new(root_count, self.chunk_size, self.world_size(), self.order)
    }

    fn run_local<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
    ) -> Result<(), EnumError> {
        let ranks = self.world_size();
        let plan = self.plan(system.root_count());
        info!(ranks, chunks = plan.chunk_count(), "starting in-process cluster");
        let (coordinator_link, links) = local_links(ranks);
        let params = self.params(stats.retains_items());

        let reduction = thread::scope(|scope| {
            let coordinator = thread::Builder::new()
                .name("parenum-coordinator".to_owned())
                .spawn_scoped(scope, move || Coordinator::new(plan, ranks).run(coordinator_link))
                .map_err(|e| EnumError::Spawn(e.to_string()))?;

            let mut handles = Vec::with_capacity(ranks);
            for link in links {
                let rank = link.rank;
                let reporter = link.to_coordinator.clone();
                let params = &params;
                let spawned = thread::Builder::new()
                    .name(format!("parenum-rank-{rank}"))
                    .spawn_scoped(scope, move || run_rank(system, params, link));
                match spawned {
                    Ok(handle) => handles.push((rank, handle)),
                    Err(e) => {
                        let _ = send(&reporter, rank, Frame::Failed {
                            reason: format!("could not spawn rank thread: {e}"),
                        });
                    }
                }
            }

            let outcomes: Vec<Result<RankSummary, EnumError>> = handles
                .into_iter()
                .map(|(rank, handle)| {
                    handle.join().unwrap_or_else(|payload| {
                        Err(EnumError::WorkerPanicked {
                            worker: rank,
                            message: panic_message(payload.as_ref()),
                        })
                    })
                })
                .collect();
            let reduction = coordinator.join().unwrap_or_else(|payload| {
                Err(EnumError::WorkerPanicked {
                    worker: 0,
                    message: panic_message(payload.as_ref()),
                })
            })?;
            for outcome in outcomes {
                outcome?;
            }
            Ok::<_, EnumError>(reduction)
        })?;

        absorb_reduction(stats, reduction)
    }

    fn run_tcp_coordinator<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
        address: &str,
    ) -> Result<(), EnumError> {
        let ranks = self.world_size();
        let plan = self.plan(system.root_count());
        let (coordinator_link, local_link, connections) = transport::serve(address, ranks)?;
        info!(ranks, chunks = plan.chunk_count(), %address, "all ranks connected");
        let params = self.params(stats.retains_items());

        let result = thread::scope(|scope| {
            let coordinator = thread::Builder::new()
                .name("parenum-coordinator".to_owned())
                .spawn_scoped(scope, move || Coordinator::new(plan, ranks).run(coordinator_link))
                .map_err(|e| EnumError::Spawn(e.to_string()))?;
            let own = run_rank(system, &params, local_link);
            let reduction = coordinator.join().unwrap_or_else(|payload| {
                Err(EnumError::WorkerPanicked {
                    worker: 0,
                    message: panic_message(payload.as_ref()),
                })
            })?;
            own?;
            Ok::<_, EnumError>(reduction)
        });
        connections.join();
        absorb_reduction(stats, result?)
    }

    fn run_tcp_rank<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
        rank: usize,
        address: &str,
    ) -> Result<(), EnumError> {
        let (link, connections) = transport::connect(address, rank, CONNECT_PATIENCE)?;
        info!(rank, %address, "connected to coordinator");
        let outcome = run_rank(system, &self.params(stats.retains_items()), link);
        connections.join();
        let summary = outcome?;
        stats.add_counts(summary.nodes_expanded, summary.items_found);
        Ok(())
    }
}

fn absorb_reduction<I: WireItem>(
    stats: &StatsCollector<I>,
    reduction: Reduction,
) -> Result<(), EnumError> {
    stats.add_counts(reduction.nodes_expanded, reduction.items_found);
    if stats.retains_items() {
        let items = reduction
            .items
            .iter()
            .map(|words| {
                I::from_wire(words).ok_or_else(|| {
                    EnumError::Protocol(format!("item {words:?} does not fit the vertex id type"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        stats.extend_items(items);
    }
    Ok(())
}

impl Scheduler for DistributedChunked {
    fn name(&self) -> &'static str {
        "distributed"
    }

    fn run<S: EnumerableSystem>(
        &self,
        system: &S,
        stats: &StatsCollector<S::Item>,
    ) -> Result<(), EnumError> {
        match &self.substrate {
            Substrate::Local { .. } => self.run_local(system, stats),
            Substrate::Tcp {
                rank: 0,
                coordinator,
                ..
            } => self.run_tcp_coordinator(system, stats, coordinator),
            Substrate::Tcp {
                rank, coordinator, ..
            } => self.run_tcp_rank(system, stats, *rank, coordinator),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
