//! TCP substrate for distributed runs.
//!
//! Rank 0 listens on the coordinator address and accepts one connection from every other rank.
//! Each connection carries newline-delimited JSON [`Frame`]s in both directions; the first frame
//! a rank sends is `Hello { rank }`. The sockets are driven by a small tokio runtime owned by
//! [`Connections`]. Reader tasks feed incoming frames into the same channel links the coordinator
//! and the rank engines use in-process; writer tasks drain the outgoing channels.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::distributed::{CoordinatorLink, Envelope, Frame, RankLink};
use crate::error::EnumError;

const RETRY_DELAY: Duration = Duration::from_millis(100);

type FrameLines = Lines<BufReader<OwnedReadHalf>>;

/// The I/O runtime and the tasks serving the open connections.
#[must_use = "joining makes sure every queued frame is written"]
pub struct Connections {
    runtime: Runtime,
    tasks: Vec<JoinHandle<()>>,
}

impl Connections {
    /// Waits until every connection has been closed by both ends.
    pub fn join(self) {
        let Self { runtime, tasks } = self;
        runtime.block_on(async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "connection task failed");
                }
            }
        });
    }
}

fn io_runtime() -> Result<Runtime, EnumError> {
    Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("parenum-io")
        .enable_all()
        .build()
        .map_err(|e| EnumError::Spawn(format!("io runtime: {e}")))
}

fn transport_error(context: &str, e: &std::io::Error) -> EnumError {
    EnumError::Transport(format!("{context}: {e}"))
}

/// Encodes one frame as a JSON line, terminator included.
///
/// # Errors
/// Returns [`EnumError::Protocol`] if the frame cannot be encoded.
pub fn encode_frame(frame: &Frame) -> Result<String, EnumError> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| EnumError::Protocol(format!("could not encode {frame:?}: {e}")))?;
    line.push('\n');
    Ok(line)
}

/// Decodes one JSON line.
///
/// # Errors
/// Returns [`EnumError::Protocol`] on a malformed line.
pub fn decode_frame(line: &str) -> Result<Frame, EnumError> {
    let line = line.trim_end();
    serde_json::from_str(line).map_err(|e| EnumError::Protocol(format!("malformed frame {line:?}: {e}")))
}

/// Moves messages from a blocking channel into the writer task.
fn spawn_pump<T: Send + 'static>(
    outgoing: Receiver<T>,
    frame_of: fn(T) -> Frame,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pump = tokio::task::spawn_blocking(move || {
        for message in outgoing {
            if tx.send(frame_of(message)).is_err() {
                return;
            }
        }
    });
    (pump, rx)
}

async fn write_frames(half: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Frame>) {
    let mut out = BufWriter::new(half);
    while let Some(frame) = frames.recv().await {
        let line = match encode_frame(&frame) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "could not send frame");
                break;
            }
        };
        let written = match out.write_all(line.as_bytes()).await {
            Ok(()) => out.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(error = %e, "could not send frame");
            break;
        }
    }
    let _ = out.shutdown().await;
}

/// Feeds frames from rank `rank` into the coordinator's inbox. A connection that ends or breaks
/// is reported as a failure of that rank; after termination nobody is listening any more.
async fn read_rank(rank: usize, mut lines: FrameLines, inbox: Sender<Envelope>) {
    loop {
        let frame = match lines.next_line().await {
            Ok(Some(line)) => decode_frame(&line).unwrap_or_else(|e| Frame::Failed {
                reason: e.to_string(),
            }),
            Ok(None) => Frame::Failed {
                reason: "connection closed".to_owned(),
            },
            Err(e) => Frame::Failed {
                reason: e.to_string(),
            },
        };
        let last = matches!(frame, Frame::Failed { .. });
        if inbox.send(Envelope { from: rank, frame }).is_err() || last {
            return;
        }
    }
}

/// Feeds frames from the coordinator to a rank. The channel closes with the connection.
async fn read_coordinator(mut lines: FrameLines, to_rank: Sender<Frame>) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(frame) => {
                    if to_rank.send(frame).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping coordinator connection");
                    return;
                }
            },
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "dropping coordinator connection");
                return;
            }
        }
    }
}

/// Listens on `address` and accepts `world_size - 1` ranks.
///
/// Returns the coordinator's link, rank 0's own link, and the connections.
///
/// # Errors
/// Returns [`EnumError::Transport`] if the address cannot be bound or a connection fails, and
/// [`EnumError::Protocol`] if a rank introduces itself with an invalid or duplicate rank.
pub fn serve(
    address: &str,
    world_size: usize,
) -> Result<(CoordinatorLink, RankLink, Connections), EnumError> {
    let runtime = io_runtime()?;
    let (inbox_tx, inbox) = channel::unbounded();
    let (local_tx, local_rx) = channel::unbounded();

    let (outboxes, tasks) = runtime.block_on(async {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| transport_error(&format!("bind {address}"), &e))?;
        info!(%address, expected = world_size.saturating_sub(1), "waiting for ranks");

        let mut outboxes: Vec<Option<Sender<Frame>>> = vec![None; world_size.max(1)];
        outboxes[0] = Some(local_tx);
        let mut tasks = Vec::with_capacity(3 * world_size);

        for _ in 1..world_size {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| transport_error("accept", &e))?;
            let _ = stream.set_nodelay(true);
            let (read, write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let hello = lines
                .next_line()
                .await
                .map_err(|e| transport_error("read hello", &e))?;
            let rank = match hello.as_deref().map(decode_frame).transpose()? {
                Some(Frame::Hello { rank }) => rank,
                Some(other) => {
                    return Err(EnumError::Protocol(format!(
                        "{peer} sent {other:?} before introducing itself"
                    )));
                }
                None => {
                    return Err(EnumError::Protocol(format!(
                        "{peer} closed the connection before introducing itself"
                    )));
                }
            };
            let slot = match outboxes.get_mut(rank) {
                Some(slot) if rank != 0 && slot.is_none() => slot,
                _ => {
                    return Err(EnumError::Protocol(format!(
                        "{peer} claims rank {rank}, which is out of range or taken"
                    )));
                }
            };
            let (tx, rx) = channel::unbounded();
            *slot = Some(tx);
            let (pump, frames) = spawn_pump(rx, |frame| frame);
            tasks.push(pump);
            tasks.push(tokio::spawn(write_frames(write, frames)));
            tasks.push(tokio::spawn(read_rank(rank, lines, inbox_tx.clone())));
            debug!(rank, %peer, "rank connected");
        }
        Ok::<_, EnumError>((outboxes, tasks))
    })?;

    let outboxes = outboxes
        .into_iter()
        .enumerate()
        .map(|(rank, slot)| {
            slot.ok_or_else(|| EnumError::Protocol(format!("rank {rank} never connected")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let local = RankLink {
        rank: 0,
        to_coordinator: inbox_tx,
        from_coordinator: local_rx,
    };
    Ok((
        CoordinatorLink { inbox, outboxes },
        local,
        Connections { runtime, tasks },
    ))
}

/// Connects rank `rank` to the coordinator at `address`, retrying for up to `patience` while the
/// coordinator is starting.
///
/// # Errors
/// Returns [`EnumError::Transport`] if no connection could be made.
pub fn connect(
    address: &str,
    rank: usize,
    patience: Duration,
) -> Result<(RankLink, Connections), EnumError> {
    let runtime = io_runtime()?;
    let (to_coordinator, outgoing) = channel::unbounded::<Envelope>();
    let (incoming, from_coordinator) = channel::unbounded();

    let tasks = runtime.block_on(async {
        let deadline = tokio::time::Instant::now() + patience;
        let stream = loop {
            match TcpStream::connect(address).await {
                Ok(stream) => break stream,
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!(%address, error = %e, "coordinator not reachable yet");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(transport_error(
                        &format!("could not reach coordinator at {address}"),
                        &e,
                    ));
                }
            }
        };
        let _ = stream.set_nodelay(true);
        let (read, mut write) = stream.into_split();
        write
            .write_all(encode_frame(&Frame::Hello { rank })?.as_bytes())
            .await
            .map_err(|e| transport_error("send hello", &e))?;

        let (pump, frames) = spawn_pump(outgoing, |envelope| envelope.frame);
        Ok::<_, EnumError>(vec![
            pump,
            tokio::spawn(write_frames(write, frames)),
            tokio::spawn(read_coordinator(BufReader::new(read).lines(), incoming)),
        ])
    })?;

    Ok((
        RankLink {
            rank,
            to_coordinator,
            from_coordinator,
        },
        Connections { runtime, tasks },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    use crate::chunk::ChunkOrder;
    use crate::distributed::{DistributedChunked, Substrate};
    use crate::enumerable::{EnumerableSystem, Expansion};
    use crate::error::ExpandError;
    use crate::scheduler::Scheduler;
    use crate::stats::StatsCollector;

    #[test]
    fn frames_are_newline_terminated_json() {
        let line = encode_frame(&Frame::Grant { chunk: 2, begin: 10, end: 20 }).unwrap();
        assert_eq!(line, "{\"kind\":\"grant\",\"chunk\":2,\"begin\":10,\"end\":20}\n");
        assert_eq!(decode_frame(&line).unwrap(), Frame::Grant { chunk: 2, begin: 10, end: 20 });
        assert_eq!(decode_frame("{\"kind\":\"steal\"}").unwrap(), Frame::Steal);
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        assert!(matches!(decode_frame("{\"kind\":\"bogus\"}\n"), Err(EnumError::Protocol(_))));
        assert!(matches!(decode_frame("not json"), Err(EnumError::Protocol(_))));
    }

    /// Root `i` emits `[i]` directly.
    struct Singletons(usize);

    impl EnumerableSystem for Singletons {
        type Node = u32;
        type Item = Vec<u32>;

        fn name(&self) -> &'static str {
            "singletons"
        }

        fn root_count(&self) -> usize {
            self.0
        }

        fn root(&self, index: usize) -> Option<u32> {
            Some(index as u32)
        }

        fn expand(&self, node: u32, out: &mut Expansion<u32, Vec<u32>>) -> Result<(), ExpandError> {
            out.emit(vec![node]);
            Ok(())
        }
    }

    fn free_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    #[test]
    fn impostor_rank_is_rejected() {
        let address = free_address();
        let result = thread::scope(|scope| {
            let server = scope.spawn(|| serve(&address, 2).map(|_| ()));
            let mut stream = loop {
                match std::net::TcpStream::connect(&address) {
                    Ok(stream) => break stream,
                    Err(_) => thread::sleep(RETRY_DELAY),
                }
            };
            stream.write_all(b"{\"kind\":\"hello\",\"rank\":5}\n").unwrap();
            server.join().unwrap()
        });
        assert!(matches!(result, Err(EnumError::Protocol(_))), "{result:?}");
    }

    #[test]
    fn two_processes_worth_of_ranks_over_loopback() {
        let address = free_address();
        let system = Singletons(25);
        let world_size = 3;

        let (coordinator, others) = thread::scope(|scope| {
            let others: Vec<_> = (1..world_size)
                .map(|rank| {
                    let address = address.clone();
                    let system = &system;
                    scope.spawn(move || {
                        let scheduler = DistributedChunked::new(
                            Substrate::Tcp {
                                rank,
                                world_size,
                                coordinator: address,
                            },
                            2,
                            3,
                            ChunkOrder::Reverse,
                        );
                        let stats = StatsCollector::new(true);
                        scheduler.run(system, &stats).map(|()| stats.items_found())
                    })
                })
                .collect();
            let scheduler = DistributedChunked::new(
                Substrate::Tcp {
                    rank: 0,
                    world_size,
                    coordinator: address.clone(),
                },
                2,
                3,
                ChunkOrder::Reverse,
            );
            let stats = StatsCollector::new(true);
            scheduler.run(&system, &stats).unwrap();
            let others: Vec<u64> = others
                .into_iter()
                .map(|h| h.join().unwrap().unwrap())
                .collect();
            (stats, others)
        });

        let mut items = coordinator.into_report().items.unwrap();
        items.sort();
        assert_eq!(items, (0..25u32).map(|i| vec![i]).collect::<Vec<_>>());
        // Non-zero ranks only know their own share.
        assert!(others.iter().sum::<u64>() <= 25);
    }
}
