//! AudioTee: one-producer-to-many-consumers fan-out.
//!
//! Every chunk pulled from upstream is copied, non-blocking, into each
//! registered side-chain queue and raw feed queue, then passed through
//! unmodified. A full queue drops the copy for that consumer only; the
//! primary path never blocks. Each side-chain consumer runs its own
//! drive loop in a dedicated worker thread.

use crate::defaults::{END_MARKER_TIMEOUT, QUEUE_CAPACITY, WORKER_JOIN_DEADLINE};
use crate::format::AudioFormat;
use crate::stage::{Chunk, FeedItem, Produce, StageCx, StageRef, connect, drain, lock};
use crate::stages::queue_source::QueueSource;
use crate::stage::Stage;
use crossbeam_channel::{Sender, bounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct SideChain {
    id: u64,
    tx: Sender<FeedItem>,
    sink: StageRef,
    started: bool,
}

struct Feed {
    id: u64,
    tx: Sender<FeedItem>,
}

struct TeeState {
    sidechains: Vec<SideChain>,
    feeds: Vec<Feed>,
    workers: Vec<JoinHandle<()>>,
    streaming: bool,
    finished: bool,
}

/// Pass-through stage that duplicates its stream to side-chain
/// consumers and raw feed queues.
pub struct AudioTee {
    format: AudioFormat,
    state: Mutex<TeeState>,
    next_id: AtomicU64,
    drops: AtomicU64,
}

impl AudioTee {
    pub fn new(format: AudioFormat) -> Arc<Self> {
        Arc::new(Self {
            format,
            state: Mutex::new(TeeState {
                sidechains: Vec::new(),
                feeds: Vec::new(),
                workers: Vec::new(),
                streaming: false,
                finished: false,
            }),
            next_id: AtomicU64::new(1),
            drops: AtomicU64::new(0),
        })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Total chunks dropped across all consumers because of full queues.
    pub fn dropped_chunks(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Registers a sink chain as a side-chain consumer.
    ///
    /// The sink is fed through a queue source wired with `connect` (so
    /// format bridging applies) and driven by a dedicated worker
    /// thread. If the tee is already streaming the worker starts
    /// immediately; otherwise it starts when streaming begins.
    pub fn add_sidechain(&self, sink: StageRef) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        let source = Stage::new("feed", Box::new(QueueSource::new(rx, Some(self.format))));
        connect(&source, &sink);
        let mut state = lock(&self.state);
        let mut chain = SideChain {
            id,
            tx,
            sink,
            started: false,
        };
        if state.streaming {
            let handle = spawn_sidechain_worker(&mut chain);
            state.workers.push(handle);
        }
        state.sidechains.push(chain);
        id
    }

    /// Removes a side-chain consumer, delivering its end marker. The
    /// worker exits on its own once the queue drains.
    pub fn remove_sidechain(&self, id: u64) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let before = state.sidechains.len();
            let mut taken = None;
            state.sidechains.retain(|c| {
                if c.id == id {
                    taken = Some(c.tx.clone());
                    false
                } else {
                    true
                }
            });
            debug_assert!(state.sidechains.len() <= before);
            taken
        };
        match removed {
            Some(tx) => {
                // End marker outside the lock.
                let _ = tx.send_timeout(None, END_MARKER_TIMEOUT);
                true
            }
            None => {
                warn!(sidechain = id, "side-chain not found for removal");
                false
            }
        }
    }

    /// Registers a raw feed queue (e.g. a named mixer's input).
    pub fn add_feed(&self, tx: Sender<FeedItem>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.state).feeds.push(Feed { id, tx });
        id
    }

    /// Removes a raw feed queue, delivering its end marker.
    pub fn remove_feed(&self, id: u64) -> bool {
        let removed = {
            let mut state = lock(&self.state);
            let mut taken = None;
            state.feeds.retain(|f| {
                if f.id == id {
                    taken = Some(f.tx.clone());
                    false
                } else {
                    true
                }
            });
            taken
        };
        match removed {
            Some(tx) => {
                let _ = tx.send_timeout(None, END_MARKER_TIMEOUT);
                true
            }
            None => {
                warn!(feed = id, "feed not found for removal");
                false
            }
        }
    }

    /// Marks the tee streaming and starts workers for side-chains
    /// registered before the first chunk.
    fn ensure_streaming(&self) {
        let mut state = lock(&self.state);
        if state.streaming || state.finished {
            return;
        }
        state.streaming = true;
        let mut handles = Vec::new();
        for chain in state.sidechains.iter_mut() {
            if !chain.started {
                handles.push(spawn_sidechain_worker(chain));
            }
        }
        state.workers.extend(handles);
    }

    /// Copies a chunk to every queue without blocking; drops per
    /// consumer on full.
    fn fan_out(&self, chunk: &Chunk) {
        let targets: Vec<Sender<FeedItem>> = {
            let state = lock(&self.state);
            state
                .sidechains
                .iter()
                .map(|c| c.tx.clone())
                .chain(state.feeds.iter().map(|f| f.tx.clone()))
                .collect()
        };
        // Bulk copies happen outside the lock.
        for tx in targets {
            if tx.try_send(Some(chunk.clone())).is_err() {
                self.drops.fetch_add(1, Ordering::Relaxed);
                warn!("tee queue full, dropping chunk");
            }
        }
    }

    /// Sends end markers everywhere and joins workers against a
    /// deadline. Unresponsive workers are abandoned, not waited on.
    fn finish(&self) {
        let (txs, workers) = {
            let mut state = lock(&self.state);
            if state.finished {
                return;
            }
            state.finished = true;
            state.streaming = false;
            let txs: Vec<Sender<FeedItem>> = state
                .sidechains
                .iter()
                .map(|c| c.tx.clone())
                .chain(state.feeds.iter().map(|f| f.tx.clone()))
                .collect();
            (txs, std::mem::take(&mut state.workers))
        };
        for tx in txs {
            let _ = tx.send_timeout(None, END_MARKER_TIMEOUT);
        }
        join_with_deadline(workers, WORKER_JOIN_DEADLINE);
    }

    fn cancel_sidechains(&self) {
        let sinks: Vec<StageRef> = {
            let state = lock(&self.state);
            state.sidechains.iter().map(|c| c.sink.clone()).collect()
        };
        for sink in sinks {
            sink.cancel();
        }
    }
}

fn spawn_sidechain_worker(chain: &mut SideChain) -> JoinHandle<()> {
    chain.started = true;
    let sink = chain.sink.clone();
    let id = chain.id;
    thread::spawn(move || {
        debug!(sidechain = id, "side-chain worker started");
        drain(&sink);
        debug!(sidechain = id, "side-chain worker finished");
    })
}

/// Joins worker threads, polling, until all finish or the deadline
/// passes; remaining handles are dropped (threads die with the process).
pub(crate) fn join_with_deadline(mut handles: Vec<JoinHandle<()>>, deadline: Duration) {
    let until = Instant::now() + deadline;
    let poll = Duration::from_millis(20);
    loop {
        let mut remaining = Vec::new();
        for handle in handles.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("worker thread panicked");
                }
            } else {
                remaining.push(handle);
            }
        }
        if remaining.is_empty() {
            return;
        }
        if Instant::now() >= until {
            warn!(stuck = remaining.len(), "abandoning unresponsive workers");
            return;
        }
        handles = remaining;
        thread::sleep(poll);
    }
}

/// `Produce` front for a shared tee.
pub struct TeeStage {
    tee: Arc<AudioTee>,
}

impl TeeStage {
    pub fn new(tee: Arc<AudioTee>) -> Self {
        Self { tee }
    }
}

impl Produce for TeeStage {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.tee.format())
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.tee.format())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        self.tee.ensure_streaming();
        match cx.pull() {
            Some(chunk) => {
                self.tee.fan_out(&chunk);
                Some(chunk)
            }
            None => {
                self.tee.finish();
                None
            }
        }
    }

    fn on_cancel(&mut self) {
        self.tee.finish();
        self.tee.cancel_sidechains();
    }
}
