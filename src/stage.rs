//! Stage abstraction: pull-based pipeline nodes with automatic format
//! bridging and cooperative cancellation.
//!
//! A stage is a node with at most one upstream and one downstream
//! neighbor. Data flows bottom-up: a terminal consumer pulls the last
//! stage, which pulls its upstream, and so on. `connect` is the
//! composition operator and inserts converter stages when the declared
//! formats on either side of a link differ.

use crate::convert::{EncodingConvert, Resample};
use crate::format::{AudioFormat, Encoding};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A chunk of stream data: PCM bytes, one UTF-8 text line, or NDJSON
/// event bytes, depending on the stage boundary's declared format.
pub type Chunk = Vec<u8>;

/// Queue item for fan-in/fan-out handoffs. `None` is the end marker.
pub type FeedItem = Option<Chunk>;

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Locks a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The computation behind a stage.
///
/// `produce` returns the next chunk, pulling from the upstream neighbor
/// through the context as needed. The sequence is single-pass and
/// non-restartable: after `None` the stage is exhausted. Implementations
/// must check `cx.cancelled()` between chunks in any internal wait loop,
/// with a bounded sleep so cancellation is noticed promptly.
pub trait Produce: Send {
    /// Declared input format, if any. Absent means "accepts anything".
    fn input_format(&self) -> Option<AudioFormat> {
        None
    }

    /// Declared output format, if any.
    fn output_format(&self) -> Option<AudioFormat> {
        None
    }

    /// Produces the next chunk, or `None` at end of stream.
    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk>;

    /// Teardown hook, invoked once when the owning stage is cancelled.
    fn on_cancel(&mut self) {}
}

struct Links {
    upstream: Option<StageRef>,
    // Weak so a chain never forms a reference cycle: stages are dropped
    // when the owning pipeline discards its stage list.
    downstream: Option<Weak<Stage>>,
}

/// A node in the pipeline graph.
pub struct Stage {
    id: String,
    kind: String,
    cancelled: AtomicBool,
    exhausted: AtomicBool,
    links: Mutex<Links>,
    inner: Mutex<Box<dyn Produce>>,
    input_format: Option<AudioFormat>,
    output_format: Option<AudioFormat>,
}

pub type StageRef = Arc<Stage>;

impl Stage {
    /// Wraps a computation in a stage node with a synthetic id.
    pub fn new(kind: impl Into<String>, inner: Box<dyn Produce>) -> StageRef {
        let kind = kind.into();
        let n = NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed);
        let input_format = inner.input_format();
        let output_format = inner.output_format();
        Arc::new(Stage {
            id: format!("{kind}-{n:04x}"),
            kind,
            cancelled: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            links: Mutex::new(Links {
                upstream: None,
                downstream: None,
            }),
            inner: Mutex::new(inner),
            input_format,
            output_format,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn input_format(&self) -> Option<AudioFormat> {
        self.input_format
    }

    pub fn output_format(&self) -> Option<AudioFormat> {
        self.output_format
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn upstream(&self) -> Option<StageRef> {
        lock(&self.links).upstream.clone()
    }

    pub fn downstream(&self) -> Option<StageRef> {
        lock(&self.links).downstream.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_upstream(&self, up: Option<StageRef>) {
        lock(&self.links).upstream = up;
    }

    pub(crate) fn set_downstream(&self, down: Option<&StageRef>) {
        lock(&self.links).downstream = down.map(Arc::downgrade);
    }

    /// Marks the stage cancelled without propagating to neighbors.
    /// Used when a stage is spliced out of a live chain.
    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_links(&self) {
        let mut links = lock(&self.links);
        links.upstream = None;
        links.downstream = None;
    }

    /// Pulls the next chunk from this stage.
    ///
    /// Returns `None` once the stage is exhausted or cancelled; further
    /// calls keep returning `None`.
    pub fn pull(self: &Arc<Self>) -> Option<Chunk> {
        if self.exhausted.load(Ordering::Acquire) || self.is_cancelled() {
            return None;
        }
        let chunk = {
            let mut inner = lock(&self.inner);
            let cx = StageCx { stage: self };
            inner.produce(&cx)
        };
        if chunk.is_none() {
            self.exhausted.store(true, Ordering::Release);
        }
        chunk
    }

    /// Cancels this stage and propagates to both neighbors.
    ///
    /// Idempotent: the flag flips exactly once and each neighbor is
    /// cancelled exactly once. Neighbor flags are raised before this
    /// stage's teardown hook runs so any produce loop blocked upstream
    /// unwinds promptly.
    pub fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(stage = %self.id, "cancelling");
        let (up, down) = {
            let links = lock(&self.links);
            (
                links.upstream.clone(),
                links.downstream.as_ref().and_then(Weak::upgrade),
            )
        };
        if let Some(up) = up {
            up.cancel();
        }
        if let Some(down) = down {
            down.cancel();
        }
        self.run_on_cancel();
    }

    /// Runs the teardown hook with a bounded wait for the inner lock.
    ///
    /// An in-flight produce call may hold the lock (e.g. a blocking
    /// transport read); it completes or times out before the stage
    /// notices cancellation, so waiting is bounded in practice. If the
    /// lock is still held after the deadline the hook is skipped.
    fn run_on_cancel(&self) {
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match self.inner.try_lock() {
                Ok(mut inner) => {
                    inner.on_cancel();
                    return;
                }
                Err(TryLockError::Poisoned(p)) => {
                    p.into_inner().on_cancel();
                    return;
                }
                Err(TryLockError::WouldBlock) => {}
            }
            if Instant::now() >= deadline {
                warn!(stage = %self.id, "teardown hook skipped: stage busy past deadline");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Pull context handed to `Produce::produce`.
pub struct StageCx<'a> {
    stage: &'a StageRef,
}

impl StageCx<'_> {
    /// Pulls one chunk from the upstream neighbor.
    ///
    /// The link is re-read on every pull, so a neighbor spliced in or
    /// out of a live chain takes effect on the next chunk.
    pub fn pull(&self) -> Option<Chunk> {
        let up = self.stage.upstream();
        match up {
            Some(up) => up.pull(),
            None => None,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.stage.is_cancelled()
    }

    pub fn stage_id(&self) -> &str {
        self.stage.id()
    }
}

/// Wires `up -> down` directly, without format bridging.
pub(crate) fn link(up: &StageRef, down: &StageRef) {
    up.set_downstream(Some(down));
    down.set_upstream(Some(up.clone()));
}

/// Connects two stages, auto-inserting converters when their declared
/// audio formats differ. Returns the downstream stage.
///
/// If either side declares no format, or either format is non-audio,
/// the stages are wired directly.
pub fn connect(up: &StageRef, down: &StageRef) -> StageRef {
    if let (Some(src), Some(dst)) = (up.output_format(), down.input_format())
        && src != dst
        && src.is_audio()
        && dst.is_audio()
    {
        let converters = converter_chain(src, dst);
        if !converters.is_empty() {
            debug!(
                from = ?src,
                to = ?dst,
                inserted = converters.len(),
                "auto-inserted converters"
            );
            let mut cur = up.clone();
            for conv in converters {
                link(&cur, &conv);
                cur = conv;
            }
            link(&cur, down);
            return down.clone();
        }
    }
    link(up, down);
    down.clone()
}

/// Builds the converter stages bridging `src -> dst`.
///
/// The rate converter is defined over signed 16-bit samples only, so
/// when both the encoding and the rate differ the encoding conversion
/// is staged around it with s16le as the canonical intermediate.
fn converter_chain(src: AudioFormat, dst: AudioFormat) -> Vec<StageRef> {
    let mut chain = Vec::new();
    let need_encode = src.encoding != dst.encoding;
    let need_resample =
        src.sample_rate != dst.sample_rate && src.sample_rate > 0 && dst.sample_rate > 0;

    if need_encode && need_resample {
        if src.encoding != Encoding::Pcm16Le {
            chain.push(Stage::new(
                "convert",
                Box::new(EncodingConvert::new(src.encoding, Encoding::Pcm16Le)),
            ));
        }
        chain.push(Stage::new(
            "convert",
            Box::new(Resample::new(src.sample_rate, dst.sample_rate)),
        ));
        if dst.encoding != Encoding::Pcm16Le {
            chain.push(Stage::new(
                "convert",
                Box::new(EncodingConvert::new(Encoding::Pcm16Le, dst.encoding)),
            ));
        }
    } else if need_encode {
        chain.push(Stage::new(
            "convert",
            Box::new(EncodingConvert::new(src.encoding, dst.encoding)),
        ));
    } else if need_resample {
        chain.push(Stage::new(
            "convert",
            Box::new(Resample::new(src.sample_rate, dst.sample_rate)),
        ));
    }
    chain
}

/// Default terminal drive loop: pulls and discards until exhaustion.
pub fn drain(stage: &StageRef) {
    while stage.pull().is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ChunkSource, Passthrough, pull_all};
    use std::sync::atomic::AtomicUsize;

    fn walk_upstream(stage: &StageRef) -> Vec<String> {
        let mut kinds = Vec::new();
        let mut cur = stage.upstream();
        while let Some(s) = cur {
            kinds.push(s.kind().to_string());
            cur = s.upstream();
        }
        kinds
    }

    #[test]
    fn test_connect_matching_formats_inserts_nothing() {
        let fmt = AudioFormat::pcm16(16000);
        let a = Stage::new("src", Box::new(ChunkSource::new(vec![], Some(fmt))));
        let b = Stage::new("sink", Box::new(Passthrough::new(Some(fmt))));
        connect(&a, &b);
        assert_eq!(walk_upstream(&b), vec!["src"]);
    }

    #[test]
    fn test_connect_rate_mismatch_inserts_one_converter() {
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![], Some(AudioFormat::pcm16(48000)))),
        );
        let b = Stage::new(
            "sink",
            Box::new(Passthrough::new(Some(AudioFormat::pcm16(16000)))),
        );
        connect(&a, &b);
        assert_eq!(walk_upstream(&b), vec!["convert", "src"]);
    }

    #[test]
    fn test_connect_encoding_mismatch_inserts_one_converter() {
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![], Some(AudioFormat::pcm8(16000)))),
        );
        let b = Stage::new(
            "sink",
            Box::new(Passthrough::new(Some(AudioFormat::pcm16(16000)))),
        );
        connect(&a, &b);
        assert_eq!(walk_upstream(&b), vec!["convert", "src"]);
    }

    #[test]
    fn test_connect_both_mismatch_stages_encoding_around_resampler() {
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![], Some(AudioFormat::pcm8(48000)))),
        );
        let b = Stage::new(
            "sink",
            Box::new(Passthrough::new(Some(AudioFormat::pcm8(16000)))),
        );
        connect(&a, &b);
        // u8 -> s16le, resample, s16le -> u8
        assert_eq!(walk_upstream(&b), vec!["convert", "convert", "convert", "src"]);
    }

    #[test]
    fn test_connect_non_audio_wires_directly() {
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![], Some(AudioFormat::text()))),
        );
        let b = Stage::new(
            "sink",
            Box::new(Passthrough::new(Some(AudioFormat::event()))),
        );
        connect(&a, &b);
        assert_eq!(walk_upstream(&b), vec!["src"]);
    }

    #[test]
    fn test_connect_absent_format_wires_directly() {
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![], Some(AudioFormat::pcm16(48000)))),
        );
        let b = Stage::new("sink", Box::new(Passthrough::new(None)));
        connect(&a, &b);
        assert_eq!(walk_upstream(&b), vec!["src"]);
    }

    #[test]
    fn test_pull_is_single_pass() {
        let src = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![vec![1u8], vec![2u8]], None)),
        );
        assert_eq!(src.pull(), Some(vec![1u8]));
        assert_eq!(src.pull(), Some(vec![2u8]));
        assert_eq!(src.pull(), None);
        // Exhausted: stays empty even though the inner source is naive.
        assert_eq!(src.pull(), None);
    }

    #[test]
    fn test_cancel_propagates_to_whole_chain() {
        let stages: Vec<StageRef> = (0..5)
            .map(|i| {
                if i == 0 {
                    Stage::new("src", Box::new(ChunkSource::new(vec![], None)))
                } else {
                    Stage::new("mid", Box::new(Passthrough::new(None)))
                }
            })
            .collect();
        for pair in stages.windows(2) {
            connect(&pair[0], &pair[1]);
        }
        // Cancel from the middle; all five must end up cancelled.
        stages[2].cancel();
        for s in &stages {
            assert!(s.is_cancelled(), "stage {} not cancelled", s.id());
        }
    }

    #[test]
    fn test_cancel_is_idempotent() {
        struct CountingCancel(Arc<AtomicUsize>);
        impl Produce for CountingCancel {
            fn produce(&mut self, _cx: &StageCx<'_>) -> Option<Chunk> {
                None
            }
            fn on_cancel(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let count = Arc::new(AtomicUsize::new(0));
        let a = Stage::new("a", Box::new(CountingCancel(count.clone())));
        let b = Stage::new("b", Box::new(Passthrough::new(None)));
        connect(&a, &b);
        a.cancel();
        b.cancel();
        a.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_stage_stops_producing() {
        let src = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![vec![1u8], vec![2u8]], None)),
        );
        assert_eq!(src.pull(), Some(vec![1u8]));
        src.cancel();
        assert_eq!(src.pull(), None);
    }

    #[test]
    fn test_converted_chain_bridges_formats_end_to_end() {
        // 8 samples of s16le at 32kHz down to 16kHz: expect roughly half.
        let samples: Vec<u8> = (0i16..8)
            .flat_map(|s| (s * 1000).to_le_bytes())
            .collect();
        let a = Stage::new(
            "src",
            Box::new(ChunkSource::new(
                vec![samples],
                Some(AudioFormat::pcm16(32000)),
            )),
        );
        let b = Stage::new(
            "sink",
            Box::new(Passthrough::new(Some(AudioFormat::pcm16(16000)))),
        );
        connect(&a, &b);
        let out: usize = pull_all(&b).iter().map(Vec::len).sum();
        assert!(out > 0 && out <= 10, "unexpected output length {out}");
        assert_eq!(out % 2, 0);
    }
}
