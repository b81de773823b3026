//! AudioMixer: merges N independently-paced PCM inputs into one
//! fixed-frame-rate s16le output.
//!
//! Each input is a bounded queue fed by an `AudioTee` feed or directly
//! by application code. Inputs finishing at different times contribute
//! silence; the mixer runs until every input has delivered its end
//! marker. Inputs can be added or removed while streaming; with zero
//! inputs the mixer poll-waits instead of emitting empty frames.

use crate::defaults::QUEUE_CAPACITY;
use crate::format::AudioFormat;
use crate::stage::{Chunk, FeedItem, Produce, StageCx, lock};
use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

struct MixSlot {
    id: u64,
    rx: Receiver<FeedItem>,
    buffer: Vec<u8>,
    finished: bool,
}

/// Handle for one registered mixer input.
///
/// Push chunks through `sender()`; push `None` (or drop every sender
/// clone) to signal end of stream for this slot.
pub struct MixerInput {
    id: u64,
    tx: Sender<FeedItem>,
}

impl MixerInput {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> Sender<FeedItem> {
        self.tx.clone()
    }
}

/// Many-producers-to-one-consumer fan-in combinator.
pub struct AudioMixer {
    name: String,
    sample_rate: u32,
    frame_ms: u32,
    frame_bytes: usize,
    slots: Mutex<Vec<MixSlot>>,
    next_id: AtomicU64,
    started: AtomicU64,
}

impl AudioMixer {
    pub fn new(name: impl Into<String>, sample_rate: u32, frame_ms: u32) -> Arc<Self> {
        let frame_bytes = (sample_rate as usize * frame_ms as usize / 1000) * 2;
        Arc::new(Self {
            name: name.into(),
            sample_rate,
            frame_ms,
            frame_bytes,
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            started: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn output_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.sample_rate)
    }

    /// Registers an input slot, before or during streaming.
    pub fn add_input(&self) -> MixerInput {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(QUEUE_CAPACITY);
        lock(&self.slots).push(MixSlot {
            id,
            rx,
            buffer: Vec::new(),
            finished: false,
        });
        debug!(mixer = %self.name, input = id, "input added");
        MixerInput { id, tx }
    }

    /// Removes an input by id, discarding its buffered data.
    ///
    /// All inputs removed mid-stream returns the mixer to its initial
    /// wait-for-first-input state; only end markers terminate it.
    pub fn remove_input(&self, id: u64) -> bool {
        let mut slots = lock(&self.slots);
        let before = slots.len();
        slots.retain(|s| s.id != id);
        let removed = slots.len() < before;
        if removed {
            debug!(mixer = %self.name, input = id, remaining = slots.len(), "input removed");
        } else {
            warn!(mixer = %self.name, input = id, "input not found for removal");
        }
        removed
    }

    pub fn input_count(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Produces the next mixed frame, or `None` once every slot has
    /// finished and less than one frame of data remains buffered.
    fn next_frame(&self, cx: &StageCx<'_>) -> Option<Chunk> {
        if self.started.swap(1, Ordering::Relaxed) == 0 {
            info!(
                mixer = %self.name,
                rate = self.sample_rate,
                frame_ms = self.frame_ms,
                "mixer starting"
            );
        }
        let frame_sleep = Duration::from_millis(self.frame_ms.max(1) as u64);
        loop {
            if cx.cancelled() {
                return None;
            }
            {
                let mut slots = lock(&self.slots);
                if !slots.is_empty() {
                    // Drain everything currently available, never blocking.
                    for slot in slots.iter_mut() {
                        if slot.finished {
                            continue;
                        }
                        loop {
                            match slot.rx.try_recv() {
                                Ok(Some(chunk)) => slot.buffer.extend_from_slice(&chunk),
                                Ok(None) | Err(TryRecvError::Disconnected) => {
                                    slot.finished = true;
                                    debug!(mixer = %self.name, input = slot.id, "input finished");
                                    break;
                                }
                                Err(TryRecvError::Empty) => break,
                            }
                        }
                    }

                    let all_done = slots.iter().all(|s| s.finished);
                    let buffered: usize = slots.iter().map(|s| s.buffer.len()).sum();
                    if all_done && buffered < self.frame_bytes {
                        info!(mixer = %self.name, "mixer done");
                        return None;
                    }
                    let has_frame = slots.iter().any(|s| s.buffer.len() >= self.frame_bytes);
                    if has_frame || all_done {
                        return Some(self.mix_frame(&mut slots, all_done));
                    }
                }
            }
            // No input registered yet, or no full frame available: poll.
            thread::sleep(frame_sleep);
        }
    }

    /// Takes one frame from each slot (silence where short) and sums
    /// them with saturating sample-wise addition. When every slot has
    /// finished, partial residues are drained too (padded with silence)
    /// so the tail cannot loop forever below one frame.
    fn mix_frame(&self, slots: &mut [MixSlot], drain_partials: bool) -> Chunk {
        let samples = self.frame_bytes / 2;
        let mut acc = vec![0i16; samples];
        for slot in slots.iter_mut() {
            if slot.buffer.is_empty()
                || (slot.buffer.len() < self.frame_bytes && !drain_partials)
            {
                continue;
            }
            let take = slot.buffer.len().min(self.frame_bytes);
            let frame: Vec<u8> = slot.buffer.drain(..take).collect();
            for (a, pair) in acc.iter_mut().zip(frame.chunks_exact(2)) {
                let s = i16::from_le_bytes([pair[0], pair[1]]);
                *a = a.saturating_add(s);
            }
        }
        acc.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// `Produce` front for a (possibly shared, named) mixer.
pub struct MixerSource {
    mixer: Arc<AudioMixer>,
}

impl MixerSource {
    pub fn new(mixer: Arc<AudioMixer>) -> Self {
        Self { mixer }
    }
}

impl Produce for MixerSource {
    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.mixer.output_format())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        self.mixer.next_frame(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, StageRef};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn mixer_stage(mixer: &Arc<AudioMixer>) -> StageRef {
        Stage::new("mix", Box::new(MixerSource::new(mixer.clone())))
    }

    fn frame_of(mixer: &AudioMixer, sample: i16) -> Vec<u8> {
        let samples = mixer.frame_bytes / 2;
        (0..samples).flat_map(|_| sample.to_le_bytes()).collect()
    }

    #[test]
    fn test_zero_inputs_never_emits() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let stage = mixer_stage(&mixer);
        let emitted = Arc::new(AtomicUsize::new(0));
        let emitted2 = emitted.clone();
        let stage2 = stage.clone();
        let handle = thread::spawn(move || {
            while stage2.pull().is_some() {
                emitted2.fetch_add(1, Ordering::SeqCst);
            }
        });
        thread::sleep(Duration::from_millis(80));
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
        stage.cancel();
        handle.join().expect("drain thread panicked");
        assert_eq!(emitted.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_single_input_emits_exactly_k_frames() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let input = mixer.add_input();
        let tx = input.sender();
        for _ in 0..3 {
            tx.send(Some(frame_of(&mixer, 100))).expect("send");
        }
        tx.send(None).expect("eof");

        let stage = mixer_stage(&mixer);
        let mut frames = Vec::new();
        while let Some(f) = stage.pull() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], frame_of(&mixer, 100));
    }

    #[test]
    fn test_short_input_contributes_silence_after_it_ends() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let a = mixer.add_input();
        let b = mixer.add_input();
        for _ in 0..3 {
            a.sender().send(Some(frame_of(&mixer, 100))).expect("send a");
        }
        a.sender().send(None).expect("eof a");
        b.sender().send(Some(frame_of(&mixer, 25))).expect("send b");
        b.sender().send(None).expect("eof b");

        let stage = mixer_stage(&mixer);
        let mut frames = Vec::new();
        while let Some(f) = stage.pull() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], frame_of(&mixer, 125));
        assert_eq!(frames[1], frame_of(&mixer, 100));
        assert_eq!(frames[2], frame_of(&mixer, 100));
    }

    #[test]
    fn test_saturating_addition() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let a = mixer.add_input();
        let b = mixer.add_input();
        a.sender().send(Some(frame_of(&mixer, i16::MAX))).expect("send");
        a.sender().send(None).expect("eof");
        b.sender().send(Some(frame_of(&mixer, 1000))).expect("send");
        b.sender().send(None).expect("eof");

        let stage = mixer_stage(&mixer);
        let frame = stage.pull().expect("one frame");
        assert_eq!(frame, frame_of(&mixer, i16::MAX));
        assert_eq!(stage.pull(), None);
    }

    #[test]
    fn test_disconnected_sender_counts_as_end_marker() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let input = mixer.add_input();
        let tx = input.sender();
        tx.send(Some(frame_of(&mixer, 7))).expect("send");
        drop(tx);
        drop(input);

        let stage = mixer_stage(&mixer);
        assert_eq!(stage.pull(), Some(frame_of(&mixer, 7)));
        assert_eq!(stage.pull(), None);
    }

    #[test]
    fn test_hot_plug_input_mid_stream() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let a = mixer.add_input();
        a.sender().send(Some(frame_of(&mixer, 10))).expect("send");

        let stage = mixer_stage(&mixer);
        assert_eq!(stage.pull(), Some(frame_of(&mixer, 10)));

        // Register a second input while streaming.
        let b = mixer.add_input();
        b.sender().send(Some(frame_of(&mixer, 5))).expect("send");
        a.sender().send(Some(frame_of(&mixer, 10))).expect("send");
        a.sender().send(None).expect("eof a");
        b.sender().send(None).expect("eof b");

        assert_eq!(stage.pull(), Some(frame_of(&mixer, 15)));
        assert_eq!(stage.pull(), None);
    }

    #[test]
    fn test_remove_input_discards_buffered_data() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let a = mixer.add_input();
        let b = mixer.add_input();
        a.sender().send(Some(frame_of(&mixer, 10))).expect("send");
        a.sender().send(None).expect("eof");
        b.sender().send(Some(frame_of(&mixer, 99))).expect("send");
        assert!(mixer.remove_input(b.id()));
        assert!(!mixer.remove_input(b.id()));

        let stage = mixer_stage(&mixer);
        assert_eq!(stage.pull(), Some(frame_of(&mixer, 10)));
        assert_eq!(stage.pull(), None);
    }

    #[test]
    fn test_waits_rather_than_spinning_for_partial_frames() {
        let mixer = AudioMixer::new("m", 8000, 10);
        let input = mixer.add_input();
        let tx = input.sender();
        // Half a frame now, the rest shortly after.
        let half = frame_of(&mixer, 50);
        let (first, second) = half.split_at(half.len() / 2);
        tx.send(Some(first.to_vec())).expect("send");
        let second = second.to_vec();
        let tx2 = tx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            tx2.send(Some(second)).expect("send");
            tx2.send(None).expect("eof");
        });

        let stage = mixer_stage(&mixer);
        let start = Instant::now();
        assert_eq!(stage.pull(), Some(frame_of(&mixer, 50)));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(stage.pull(), None);
    }
}
