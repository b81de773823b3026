//! Delay line: adds a runtime-mutable lag to a PCM stream.

use crate::format::AudioFormat;
use crate::stage::{Chunk, Produce, StageCx};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Control handle for a running delay line.
#[derive(Clone)]
pub struct DelayControl {
    target_ms: Arc<AtomicU64>,
}

impl DelayControl {
    /// Sets the target delay. The output lag converges toward the new
    /// target within a few chunks; 0 flushes the buffer immediately.
    pub fn set_ms(&self, ms: u64) {
        self.target_ms.store(ms, Ordering::Relaxed);
    }

    pub fn get_ms(&self) -> u64 {
        self.target_ms.load(Ordering::Relaxed)
    }
}

/// Variable-length ring buffer of chunks.
///
/// Each incoming chunk is appended; chunks are emitted from the front
/// while the buffered byte count exceeds the target, so a target change
/// adjusts the lag gradually instead of jumping. Target 0 is pure
/// passthrough.
pub struct DelayLine {
    format: AudioFormat,
    target_ms: Arc<AtomicU64>,
    bytes_per_ms: f64,
    buf: VecDeque<Chunk>,
    buffered: usize,
    draining: bool,
}

impl DelayLine {
    pub fn new(format: AudioFormat, delay_ms: u64) -> (Self, DelayControl) {
        let shared = Arc::new(AtomicU64::new(delay_ms));
        let control = DelayControl {
            target_ms: shared.clone(),
        };
        (
            Self {
                format,
                target_ms: shared,
                bytes_per_ms: format.bytes_per_ms(),
                buf: VecDeque::new(),
                buffered: 0,
                draining: false,
            },
            control,
        )
    }

    fn target_bytes(&self) -> usize {
        let ms = self.target_ms.load(Ordering::Relaxed);
        // Keep s16le sample alignment.
        (ms as f64 * self.bytes_per_ms) as usize & !1
    }

    fn pop(&mut self) -> Option<Chunk> {
        let chunk = self.buf.pop_front()?;
        self.buffered -= chunk.len();
        Some(chunk)
    }
}

impl Produce for DelayLine {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if self.draining {
                return self.pop();
            }
            if self.buffered > self.target_bytes()
                && let Some(chunk) = self.pop()
            {
                return Some(chunk);
            }
            match cx.pull() {
                Some(chunk) => {
                    self.buffered += chunk.len();
                    self.buf.push_back(chunk);
                }
                None => {
                    // Flush whatever is still buffered on stream end.
                    self.draining = true;
                }
            }
        }
    }
}
