//! Auto-inserted format converters: encoding (u8 <-> s16le) and sample
//! rate. These carry synthetic identity only — the DSL author never
//! names them and introspection does not list them as user stages.

use crate::format::Encoding;
use crate::stage::{Chunk, Produce, StageCx};
use tracing::debug;

/// Converts between audio encodings, preserving rate and channel count.
pub struct EncodingConvert {
    from: Encoding,
    to: Encoding,
}

impl EncodingConvert {
    pub fn new(from: Encoding, to: Encoding) -> Self {
        Self { from, to }
    }

    fn convert(&self, data: &[u8]) -> Chunk {
        match (self.from, self.to) {
            (Encoding::Pcm8U, Encoding::Pcm16Le) => data
                .iter()
                .flat_map(|&b| {
                    let s = ((b as i16) - 128) << 8;
                    s.to_le_bytes()
                })
                .collect(),
            (Encoding::Pcm16Le, Encoding::Pcm8U) => data
                .chunks_exact(2)
                .map(|pair| {
                    let s = i16::from_le_bytes([pair[0], pair[1]]);
                    ((s >> 8) + 128) as u8
                })
                .collect(),
            // Same encoding (or non-audio slipping through): passthrough.
            _ => data.to_vec(),
        }
    }
}

impl Produce for EncodingConvert {
    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        let chunk = cx.pull()?;
        Some(self.convert(&chunk))
    }
}

/// Resamples s16le mono PCM with linear interpolation.
///
/// Stateful across chunks: the last sample and the fractional read
/// position carry over so chunk boundaries introduce no discontinuity.
pub struct Resample {
    src_rate: u32,
    dst_rate: u32,
    // Fractional index into [prev, chunk...]; starts at 1.0 so the
    // first output sample is the first real input sample.
    pos: f64,
    prev: i16,
    started: bool,
}

impl Resample {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            src_rate,
            dst_rate,
            pos: 1.0,
            prev: 0,
            started: false,
        }
    }

    fn resample(&mut self, input: &[i16]) -> Vec<i16> {
        let ratio = self.src_rate as f64 / self.dst_rate as f64;
        let mut buf = Vec::with_capacity(input.len() + 1);
        buf.push(self.prev);
        buf.extend_from_slice(input);
        let max = (buf.len() - 1) as f64;
        let mut out = Vec::with_capacity((input.len() as f64 / ratio) as usize + 2);
        let mut pos = self.pos;
        while pos < max {
            let i = pos as usize;
            let frac = pos - i as f64;
            let a = buf[i] as f64;
            let b = buf[i + 1] as f64;
            out.push((a + (b - a) * frac).round() as i16);
            pos += ratio;
        }
        self.pos = pos - max;
        if let Some(&last) = input.last() {
            self.prev = last;
        }
        out
    }
}

impl Produce for Resample {
    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        if self.src_rate == self.dst_rate {
            return cx.pull();
        }
        if !self.started {
            debug!(from = self.src_rate, to = self.dst_rate, "resampling");
            self.started = true;
        }
        // A short chunk can resample to nothing; keep pulling until we
        // have output or the upstream ends.
        loop {
            if cx.cancelled() {
                return None;
            }
            let chunk = cx.pull()?;
            let samples: Vec<i16> = chunk
                .chunks_exact(2)
                .map(|p| i16::from_le_bytes([p[0], p[1]]))
                .collect();
            let out = self.resample(&samples);
            if !out.is_empty() {
                return Some(out.iter().flat_map(|s| s.to_le_bytes()).collect());
            }
        }
    }
}
