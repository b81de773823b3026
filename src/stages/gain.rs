//! Gain stage: scales PCM volume with a runtime-mutable factor.

use crate::format::{AudioFormat, Encoding};
use crate::stage::{Chunk, Produce, StageCx};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Control handle for a running gain stage.
///
/// One atomic write per update, one atomic read per chunk: a reader may
/// see at most the previous chunk's stale value, never a torn one.
#[derive(Clone)]
pub struct GainControl {
    factor: Arc<AtomicU32>,
}

impl GainControl {
    pub fn set(&self, factor: f32) {
        self.factor.store(factor.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.factor.load(Ordering::Relaxed))
    }
}

/// Multiplies every sample by the current factor.
///
/// 1.0 is unity (passthrough), 0.0 silence, >1.0 amplifies with
/// saturation.
pub struct Gain {
    format: AudioFormat,
    factor: Arc<AtomicU32>,
}

impl Gain {
    pub fn new(format: AudioFormat, factor: f32) -> (Self, GainControl) {
        let shared = Arc::new(AtomicU32::new(factor.to_bits()));
        let control = GainControl {
            factor: shared.clone(),
        };
        (
            Self {
                format,
                factor: shared,
            },
            control,
        )
    }

    fn apply(&self, chunk: &[u8], factor: f32) -> Chunk {
        match self.format.encoding {
            Encoding::Pcm16Le => chunk
                .chunks_exact(2)
                .flat_map(|pair| {
                    let s = i16::from_le_bytes([pair[0], pair[1]]);
                    let scaled = (s as f32 * factor).clamp(i16::MIN as f32, i16::MAX as f32);
                    (scaled as i16).to_le_bytes()
                })
                .collect(),
            Encoding::Pcm8U => chunk
                .iter()
                .map(|&b| {
                    let s = (b as f32 - 128.0) * factor;
                    (s.clamp(-128.0, 127.0) + 128.0) as u8
                })
                .collect(),
            _ => chunk.to_vec(),
        }
    }
}

impl Produce for Gain {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        let chunk = cx.pull()?;
        let factor = f32::from_bits(self.factor.load(Ordering::Relaxed));
        if factor == 1.0 {
            Some(chunk)
        } else if factor == 0.0 {
            let silence = match self.format.encoding {
                Encoding::Pcm8U => 128u8,
                _ => 0u8,
            };
            Some(vec![silence; chunk.len()])
        } else {
            Some(self.apply(&chunk, factor))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, StageRef, connect};
    use crate::testutil::{ChunkSource, pull_all};

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn gain_chain(chunks: Vec<Chunk>, factor: f32) -> (StageRef, GainControl) {
        let fmt = AudioFormat::pcm16(16000);
        let src = Stage::new("src", Box::new(ChunkSource::new(chunks, Some(fmt))));
        let (gain, control) = Gain::new(fmt, factor);
        let stage = Stage::new("gain", Box::new(gain));
        connect(&src, &stage);
        (stage, control)
    }

    #[test]
    fn test_unity_gain_is_passthrough() {
        let input = bytes(&[100, -200, 300]);
        let (stage, _ctl) = gain_chain(vec![input.clone()], 1.0);
        assert_eq!(pull_all(&stage), vec![input]);
    }

    #[test]
    fn test_zero_gain_emits_silence_of_same_length() {
        let input = bytes(&[100, -200, 300]);
        let (stage, _ctl) = gain_chain(vec![input.clone()], 0.0);
        let out = pull_all(&stage);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), input.len());
        assert!(out[0].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_doubling_gain_saturates() {
        let input = bytes(&[1000, i16::MAX]);
        let (stage, _ctl) = gain_chain(vec![input], 2.0);
        let out = pull_all(&stage);
        assert_eq!(out[0], bytes(&[2000, i16::MAX]));
    }

    #[test]
    fn test_factor_change_applies_on_next_chunk() {
        let a = bytes(&[100]);
        let b = bytes(&[100]);
        let (stage, ctl) = gain_chain(vec![a, b], 1.0);
        assert_eq!(stage.pull(), Some(bytes(&[100])));
        ctl.set(0.5);
        assert_eq!(stage.pull(), Some(bytes(&[50])));
        assert_eq!(ctl.get(), 0.5);
    }

    #[test]
    fn test_u8_gain_scales_around_bias() {
        let fmt = AudioFormat::pcm8(8000);
        let (gain, _ctl) = Gain::new(fmt, 0.5);
        let out = gain.apply(&[128, 228, 28], 0.5);
        assert_eq!(out, vec![128, 178, 78]);
    }
}
