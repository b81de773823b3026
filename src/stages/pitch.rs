//! Pitch shift by resampling without changing the declared rate.

use crate::format::AudioFormat;
use crate::stage::{Chunk, Produce, StageCx};

/// Shifts pitch by a number of semitones (fractional allowed).
///
/// Resamples each chunk by `2^(semitones/12)` while keeping the declared
/// sample rate, so the pitch moves and the duration changes with it.
/// Shifts smaller than 0.05 semitones pass chunks through untouched.
pub struct PitchShift {
    format: AudioFormat,
    ratio: f64,
    passthrough: bool,
    prev: i16,
    started: bool,
    pos: f64,
}

impl PitchShift {
    pub fn new(format: AudioFormat, semitones: f64) -> Self {
        let ratio = 2f64.powf(semitones / 12.0);
        Self {
            format,
            ratio,
            passthrough: semitones.abs() < 0.05,
            prev: 0,
            started: false,
            pos: 1.0,
        }
    }

    fn shift(&mut self, chunk: &[u8]) -> Chunk {
        let mut samples: Vec<i16> = Vec::with_capacity(chunk.len() / 2 + 1);
        if self.started {
            samples.push(self.prev);
        }
        samples.extend(
            chunk
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );
        if samples.is_empty() {
            return Vec::new();
        }
        let last = samples[samples.len() - 1];

        let mut out = Vec::new();
        // Walking the input faster than 1.0 raises pitch, slower lowers it.
        while self.pos + 1.0 < samples.len() as f64 {
            let idx = self.pos.floor() as usize;
            let frac = self.pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[idx + 1] as f64;
            let v = (a + (b - a) * frac).round() as i16;
            out.extend_from_slice(&v.to_le_bytes());
            self.pos += self.ratio;
        }
        self.pos -= (samples.len() - 1) as f64;
        self.prev = last;
        self.started = true;
        out
    }
}

impl Produce for PitchShift {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            let chunk = cx.pull()?;
            if self.passthrough {
                return Some(chunk);
            }
            let out = self.shift(&chunk);
            if !out.is_empty() {
                return Some(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, connect};
    use crate::testutil::{ChunkSource, pull_all};

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_tiny_shift_is_passthrough() {
        let fmt = AudioFormat::pcm16(16000);
        let input = bytes(&[1, 2, 3, 4]);
        let src = Stage::new(
            "src",
            Box::new(ChunkSource::new(vec![input.clone()], Some(fmt))),
        );
        let stage = Stage::new("pitch", Box::new(PitchShift::new(fmt, 0.0)));
        connect(&src, &stage);
        assert_eq!(pull_all(&stage), vec![input]);
    }

    #[test]
    fn test_octave_up_halves_sample_count() {
        let fmt = AudioFormat::pcm16(16000);
        let input = bytes(&(0..200).collect::<Vec<i16>>());
        let src = Stage::new("src", Box::new(ChunkSource::new(vec![input], Some(fmt))));
        let stage = Stage::new("pitch", Box::new(PitchShift::new(fmt, 12.0)));
        connect(&src, &stage);
        let out: usize = pull_all(&stage).iter().map(|c| c.len()).sum();
        let samples = out / 2;
        assert!((95..=105).contains(&samples), "got {samples} samples");
    }

    #[test]
    fn test_octave_down_doubles_sample_count() {
        let fmt = AudioFormat::pcm16(16000);
        let input = bytes(&(0..200).collect::<Vec<i16>>());
        let src = Stage::new("src", Box::new(ChunkSource::new(vec![input], Some(fmt))));
        let stage = Stage::new("pitch", Box::new(PitchShift::new(fmt, -12.0)));
        connect(&src, &stage);
        let out: usize = pull_all(&stage).iter().map(|c| c.len()).sum();
        let samples = out / 2;
        assert!((395..=405).contains(&samples), "got {samples} samples");
    }

    #[test]
    fn test_declared_format_is_unchanged() {
        let fmt = AudioFormat::pcm16(24000);
        let shift = PitchShift::new(fmt, 5.0);
        assert_eq!(shift.input_format(), Some(fmt));
        assert_eq!(shift.output_format(), Some(fmt));
    }
}
