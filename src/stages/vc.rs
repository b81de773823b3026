//! Voice conversion stage.

use crate::defaults::SOURCE_CHUNK_MS;
use crate::error::Result;
use crate::format::AudioFormat;
use crate::services::VoiceConverter;
use crate::stage::{Chunk, Produce, StageCx};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Converts a whole utterance to a target voice via a [`VoiceConverter`].
///
/// The backend works file-to-file, so this stage collects the entire
/// upstream into a temporary WAV, converts it, then streams the result
/// back out in roughly 100 ms chunks. Latency is the full utterance;
/// not suitable for live input.
pub struct VoiceConvertStage {
    converter: Arc<dyn VoiceConverter>,
    voice: String,
    format: AudioFormat,
    collected: Vec<u8>,
    output: VecDeque<Chunk>,
    converted: bool,
}

impl VoiceConvertStage {
    pub fn new(
        converter: Arc<dyn VoiceConverter>,
        voice: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            converter,
            voice: voice.into(),
            format: AudioFormat::pcm16(sample_rate),
            collected: Vec::new(),
            output: VecDeque::new(),
            converted: false,
        }
    }

    fn write_wav(&self, path: &Path) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for pair in self.collected.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
        Ok(())
    }

    fn read_wav(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        if spec.sample_rate != self.format.sample_rate {
            warn!(
                got = spec.sample_rate,
                declared = self.format.sample_rate,
                "converted audio rate differs from declared rate"
            );
        }
        let channels = spec.channels.max(1) as usize;
        let mut out = Vec::new();
        let mut frame: Vec<i32> = Vec::with_capacity(channels);
        for sample in reader.samples::<i16>() {
            frame.push(sample? as i32);
            if frame.len() == channels {
                let mono = (frame.iter().sum::<i32>() / channels as i32) as i16;
                out.extend_from_slice(&mono.to_le_bytes());
                frame.clear();
            }
        }
        Ok(out)
    }

    fn run_conversion(&mut self) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("utterance.wav");
        self.write_wav(&input)?;
        let output = self.converter.convert(&input, &self.voice)?;
        let pcm = self.read_wav(&output)?;
        let chunk_bytes = ((SOURCE_CHUNK_MS as f64 * self.format.bytes_per_ms()) as usize).max(2) & !1;
        for piece in pcm.chunks(chunk_bytes) {
            self.output.push_back(piece.to_vec());
        }
        Ok(())
    }
}

impl Produce for VoiceConvertStage {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        while !self.converted {
            if cx.cancelled() {
                return None;
            }
            match cx.pull() {
                Some(chunk) => self.collected.extend_from_slice(&chunk),
                None => {
                    self.converted = true;
                    if self.collected.is_empty() {
                        return None;
                    }
                    if let Err(err) = self.run_conversion() {
                        warn!(stage = cx.stage_id(), %err, "voice conversion failed");
                        return None;
                    }
                }
            }
        }
        self.output.pop_front()
    }
}
