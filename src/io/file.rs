//! WAV file source and recorder stages.

use crate::defaults::SOURCE_CHUNK_MS;
use crate::error::Result;
use crate::format::AudioFormat;
use crate::stage::{Chunk, Produce, StageCx};
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::warn;

/// Streams a WAV file as s16le mono chunks of roughly 100 ms.
///
/// The file is decoded up front; multi-channel input is downmixed by
/// averaging. Output rate is the file's own rate, bridging happens at
/// the link if the sink wants something else.
pub struct FileSource {
    format: AudioFormat,
    chunks: VecDeque<Chunk>,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;
        let mut pcm = Vec::new();
        let mut frame: Vec<i32> = Vec::with_capacity(channels);
        for sample in reader.samples::<i16>() {
            frame.push(sample? as i32);
            if frame.len() == channels {
                let mono = (frame.iter().sum::<i32>() / channels as i32) as i16;
                pcm.extend_from_slice(&mono.to_le_bytes());
                frame.clear();
            }
        }
        let format = AudioFormat::pcm16(spec.sample_rate);
        let chunk_bytes = ((SOURCE_CHUNK_MS as f64 * format.bytes_per_ms()) as usize).max(2) & !1;
        let chunks = pcm.chunks(chunk_bytes).map(<[u8]>::to_vec).collect();
        Ok(Self { format, chunks })
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }
}

impl Produce for FileSource {
    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        if cx.cancelled() {
            return None;
        }
        self.chunks.pop_front()
    }
}

/// Sink that records upstream PCM to a WAV file.
///
/// Writes incrementally and finalizes the header when the stream ends
/// or the stage is cancelled, so a partial file is still playable.
/// Chunks pass through unchanged, which lets the recorder double as a
/// tee side-chain tap.
pub struct FileRecorder {
    format: AudioFormat,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl FileRecorder {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: format.channels.max(1),
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        Ok(Self {
            format,
            writer: Some(hound::WavWriter::create(path.as_ref(), spec)?),
        })
    }

    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            for pair in chunk.chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self, stage_id: &str) {
        if let Some(writer) = self.writer.take()
            && let Err(err) = writer.finalize()
        {
            warn!(stage = stage_id, %err, "failed to finalize recording");
        }
    }
}

impl Produce for FileRecorder {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        match cx.pull() {
            Some(chunk) => {
                if let Err(err) = self.write(&chunk) {
                    warn!(stage = cx.stage_id(), %err, "write failed, stopping recording");
                    self.finalize(cx.stage_id());
                    return None;
                }
                Some(chunk)
            }
            None => {
                self.finalize(cx.stage_id());
                None
            }
        }
    }

    fn on_cancel(&mut self) {
        self.finalize("recorder");
    }
}
