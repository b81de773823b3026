//! Speech-to-text stage.

use crate::defaults::{STT_CHUNK_SECONDS, STT_SAMPLE_RATE};
use crate::format::AudioFormat;
use crate::services::Transcriber;
use crate::stage::{Chunk, Produce, StageCx};
use crate::stages::events::encode_events;
use std::sync::Arc;
use tracing::warn;

/// Segments upstream PCM and emits transcript events as NDJSON chunks.
///
/// Buffers `chunk_seconds` of s16le 16 kHz audio, hands each segment to
/// the [`Transcriber`], and shifts the returned event times by the
/// segment's offset into the stream. The remainder is flushed when the
/// upstream ends.
pub struct SttStage {
    stt: Arc<dyn Transcriber>,
    segment_samples: usize,
    buf: Vec<i16>,
    consumed_samples: u64,
    draining: bool,
}

impl SttStage {
    pub fn new(stt: Arc<dyn Transcriber>, chunk_seconds: f64) -> Self {
        let seconds = if chunk_seconds > 0.0 {
            chunk_seconds
        } else {
            STT_CHUNK_SECONDS
        };
        Self {
            stt,
            segment_samples: (seconds * STT_SAMPLE_RATE as f64) as usize,
            buf: Vec::new(),
            consumed_samples: 0,
            draining: false,
        }
    }

    fn take_segment(&mut self, all: bool) -> Option<Vec<i16>> {
        if self.buf.is_empty() {
            return None;
        }
        if all {
            return Some(std::mem::take(&mut self.buf));
        }
        if self.buf.len() < self.segment_samples {
            return None;
        }
        let rest = self.buf.split_off(self.segment_samples);
        Some(std::mem::replace(&mut self.buf, rest))
    }

    fn transcribe(&mut self, segment: &[i16], cx: &StageCx<'_>) -> Option<Chunk> {
        let offset = self.consumed_samples as f64 / STT_SAMPLE_RATE as f64;
        self.consumed_samples += segment.len() as u64;
        let mut events = match self.stt.transcribe(segment) {
            Ok(events) => events,
            Err(err) => {
                warn!(stage = cx.stage_id(), %err, "transcription failed, skipping segment");
                return None;
            }
        };
        if events.is_empty() {
            return None;
        }
        for event in &mut events {
            event.start += offset;
            event.end += offset;
        }
        match encode_events(&events) {
            Ok(chunk) => Some(chunk),
            Err(err) => {
                warn!(stage = cx.stage_id(), %err, "event encoding failed");
                None
            }
        }
    }
}

impl Produce for SttStage {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::pcm16(STT_SAMPLE_RATE))
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::event())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if let Some(segment) = self.take_segment(self.draining)
                && let Some(chunk) = self.transcribe(&segment, cx)
            {
                return Some(chunk);
            }
            if self.draining {
                return None;
            }
            match cx.pull() {
                Some(chunk) => {
                    self.buf.extend(
                        chunk
                            .chunks_exact(2)
                            .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
                    );
                }
                None => self.draining = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MockTranscriber;
    use crate::stage::{Stage, connect};
    use crate::stages::events::TranscriptEvent;
    use crate::testutil::{ChunkSource, pull_all};

    fn pcm_seconds(seconds: f64) -> Chunk {
        let samples = (seconds * STT_SAMPLE_RATE as f64) as usize;
        vec![0u8; samples * 2]
    }

    fn parse(chunk: &[u8]) -> Vec<TranscriptEvent> {
        String::from_utf8_lossy(chunk)
            .lines()
            .map(|l| serde_json::from_str(l).expect("event"))
            .collect()
    }

    fn stt_chain(chunks: Vec<Chunk>, seconds: f64) -> crate::stage::StageRef {
        let fmt = AudioFormat::pcm16(STT_SAMPLE_RATE);
        let src = Stage::new("src", Box::new(ChunkSource::new(chunks, Some(fmt))));
        let stage = Stage::new(
            "stt",
            Box::new(SttStage::new(Arc::new(MockTranscriber::new("seg")), seconds)),
        );
        connect(&src, &stage);
        stage
    }

    #[test]
    fn test_segments_and_offsets_times() {
        // 2.5 s of audio with 1 s segments: two full segments plus a
        // 0.5 s remainder flushed at end.
        let stage = stt_chain(vec![pcm_seconds(2.5)], 1.0);
        let out = pull_all(&stage);
        assert_eq!(out.len(), 3);
        let second = parse(&out[1]);
        assert!((second[0].start - 1.0).abs() < 1e-9);
        assert!((second[0].end - 2.0).abs() < 1e-9);
        let tail = parse(&out[2]);
        assert!((tail[0].start - 2.0).abs() < 1e-9);
        assert!((tail[0].end - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_short_stream_flushed_as_one_segment() {
        let stage = stt_chain(vec![pcm_seconds(0.3)], 3.0);
        let out = pull_all(&stage);
        assert_eq!(out.len(), 1);
        let events = parse(&out[0]);
        assert_eq!(events[0].text, "seg");
        assert!((events[0].end - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_empty_stream_emits_nothing() {
        let stage = stt_chain(vec![], 1.0);
        assert!(pull_all(&stage).is_empty());
    }

    #[test]
    fn test_declared_formats() {
        let stage = SttStage::new(Arc::new(MockTranscriber::default()), 3.0);
        assert_eq!(stage.input_format(), Some(AudioFormat::pcm16(16000)));
        assert_eq!(stage.output_format(), Some(AudioFormat::event()));
    }
}
