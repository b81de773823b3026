//! Text-to-speech stage.

use crate::format::AudioFormat;
use crate::services::Synthesizer;
use crate::stage::{Chunk, Produce, StageCx};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Renders upstream text lines as PCM via a [`Synthesizer`].
///
/// Output is s16le mono at the backend's native rate; the wiring layer
/// bridges to whatever the sink wants. A backend failure ends the
/// stream rather than poisoning the graph.
pub struct TtsStage {
    synth: Arc<dyn Synthesizer>,
    voice: String,
    pending: VecDeque<Chunk>,
}

impl TtsStage {
    pub fn new(synth: Arc<dyn Synthesizer>, voice: impl Into<String>) -> Self {
        Self {
            synth,
            voice: voice.into(),
            pending: VecDeque::new(),
        }
    }
}

impl Produce for TtsStage {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::text())
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::pcm16(self.synth.native_rate()))
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            let chunk = cx.pull()?;
            let text = String::from_utf8_lossy(&chunk);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match self.synth.synthesize(text, &self.voice) {
                Ok(chunks) => self.pending.extend(chunks),
                Err(err) => {
                    warn!(stage = cx.stage_id(), %err, "synthesis failed, ending stream");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Result};
    use crate::services::MockSynthesizer;
    use crate::stage::{Stage, connect};
    use crate::testutil::{ChunkSource, pull_all};

    fn text_source(lines: &[&str]) -> crate::stage::StageRef {
        let chunks = lines.iter().map(|l| l.as_bytes().to_vec()).collect();
        Stage::new(
            "src",
            Box::new(ChunkSource::new(chunks, Some(AudioFormat::text()))),
        )
    }

    #[test]
    fn test_renders_each_line() {
        let src = text_source(&["hello", "world"]);
        let stage = Stage::new(
            "tts",
            Box::new(TtsStage::new(Arc::new(MockSynthesizer::new(16000)), "v1")),
        );
        connect(&src, &stage);
        let out = pull_all(&stage);
        // Two chunks per utterance from the mock.
        assert_eq!(out.len(), 4);
        assert!(out.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let src = text_source(&["", "  ", "ok"]);
        let stage = Stage::new(
            "tts",
            Box::new(TtsStage::new(Arc::new(MockSynthesizer::new(16000)), "v1")),
        );
        connect(&src, &stage);
        assert_eq!(pull_all(&stage).len(), 2);
    }

    #[test]
    fn test_output_format_uses_native_rate() {
        let stage = TtsStage::new(Arc::new(MockSynthesizer::new(22_050)), "v1");
        assert_eq!(stage.output_format(), Some(AudioFormat::pcm16(22_050)));
    }

    struct FailingSynth;

    impl Synthesizer for FailingSynth {
        fn native_rate(&self) -> u32 {
            16000
        }

        fn synthesize(&self, _text: &str, _voice: &str) -> Result<Vec<Chunk>> {
            Err(PipelineError::Audio {
                message: "backend down".to_string(),
            })
        }
    }

    #[test]
    fn test_backend_failure_ends_stream() {
        let src = text_source(&["hello", "never reached"]);
        let stage = Stage::new("tts", Box::new(TtsStage::new(Arc::new(FailingSynth), "v1")));
        connect(&src, &stage);
        assert_eq!(stage.pull(), None);
    }
}
