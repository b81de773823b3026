//! Collaborator traits for speech services.
//!
//! The engine never talks to a model or an external process directly;
//! TTS, STT and voice conversion arrive as trait objects so tests can
//! swap in mocks and applications can plug in whatever backend they run.

use crate::error::Result;
use crate::stage::Chunk;
use crate::stages::events::TranscriptEvent;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Text-to-speech backend.
pub trait Synthesizer: Send + Sync {
    /// Sample rate of the PCM this backend produces (s16le mono).
    fn native_rate(&self) -> u32;

    /// Renders one utterance as a sequence of s16le chunks.
    fn synthesize(&self, text: &str, voice: &str) -> Result<Vec<Chunk>>;
}

/// Speech-to-text backend. Input is s16le mono at 16 kHz.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, samples: &[i16]) -> Result<Vec<TranscriptEvent>>;
}

/// Voice conversion backend, file in, file out.
pub trait VoiceConverter: Send + Sync {
    /// Converts the WAV at `input` to the target voice and returns the
    /// path of the converted WAV.
    fn convert(&self, input: &Path, voice: &str) -> Result<PathBuf>;
}

/// Bundle of optional collaborators handed to the builder.
///
/// An element that needs a missing service fails the build with
/// `MissingService`.
#[derive(Clone, Default)]
pub struct Services {
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub voice_converter: Option<Arc<dyn VoiceConverter>>,
}

impl Services {
    pub fn with_synthesizer(mut self, s: Arc<dyn Synthesizer>) -> Self {
        self.synthesizer = Some(s);
        self
    }

    pub fn with_transcriber(mut self, t: Arc<dyn Transcriber>) -> Self {
        self.transcriber = Some(t);
        self
    }

    pub fn with_voice_converter(mut self, v: Arc<dyn VoiceConverter>) -> Self {
        self.voice_converter = Some(v);
        self
    }
}

/// Deterministic synthesizer for tests: emits a short burst of non-zero
/// PCM per utterance, length proportional to the text.
pub struct MockSynthesizer {
    rate: u32,
}

impl MockSynthesizer {
    pub fn new(rate: u32) -> Self {
        Self { rate }
    }
}

impl Default for MockSynthesizer {
    fn default() -> Self {
        Self::new(22_050)
    }
}

impl Synthesizer for MockSynthesizer {
    fn native_rate(&self) -> u32 {
        self.rate
    }

    fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<Chunk>> {
        // 10 ms of audio per character, split into two chunks.
        let samples = (self.rate as usize / 100) * text.chars().count().max(1);
        let pcm: Chunk = (0..samples)
            .flat_map(|i| (((i % 64) as i16 - 32) * 256).to_le_bytes())
            .collect();
        let mid = pcm.len() / 2 & !1;
        Ok(vec![pcm[..mid].to_vec(), pcm[mid..].to_vec()])
    }
}

/// Canned transcriber for tests: returns one event per call, stamped
/// with the duration of the audio it was given.
pub struct MockTranscriber {
    text: String,
}

impl MockTranscriber {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::new("mock transcript")
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, samples: &[i16]) -> Result<Vec<TranscriptEvent>> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TranscriptEvent {
            text: self.text.clone(),
            start: 0.0,
            end: samples.len() as f64 / crate::defaults::STT_SAMPLE_RATE as f64,
        }])
    }
}

/// Identity converter for tests: returns the input path unchanged.
pub struct MockVoiceConverter;

impl VoiceConverter for MockVoiceConverter {
    fn convert(&self, input: &Path, _voice: &str) -> Result<PathBuf> {
        Ok(input.to_path_buf())
    }
}
