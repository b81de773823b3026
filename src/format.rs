//! Payload format descriptions at stage boundaries.

use serde::Serialize;

/// Sample encoding (or non-audio payload kind) flowing between two stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Encoding {
    /// Signed 16-bit little-endian PCM (2 bytes/sample, silence = 0).
    #[serde(rename = "s16le")]
    Pcm16Le,
    /// Unsigned 8-bit PCM (1 byte/sample, silence = 128).
    #[serde(rename = "u8")]
    Pcm8U,
    /// UTF-8 text lines (one line per chunk, no trailing newline).
    #[serde(rename = "text")]
    Text,
    /// Line-delimited JSON event records.
    #[serde(rename = "event")]
    Event,
}

impl Encoding {
    /// Bytes per sample for audio encodings; 0 for non-audio payloads.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Encoding::Pcm16Le => 2,
            Encoding::Pcm8U => 1,
            Encoding::Text | Encoding::Event => 0,
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Encoding::Pcm16Le | Encoding::Pcm8U)
    }
}

/// Describes the payload at a stage boundary.
///
/// Immutable value type with structural equality. `sample_rate == 0`
/// together with a non-audio encoding denotes text/event payloads that
/// are never auto-converted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub encoding: Encoding,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, encoding: Encoding, channels: u16) -> Self {
        Self {
            sample_rate,
            encoding,
            channels,
        }
    }

    /// Mono signed 16-bit PCM at the given rate.
    pub fn pcm16(sample_rate: u32) -> Self {
        Self::new(sample_rate, Encoding::Pcm16Le, 1)
    }

    /// Mono unsigned 8-bit PCM at the given rate.
    pub fn pcm8(sample_rate: u32) -> Self {
        Self::new(sample_rate, Encoding::Pcm8U, 1)
    }

    /// Text lines (non-audio).
    pub fn text() -> Self {
        Self::new(0, Encoding::Text, 0)
    }

    /// NDJSON event records (non-audio).
    pub fn event() -> Self {
        Self::new(0, Encoding::Event, 0)
    }

    pub fn is_audio(&self) -> bool {
        self.encoding.is_audio() && self.sample_rate > 0
    }

    /// Bytes of PCM per millisecond of audio (0 for non-audio).
    pub fn bytes_per_ms(&self) -> f64 {
        if !self.is_audio() {
            return 0.0;
        }
        self.sample_rate as f64 / 1000.0
            * self.encoding.bytes_per_sample() as f64
            * self.channels.max(1) as f64
    }
}
