//! Engine configuration, loaded from a TOML file.

use crate::defaults::{DEFAULT_SAMPLE_RATE, MIXER_FRAME_MS, QUEUE_CAPACITY, STT_CHUNK_SECONDS};
use crate::error::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Default sample rate for mixers created without an explicit rate.
    pub sample_rate: u32,
    /// Mixer output frame length in milliseconds.
    pub mixer_frame_ms: u32,
    /// Capacity of every inter-thread queue.
    pub queue_capacity: usize,
    /// Default transcription segment length in seconds.
    pub stt_chunk_seconds: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            mixer_frame_ms: MIXER_FRAME_MS,
            queue_capacity: QUEUE_CAPACITY,
            stt_chunk_seconds: STT_CHUNK_SECONDS,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
