//! Transcript event records and the event-to-text adapter.

use crate::format::AudioFormat;
use crate::stage::{Chunk, Produce, StageCx};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// One recognized utterance with its position in the stream, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Serializes events as one NDJSON chunk (one JSON object per line).
pub fn encode_events(events: &[TranscriptEvent]) -> serde_json::Result<Chunk> {
    let mut out = Vec::new();
    for event in events {
        serde_json::to_writer(&mut out, event)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Adapter from NDJSON event chunks to plain text lines.
///
/// Inserted automatically between an event producer and a text sink.
/// Each event becomes one text chunk carrying its `text` field;
/// malformed lines are logged and skipped.
pub struct EventToText {
    pending: VecDeque<Chunk>,
}

impl EventToText {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }
}

impl Default for EventToText {
    fn default() -> Self {
        Self::new()
    }
}

impl Produce for EventToText {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::event())
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(AudioFormat::text())
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            let chunk = cx.pull()?;
            let text = String::from_utf8_lossy(&chunk);
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<TranscriptEvent>(line) {
                    Ok(event) => self.pending.push_back(event.text.into_bytes()),
                    Err(err) => warn!(stage = cx.stage_id(), %err, "skipping malformed event"),
                }
            }
        }
    }
}
