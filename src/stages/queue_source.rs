//! Source stage reading chunks from a bounded queue.

use crate::defaults::RECV_POLL;
use crate::format::AudioFormat;
use crate::stage::{Chunk, FeedItem, Produce, StageCx};
use crossbeam_channel::{Receiver, RecvTimeoutError};

/// Source stage over a `Receiver<FeedItem>`.
///
/// Ends on the `None` end marker or when every sender is gone. Used by
/// tee side-chains, mixer bridges and the cell runner.
pub struct QueueSource {
    rx: Receiver<FeedItem>,
    format: Option<AudioFormat>,
}

impl QueueSource {
    pub fn new(rx: Receiver<FeedItem>, format: Option<AudioFormat>) -> Self {
        Self { rx, format }
    }
}

impl Produce for QueueSource {
    fn output_format(&self) -> Option<AudioFormat> {
        self.format
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        loop {
            if cx.cancelled() {
                return None;
            }
            match self.rx.recv_timeout(RECV_POLL) {
                Ok(Some(chunk)) => return Some(chunk),
                Ok(None) | Err(RecvTimeoutError::Disconnected) => return None,
                Err(RecvTimeoutError::Timeout) => continue,
            }
        }
    }
}
