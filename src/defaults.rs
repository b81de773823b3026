//! Engine-wide default constants.

use std::time::Duration;

/// Default sample rate for mixers and rate-less PCM stages (Hz).
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Mixer frame length in milliseconds.
pub const MIXER_FRAME_MS: u32 = 20;

/// Capacity of every fan-out / fan-in queue.
///
/// ~4 seconds of audio at 16 kHz / 20 ms frames. Producers that must
/// never block drop on full instead of waiting.
pub const QUEUE_CAPACITY: usize = 200;

/// How long a queue source waits for data before re-checking cancellation.
pub const RECV_POLL: Duration = Duration::from_millis(500);

/// Deadline for joining side-chain and cell worker threads on shutdown.
/// Unresponsive workers are abandoned after this.
pub const WORKER_JOIN_DEADLINE: Duration = Duration::from_secs(5);

/// Bounded wait for pushes that may legitimately block briefly
/// (cell runner output, end markers). Timeout is treated as a drop.
pub const BOUNDED_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait when delivering an end marker to a queue.
pub const END_MARKER_TIMEOUT: Duration = Duration::from_secs(1);

/// Default transcription segment length in seconds.
pub const STT_CHUNK_SECONDS: f64 = 3.0;

/// Sample rate the transcription boundary expects (Hz).
pub const STT_SAMPLE_RATE: u32 = 16_000;

/// Chunk length emitted by file and synthesis sources (milliseconds).
pub const SOURCE_CHUNK_MS: u32 = 100;
