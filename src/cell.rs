//! CellRunner: a hot-swappable stage between two stable queues.
//!
//! The input and output queues outlive the stage inside. Swapping
//! replaces the worker thread and the stage while neighbors keep their
//! sender/receiver handles; chunks already queued are processed by the
//! replacement, so ordering across a swap is unbroken.

use crate::defaults::{BOUNDED_SEND_TIMEOUT, END_MARKER_TIMEOUT, QUEUE_CAPACITY, WORKER_JOIN_DEADLINE};
use crate::stage::{FeedItem, Stage, StageRef, connect, lock};
use crate::stages::QueueSource;
use crate::tee::join_with_deadline;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

struct Worker {
    stop: Arc<AtomicBool>,
    stage: StageRef,
    handle: JoinHandle<()>,
}

pub struct CellRunner {
    input_tx: Sender<FeedItem>,
    input_rx: Receiver<FeedItem>,
    output_rx: Receiver<FeedItem>,
    output_tx: Sender<FeedItem>,
    worker: Mutex<Option<Worker>>,
}

impl CellRunner {
    /// Creates the queues and starts the first worker around `stage`.
    pub fn new(stage: StageRef) -> Self {
        let (input_tx, input_rx) = bounded(QUEUE_CAPACITY);
        let (output_tx, output_rx) = bounded(QUEUE_CAPACITY);
        let runner = Self {
            input_tx,
            input_rx,
            output_rx,
            output_tx,
            worker: Mutex::new(None),
        };
        *lock(&runner.worker) = Some(runner.spawn(stage));
        runner
    }

    /// Sender feeding the cell. Push `None` to end the stream.
    pub fn input(&self) -> Sender<FeedItem> {
        self.input_tx.clone()
    }

    /// Receiver of the cell's output. Yields the end marker only when
    /// the stream genuinely ended, never because of a swap.
    pub fn output(&self) -> Receiver<FeedItem> {
        self.output_rx.clone()
    }

    pub fn current_stage_id(&self) -> Option<String> {
        lock(&self.worker)
            .as_ref()
            .map(|w| w.stage.id().to_string())
    }

    /// Replaces the stage inside the cell.
    ///
    /// The old worker is stopped and joined before the new one starts,
    /// so at most one worker ever reads the input queue and chunk order
    /// is preserved across the swap.
    pub fn swap(&self, stage: StageRef) {
        let mut guard = lock(&self.worker);
        if let Some(old) = guard.take() {
            debug!(old = old.stage.id(), new = stage.id(), "swapping cell stage");
            stop_worker(old);
        }
        *guard = Some(self.spawn(stage));
    }

    /// Stops the cell without replacing the stage. The output queue
    /// receives an end marker so downstream consumers unwind.
    pub fn stop(&self) {
        if let Some(old) = lock(&self.worker).take() {
            stop_worker(old);
            let _ = self.output_tx.send_timeout(None, END_MARKER_TIMEOUT);
        }
    }

    fn spawn(&self, stage: StageRef) -> Worker {
        let stop = Arc::new(AtomicBool::new(false));
        let source = Stage::new(
            "queue",
            Box::new(QueueSource::new(self.input_rx.clone(), None)),
        );
        connect(&source, &stage);

        let worker_stop = stop.clone();
        let worker_stage = stage.clone();
        let output = self.output_tx.clone();
        let handle = thread::spawn(move || {
            loop {
                if worker_stop.load(Ordering::SeqCst) {
                    return;
                }
                match worker_stage.pull() {
                    Some(chunk) => {
                        if output
                            .send_timeout(Some(chunk), BOUNDED_SEND_TIMEOUT)
                            .is_err()
                        {
                            warn!(stage = worker_stage.id(), "cell output stalled, dropping chunk");
                        }
                    }
                    None => {
                        // Forward the end marker only on natural
                        // exhaustion; a swap must look seamless.
                        if !worker_stop.load(Ordering::SeqCst) && !worker_stage.is_cancelled() {
                            let _ = output.send_timeout(None, END_MARKER_TIMEOUT);
                        }
                        return;
                    }
                }
            }
        });
        Worker {
            stop,
            stage,
            handle,
        }
    }
}

fn stop_worker(worker: Worker) {
    // Stop flag first: the worker must not mistake the cancellation
    // for natural exhaustion and forward an end marker.
    worker.stop.store(true, Ordering::SeqCst);
    worker.stage.cancel();
    join_with_deadline(vec![worker.handle], WORKER_JOIN_DEADLINE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use crate::stages::Gain;
    use crate::testutil::Passthrough;
    use std::time::Duration;

    fn gain_stage(factor: f32) -> StageRef {
        let (gain, _ctl) = Gain::new(AudioFormat::pcm16(16000), factor);
        Stage::new("gain", Box::new(gain))
    }

    fn bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_chunks_flow_through_cell() {
        let cell = CellRunner::new(gain_stage(2.0));
        let tx = cell.input();
        let rx = cell.output();
        tx.send(Some(bytes(&[10, 20]))).expect("send");
        tx.send(None).expect("eof");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("recv"),
            Some(bytes(&[20, 40]))
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("recv"), None);
        cell.stop();
    }

    #[test]
    fn test_swap_does_not_emit_end_marker() {
        let cell = CellRunner::new(gain_stage(1.0));
        let tx = cell.input();
        let rx = cell.output();
        tx.send(Some(bytes(&[1]))).expect("send");
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("recv"),
            Some(bytes(&[1]))
        );

        cell.swap(gain_stage(3.0));
        tx.send(Some(bytes(&[2]))).expect("send");
        // The next item must be the processed chunk, not an end marker.
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).expect("recv"),
            Some(bytes(&[6]))
        );
        cell.stop();
    }

    #[test]
    fn test_swap_preserves_strict_ordering() {
        let cell = CellRunner::new(Stage::new("pass", Box::new(Passthrough::new(None))));
        let tx = cell.input();
        let rx = cell.output();

        let feeder = {
            let tx = tx.clone();
            thread::spawn(move || {
                for i in 0..200u8 {
                    tx.send(Some(vec![i])).expect("send");
                }
                tx.send(None).expect("eof");
            })
        };
        // Swap a few times while chunks are in flight.
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(10));
            cell.swap(Stage::new("pass", Box::new(Passthrough::new(None))));
        }

        let mut seen = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).expect("recv") {
                Some(chunk) => seen.push(chunk[0]),
                None => break,
            }
        }
        feeder.join().expect("feeder");
        assert_eq!(seen, (0..200u8).collect::<Vec<u8>>());
    }

    #[test]
    fn test_stop_sends_end_marker() {
        let cell = CellRunner::new(gain_stage(1.0));
        let rx = cell.output();
        cell.stop();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("recv"), None);
        assert!(cell.current_stage_id().is_none());
    }

    #[test]
    fn test_current_stage_id_tracks_swaps() {
        let cell = CellRunner::new(gain_stage(1.0));
        let before = cell.current_stage_id().expect("id");
        cell.swap(gain_stage(2.0));
        let after = cell.current_stage_id().expect("id");
        assert_ne!(before, after);
        cell.stop();
    }
}
