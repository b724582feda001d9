use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::error::Result;

use super::MicrophoneStream;
use super::buffer::{AudioFrame, BlockAccumulator};
use super::resample::Resampler;

/// Frames held for a consumer that has not attached yet.
const FRAME_QUEUE_DEPTH: usize = 64;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Turns raw device buffers into fixed-size mono capture frames on a worker thread.
pub struct InputContext {
    frames: Receiver<AudioFrame>,
    open: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl InputContext {
    /// Start converting `stream` into mono `block_size` frames at `sample_rate`.
    pub fn open(
        stream: &dyn MicrophoneStream,
        sample_rate: u32,
        block_size: usize,
    ) -> Result<Self> {
        let raw_rx = stream.receiver();
        let source_rate = stream.sample_rate();
        let channels = stream.channels();
        let mut resampler = Resampler::new(source_rate, sample_rate, channels)?;

        let (frame_tx, frame_rx) = bounded::<AudioFrame>(FRAME_QUEUE_DEPTH);
        let open = Arc::new(AtomicBool::new(true));
        let worker_open = Arc::clone(&open);

        tracing::debug!(
            "input context: source_rate={source_rate}, channels={channels}, target_rate={sample_rate}, block={block_size}"
        );

        let worker = std::thread::Builder::new()
            .name("input-context".to_string())
            .spawn(move || {
                let mut accumulator = BlockAccumulator::new(block_size);
                let mut dropped = 0usize;

                while worker_open.load(Ordering::Acquire) {
                    let raw = match raw_rx.recv_timeout(POLL_INTERVAL) {
                        Ok(raw) => raw,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };

                    let mono = match resampler.process(&raw) {
                        Ok(s) => s,
                        Err(e) => {
                            tracing::warn!("resample error: {e}");
                            continue;
                        }
                    };

                    for frame in accumulator.feed(&mono) {
                        if frame_tx.try_send(frame).is_err() {
                            dropped += 1;
                        }
                    }
                }

                if dropped > 0 {
                    tracing::debug!("input context dropped {dropped} frames nobody consumed");
                }
                tracing::debug!("input context thread exiting");
            })?;

        Ok(Self {
            frames: frame_rx,
            open,
            worker: Some(worker),
            sample_rate,
        })
    }

    /// Receiver of capture frames in capture order.
    #[must_use]
    pub fn frames(&self) -> Receiver<AudioFrame> {
        self.frames.clone()
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stop the conversion thread without waiting for it.
    ///
    /// The worker exits within one poll interval and the frame channel then
    /// disconnects.
    pub fn close(&mut self) {
        self.open.store(false, Ordering::Release);
        if self.worker.take().is_some() {
            tracing::debug!("input context closed");
        }
    }
}

impl Drop for InputContext {
    fn drop(&mut self) {
        self.close();
    }
}
