use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::codec::{self, EncodedPacket, PcmFormat, SampleConversion};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Encoding settings applied to every outbound frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    pub format: PcmFormat,
    pub conversion: SampleConversion,
}

impl FrameEncoder {
    #[must_use]
    pub fn encode(&self, frame: &AudioFrame) -> EncodedPacket {
        codec::encode(&frame.samples, self.format, self.conversion)
    }
}

/// Forwards encoded capture frames to the transport until stopped.
pub struct CapturePipeline {
    // Held by the worker across each submission so `stop` is a hard cutoff.
    running: Arc<Mutex<bool>>,
    sent: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
}

impl CapturePipeline {
    /// Start forwarding. Frames queued before this call are discarded.
    ///
    /// Submission never waits on the network: `outbound` is unbounded and
    /// drained in order by the link's transmission task.
    pub fn attach(
        frames: Receiver<AudioFrame>,
        outbound: mpsc::UnboundedSender<EncodedPacket>,
        encoder: FrameEncoder,
    ) -> Self {
        let running = Arc::new(Mutex::new(true));
        let sent = Arc::new(AtomicU64::new(0));
        let worker_running = Arc::clone(&running);
        let worker_sent = Arc::clone(&sent);

        let stale = frames.try_iter().count();
        if stale > 0 {
            tracing::debug!("discarded {stale} frames captured before activation");
        }

        let worker = std::thread::spawn(move || {
            loop {
                let frame = match frames.recv_timeout(POLL_INTERVAL) {
                    Ok(frame) => frame,
                    Err(RecvTimeoutError::Timeout) => {
                        if *lock(&worker_running) {
                            continue;
                        }
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                let packet = encoder.encode(&frame);

                let running = lock(&worker_running);
                if !*running {
                    break;
                }
                if outbound.send(packet).is_err() {
                    tracing::debug!("outbound queue closed, stopping capture");
                    break;
                }
                worker_sent.fetch_add(1, Ordering::Relaxed);
                drop(running);

                let lag_ms = (Utc::now() - frame.captured_at).num_milliseconds();
                tracing::trace!(lag_ms, "capture frame queued for transmission");
            }

            tracing::debug!(
                "capture pipeline exiting after {} frames",
                worker_sent.load(Ordering::Relaxed)
            );
        });

        tracing::debug!("capture pipeline attached");

        Self {
            running,
            sent,
            worker: Some(worker),
        }
    }

    /// Stop forwarding. There is no restart; attach a new pipeline instead.
    ///
    /// Once this returns no further packet reaches the outbound queue.
    pub fn stop(&mut self) {
        if std::mem::replace(&mut *lock(&self.running), false) {
            tracing::debug!("capture pipeline stopped");
        }
        // The worker notices within one poll interval; the session must not wait on it.
        drop(self.worker.take());
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    /// Frames handed to the outbound queue so far.
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock(running: &Mutex<bool>) -> MutexGuard<'_, bool> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}
