use std::collections::HashMap;

use crate::audio::{OutputDevice, PlaybackHandle, PlaybackId};
use crate::codec::DecodedBuffer;
use crate::error::Result;

/// Where a buffer landed on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start_at: f64,
    pub duration: f64,
}

/// Gap-free, interruption-aware scheduling of inbound audio on the output clock.
pub struct PlaybackScheduler {
    device: Box<dyn OutputDevice>,
    cursor: f64,
    active: HashMap<PlaybackId, Box<dyn PlaybackHandle>>,
    next_id: u64,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device,
            cursor: 0.0,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Queue `buffer` right after everything already scheduled, never in the past.
    pub fn schedule(&mut self, buffer: DecodedBuffer) -> Result<ScheduledPlayback> {
        let start_at = self.cursor.max(self.device.current_time());
        let duration = buffer.duration_secs();
        let id = PlaybackId(self.next_id);
        self.next_id += 1;

        let handle = self.device.play_at(id, buffer, start_at)?;
        self.cursor = start_at + duration;
        self.active.insert(id, handle);

        tracing::trace!(%id, start_at, duration, "buffer scheduled");
        Ok(ScheduledPlayback {
            id,
            start_at,
            duration,
        })
    }

    /// Drop a handle whose buffer finished on its own. Returns false for unknown ids.
    pub fn finish(&mut self, id: PlaybackId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: abandon everything scheduled and restart the timeline.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.cursor = 0.0;
        tracing::debug!("playback interrupted, {stopped} buffers stopped");
        stopped
    }

    /// Stop everything for teardown.
    pub fn reset(&mut self) {
        self.stop_all();
        self.cursor = 0.0;
    }

    fn stop_all(&mut self) -> usize {
        let count = self.active.len();
        for (id, mut handle) in self.active.drain() {
            if let Err(e) = handle.stop() {
                // Finished naturally before we got to it
                tracing::debug!(%id, "ignoring stop error: {e}");
            }
        }
        count
    }

    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.cursor
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_active(&self, id: PlaybackId) -> bool {
        self.active.contains_key(&id)
    }
}
