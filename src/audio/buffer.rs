use chrono::{DateTime, Utc};

/// A fixed-size block of mono samples at the capture rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub captured_at: DateTime<Utc>,
}

/// Cuts a continuous mono sample stream into fixed-size frames.
pub struct BlockAccumulator {
    buffer: Vec<f32>,
    block_size: usize,
    block_start: DateTime<Utc>,
}

impl BlockAccumulator {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            buffer: Vec::with_capacity(block_size),
            block_size,
            block_start: Utc::now(),
        }
    }

    /// Feed samples and return any complete frames, oldest first.
    pub fn feed(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        if self.buffer.is_empty() {
            self.block_start = Utc::now();
        }

        self.buffer.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.buffer.len() >= self.block_size {
            let samples: Vec<f32> = self.buffer.drain(..self.block_size).collect();
            frames.push(AudioFrame {
                samples,
                captured_at: self.block_start,
            });
            self.block_start = Utc::now();
        }

        frames
    }

    /// Samples waiting for the next frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
