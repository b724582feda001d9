pub mod buffer;
pub mod capture;
pub mod input;
pub mod playback;
pub mod resample;

use crossbeam_channel::Receiver;

use crate::error::Result;

pub use self::buffer::AudioFrame;
pub use self::input::InputContext;
pub use self::playback::{OutputDevice, PlaybackHandle, PlaybackId};

/// Source of microphone streams.
///
/// Acquisition may fail with `VoiceError::PermissionDenied`.
pub trait Microphone: Send + Sync {
    fn acquire(&self) -> Result<Box<dyn MicrophoneStream>>;
}

/// An acquired microphone delivering raw interleaved samples at the device rate.
pub trait MicrophoneStream: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn receiver(&self) -> Receiver<Vec<f32>>;

    /// Stop the device stream without blocking. Calling it twice is harmless.
    fn release(&mut self);
}
