use crossbeam_channel::Receiver;

use crate::audio::{AudioFrame, InputContext, MicrophoneStream};

/// Holds the microphone stream and its input capture context.
///
/// Release happens on `release` or on drop, whichever comes first.
#[derive(Default)]
pub struct ResourceManager {
    microphone: Option<Box<dyn MicrophoneStream>>,
    input: Option<InputContext>,
}

impl ResourceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of freshly acquired handles, releasing any previous ones first.
    pub fn install(&mut self, microphone: Box<dyn MicrophoneStream>, input: InputContext) {
        self.release();
        self.microphone = Some(microphone);
        self.input = Some(input);
    }

    /// Frames of the installed input context.
    #[must_use]
    pub fn frames(&self) -> Option<Receiver<AudioFrame>> {
        self.input.as_ref().map(InputContext::frames)
    }

    /// Close the input context, then release the microphone.
    pub fn release(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.release();
            tracing::debug!("microphone released");
        }
    }

    #[must_use]
    pub const fn holds_microphone(&self) -> bool {
        self.microphone.is_some()
    }

    #[must_use]
    pub const fn holds_input(&self) -> bool {
        self.input.is_some()
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.release();
    }
}
