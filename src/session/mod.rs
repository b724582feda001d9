pub mod driver;

use std::fmt;
use std::time::Duration;

use crate::audio::{InputContext, MicrophoneStream, OutputDevice, PlaybackId};
use crate::codec::{self, PcmFormat};
use crate::config::AudioConfig;
use crate::error::VoiceError;
use crate::net::{InlineAudio, Link, ServerMessage, ServiceEvent};
use crate::pipeline::{CapturePipeline, FrameEncoder};
use crate::resources::ResourceManager;
use crate::scheduler::PlaybackScheduler;

pub use self::driver::{SessionHandle, SessionParts, SessionStatus, spawn_session};

/// Channels in PCM received from the service.
const INBOUND_CHANNELS: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything one connection attempt acquires.
pub struct Acquired {
    pub microphone: Box<dyn MicrophoneStream>,
    pub input: InputContext,
    pub link: Box<dyn Link>,
}

impl Acquired {
    fn release(self) {
        let Self {
            mut microphone,
            mut input,
            mut link,
        } = self;
        input.close();
        microphone.release();
        link.close();
    }
}

/// Codec settings for both directions.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub encoder: FrameEncoder,
    pub inbound_rate: u32,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(audio: &AudioConfig) -> Self {
        Self {
            encoder: FrameEncoder {
                format: PcmFormat::mono(audio.capture_sample_rate),
                conversion: audio.sample_conversion,
            },
            inbound_rate: audio.playback_sample_rate,
        }
    }
}

/// Voice session state machine.
///
/// ```text
///            start              opened
///   Idle ───────────▶ Connecting ───────▶ Active
///    ▲  ▲                │                  │
///    │  └── failure, ────┘                  │ close / remote close / transport error
///    │      timeout, close                  ▼
///    └───────────── start ─────────────── Closed
/// ```
///
/// Every external event maps to one method. None of them block on devices or
/// the network, so the driver applies them one at a time from a single task.
pub struct Session {
    state: SessionState,
    attempt: u64,
    resources: ResourceManager,
    link: Option<Box<dyn Link>>,
    capture: Option<CapturePipeline>,
    scheduler: PlaybackScheduler,
    settings: SessionSettings,
    last_error: Option<String>,
}

impl Session {
    #[must_use]
    pub fn new(output: Box<dyn OutputDevice>, settings: SessionSettings) -> Self {
        Self {
            state: SessionState::Idle,
            attempt: 0,
            resources: ResourceManager::new(),
            link: None,
            capture: None,
            scheduler: PlaybackScheduler::new(output),
            settings,
            last_error: None,
        }
    }

    /// Begin a connection attempt. Returns its number, or `None` if one is
    /// already connecting or active.
    pub fn request_start(&mut self) -> Option<u64> {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                tracing::debug!(state = %self.state, "start ignored");
                None
            }
            SessionState::Idle | SessionState::Closed => {
                self.attempt += 1;
                self.state = SessionState::Connecting;
                self.last_error = None;
                tracing::info!(attempt = self.attempt, "connecting voice session");
                Some(self.attempt)
            }
        }
    }

    /// Install what `attempt` acquired. Resources of an abandoned attempt are
    /// released on the spot and `false` is returned.
    pub fn on_acquired(&mut self, attempt: u64, acquired: Acquired) -> bool {
        if attempt != self.attempt || self.state != SessionState::Connecting {
            tracing::debug!(attempt, "releasing resources of abandoned attempt");
            acquired.release();
            return false;
        }

        let Acquired {
            microphone,
            input,
            link,
        } = acquired;
        self.resources.install(microphone, input);
        self.link = Some(link);
        true
    }

    pub fn on_acquire_failed(&mut self, attempt: u64, error: VoiceError) {
        if attempt != self.attempt || self.state != SessionState::Connecting {
            tracing::debug!(attempt, "late failure of abandoned attempt: {error}");
            return;
        }
        self.abort_connecting(error);
    }

    pub fn on_connect_timeout(&mut self, attempt: u64, timeout: Duration) {
        if attempt == self.attempt && self.state == SessionState::Connecting {
            self.abort_connecting(VoiceError::ConnectionTimeout(timeout));
        }
    }

    pub fn on_service_event(&mut self, attempt: u64, event: ServiceEvent) {
        if attempt != self.attempt {
            tracing::trace!(attempt, "event from abandoned attempt ignored");
            return;
        }

        match (self.state, event) {
            (SessionState::Connecting, ServiceEvent::Opened) => self.activate(),
            (SessionState::Connecting, ServiceEvent::Closed { reason }) => {
                self.abort_connecting(VoiceError::ChannelOpen(
                    reason.unwrap_or_else(|| "closed before the session started".to_string()),
                ));
            }
            (SessionState::Connecting, ServiceEvent::Error(message)) => {
                self.abort_connecting(VoiceError::ChannelOpen(message));
            }
            (SessionState::Active, ServiceEvent::Message(message)) => self.handle_message(message),
            (SessionState::Active, ServiceEvent::Closed { reason }) => {
                tracing::info!(
                    reason = reason.as_deref().unwrap_or("none given"),
                    "voice service closed the session"
                );
                self.teardown(SessionState::Closed);
            }
            (SessionState::Active, ServiceEvent::Error(message)) => {
                let error = VoiceError::Transport(message);
                tracing::error!("{error}");
                self.last_error = Some(error.to_string());
                self.teardown(SessionState::Closed);
            }
            (state, event) => {
                tracing::trace!(%state, ?event, "event ignored");
            }
        }
    }

    pub fn on_playback_finished(&mut self, id: PlaybackId) {
        if !self.scheduler.finish(id) {
            tracing::trace!(%id, "completion for a buffer no longer tracked");
        }
    }

    /// Terminate from any state. Idle and Closed are left untouched.
    pub fn close(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Closed => {
                tracing::debug!(state = %self.state, "close is a no-op");
            }
            SessionState::Connecting => {
                tracing::info!("connection attempt cancelled");
                self.teardown(SessionState::Idle);
            }
            SessionState::Active => {
                tracing::info!("closing voice session");
                self.teardown(SessionState::Closed);
            }
        }
    }

    fn activate(&mut self) {
        let (Some(frames), Some(link)) = (self.resources.frames(), self.link.as_ref()) else {
            tracing::warn!("channel opened before the microphone was ready");
            return;
        };

        self.capture = Some(CapturePipeline::attach(
            frames,
            link.outbound(),
            self.settings.encoder,
        ));
        self.state = SessionState::Active;
        tracing::info!(attempt = self.attempt, "voice session active");
    }

    fn handle_message(&mut self, message: ServerMessage) {
        if let Some(audio) = message.audio {
            self.play(&audio);
        }
        if message.interrupted {
            self.scheduler.interrupt();
        }
        if message.turn_complete {
            tracing::debug!("advisor finished speaking");
        }
    }

    fn play(&mut self, audio: &InlineAudio) {
        let format = PcmFormat::from_mime_type(audio.mime_type.as_deref(), self.settings.inbound_rate);
        let buffer = match codec::decode(&audio.data, format.sample_rate, INBOUND_CHANNELS) {
            Ok(buffer) => buffer,
            Err(e) => {
                tracing::warn!("dropping inbound packet: {e}");
                return;
            }
        };

        if buffer.is_empty() {
            return;
        }

        if let Err(e) = self.scheduler.schedule(buffer) {
            tracing::warn!("failed to schedule playback: {e}");
        }
    }

    fn abort_connecting(&mut self, error: VoiceError) {
        if error.is_connection_level() {
            tracing::warn!("voice session failed to start: {error}");
        } else {
            tracing::error!("voice session failed to start: {error}");
        }
        self.last_error = Some(error.to_string());
        self.teardown(SessionState::Idle);
    }

    fn teardown(&mut self, next: SessionState) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.scheduler.reset();
        if let Some(mut link) = self.link.take() {
            link.close();
        }
        self.resources.release();
        self.state = next;
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn attempt(&self) -> u64 {
        self.attempt
    }

    #[must_use]
    pub const fn cursor(&self) -> f64 {
        self.scheduler.cursor()
    }

    #[must_use]
    pub fn active_playbacks(&self) -> usize {
        self.scheduler.active_count()
    }

    #[must_use]
    pub const fn holds_microphone(&self) -> bool {
        self.resources.holds_microphone()
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.capture.as_ref().is_some_and(CapturePipeline::is_running)
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
