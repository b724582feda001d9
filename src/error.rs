use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("failed to open channel to the voice service: {0}")]
    ChannelOpen(String),

    #[error("voice service did not connect within {}s", .0.as_secs())]
    ConnectionTimeout(Duration),

    #[error("malformed audio packet: {0}")]
    MalformedPacket(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("audio error: {0}")]
    Audio(String),

    #[error("resample error: {0}")]
    Resample(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl VoiceError {
    /// Errors that end the whole session rather than a single packet.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_)
                | Self::ChannelOpen(_)
                | Self::ConnectionTimeout(_)
                | Self::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
