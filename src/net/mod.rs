pub mod client;
pub mod protocol;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::codec::EncodedPacket;
use crate::error::Result;

pub use self::protocol::{InlineAudio, ServerMessage};

/// What the remote voice service tells us about the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    Opened,
    Message(ServerMessage),
    Closed { reason: Option<String> },
    Error(String),
}

/// Opens channels to the remote voice service.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel; its events are delivered on `events` in arrival order.
    ///
    /// Fails with `VoiceError::ChannelOpen` when the channel cannot be established.
    async fn connect(&self, events: mpsc::UnboundedSender<ServiceEvent>) -> Result<Box<dyn Link>>;
}

/// An open channel to the voice service.
pub trait Link: Send {
    /// Queue drained in order by the link's transmission task.
    fn outbound(&self) -> mpsc::UnboundedSender<EncodedPacket>;

    /// Stop transmitting and close the channel. Calling it twice is harmless.
    fn close(&mut self);
}
