use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::EncodedPacket;
use crate::config::ServiceConfig;
use crate::error::{Result, VoiceError};
use crate::net::protocol::{ClientMessage, Inbound, parse_server_message};
use crate::net::{Connector, Link, ServiceEvent};

/// Connects to the live voice service over a WebSocket.
pub struct LiveConnector {
    config: ServiceConfig,
    api_key: String,
}

impl LiveConnector {
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        Ok(Self {
            api_key: config.resolve_api_key()?,
            config: config.clone(),
        })
    }

    fn endpoint(&self) -> String {
        let separator = if self.config.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}key={}", self.config.url, self.api_key)
    }
}

#[async_trait]
impl Connector for LiveConnector {
    async fn connect(&self, events: mpsc::UnboundedSender<ServiceEvent>) -> Result<Box<dyn Link>> {
        let (socket, _response) = connect_async(self.endpoint())
            .await
            .map_err(|e| VoiceError::ChannelOpen(format!("{}: {e}", self.config.url)))?;

        let (mut sink, mut stream) = socket.split();

        let setup = ClientMessage::setup(&self.config).to_json()?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| VoiceError::ChannelOpen(format!("failed to send setup: {e}")))?;

        tracing::info!(model = %self.config.model, voice = %self.config.voice, "voice channel open");
        let _ = events.send(ServiceEvent::Opened);

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<EncodedPacket>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_rx => break,
                    packet = outbound_rx.recv() => {
                        let Some(packet) = packet else { break };
                        let json = match ClientMessage::audio(packet).to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!("dropping outbound frame: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(Message::Text(json)).await {
                            let _ = writer_events.send(ServiceEvent::Error(format!("send failed: {e}")));
                            break;
                        }
                        sent += 1;
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            tracing::debug!("transmission task exiting after {sent} frames");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("non-UTF-8 binary frame: {e}");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty());
                        let _ = events.send(ServiceEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = events.send(ServiceEvent::Error(e.to_string()));
                        return;
                    }
                };

                match parse_server_message(&text) {
                    Ok(Inbound::Content(message)) => {
                        if events.send(ServiceEvent::Message(message)).is_err() {
                            return;
                        }
                    }
                    Ok(Inbound::SetupComplete) => tracing::debug!("service acknowledged setup"),
                    Ok(Inbound::GoAway) => tracing::info!("service announced it will disconnect"),
                    Ok(Inbound::Unknown) => tracing::trace!("ignoring server frame"),
                    Err(e) => tracing::warn!("{e}"),
                }
            }
            let _ = events.send(ServiceEvent::Closed { reason: None });
        });

        Ok(Box::new(LiveLink {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
            reader: Some(reader),
            writer: Some(writer),
        }))
    }
}

struct LiveLink {
    outbound: mpsc::UnboundedSender<EncodedPacket>,
    shutdown: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Link for LiveLink {
    fn outbound(&self) -> mpsc::UnboundedSender<EncodedPacket> {
        self.outbound.clone()
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
            tracing::debug!("voice channel closing");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer sends a close frame on its way out
        drop(self.writer.take());
    }
}

impl Drop for LiveLink {
    fn drop(&mut self) {
        self.close();
    }
}
