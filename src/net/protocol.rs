use serde::{Deserialize, Serialize};

use crate::codec::EncodedPacket;
use crate::config::ServiceConfig;
use crate::error::{Result, VoiceError};

/// Client to server frame: `{"setup": {..}}` once, then `{"realtimeInput": {"mediaChunks": [..]}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl ClientMessage {
    /// First message on a new channel: audio-only replies in the configured voice.
    #[must_use]
    pub fn setup(config: &ServiceConfig) -> Self {
        let model = if config.model.starts_with("models/") {
            config.model.clone()
        } else {
            format!("models/{}", config.model)
        };

        let system_instruction = (!config.system_instruction.trim().is_empty()).then(|| Content {
            parts: vec![TextPart {
                text: config.system_instruction.clone(),
            }],
        });

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.clone(),
                        },
                    },
                },
            },
            system_instruction,
        })
    }

    #[must_use]
    pub fn audio(packet: EncodedPacket) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: packet.format.mime_type(),
                data: packet.data,
            }],
        })
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Protocol(format!("failed to serialize client message: {e}")))
    }
}

/// Audio carried inline in a server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineAudio {
    pub data: String,
    pub mime_type: Option<String>,
}

/// One `serverContent` message, reduced to what the session acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerMessage {
    pub audio: Option<InlineAudio>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

/// A parsed server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    SetupComplete,
    Content(ServerMessage),
    GoAway,
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<RawServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    model_turn: Option<RawContent>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    inline_data: Option<RawBlob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlob {
    mime_type: Option<String>,
    data: String,
}

/// Parse one text (or UTF-8 binary) frame from the service.
pub fn parse_server_message(text: &str) -> Result<Inbound> {
    let raw: RawServerMessage = serde_json::from_str(text)
        .map_err(|e| VoiceError::Protocol(format!("invalid server message: {e}")))?;

    if let Some(content) = raw.server_content {
        let audio = content
            .model_turn
            .into_iter()
            .flat_map(|turn| turn.parts)
            .find_map(|part| part.inline_data)
            .map(|blob| InlineAudio {
                data: blob.data,
                mime_type: blob.mime_type,
            });

        return Ok(Inbound::Content(ServerMessage {
            audio,
            interrupted: content.interrupted,
            turn_complete: content.turn_complete,
        }));
    }

    if raw.setup_complete.is_some() {
        return Ok(Inbound::SetupComplete);
    }
    if raw.go_away.is_some() {
        return Ok(Inbound::GoAway);
    }
    Ok(Inbound::Unknown)
}
