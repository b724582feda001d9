use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::SampleConversion;
use crate::error::{Result, VoiceError};

const fn default_capture_sample_rate() -> u32 {
    16000
}

const fn default_playback_sample_rate() -> u32 {
    24000
}

const fn default_block_size() -> usize {
    4096
}

fn default_service_url() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash-native-audio-preview-12-2025".to_string()
}

fn default_voice() -> String {
    "Puck".to_string()
}

fn default_system_instruction() -> String {
    "You are Lindiwe, a warm and professional Ubuntu Pools advisor. Help the user with \
     savings tips, stokvel rules, and community prosperity advice. Speak in a friendly \
     South African accent/tone. Keep responses concise and human."
        .to_string()
}

const fn default_connect_timeout_secs() -> u64 {
    15
}

/// Which side of the audio path a device setting applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Input,
    Output,
}

impl DeviceRole {
    const fn config_key(self) -> &'static str {
        match self {
            Self::Input => "input_device",
            Self::Output => "output_device",
        }
    }
}

/// Environment variables consulted, in order, when `service.api_key` is unset.
pub const API_KEY_ENV_VARS: [&str; 2] = ["GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    pub input_device: Option<String>,

    pub output_device: Option<String>,

    /// Rate of the PCM sent to the service.
    #[serde(default = "default_capture_sample_rate")]
    pub capture_sample_rate: u32,

    /// Rate assumed for inbound PCM whose MIME tag carries none.
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,

    /// Samples per captured frame.
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    #[serde(default)]
    pub sample_conversion: SampleConversion,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            capture_sample_rate: default_capture_sample_rate(),
            playback_sample_rate: default_playback_sample_rate(),
            block_size: default_block_size(),
            sample_conversion: SampleConversion::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_url")]
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            api_key: None,
            model: default_model(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
        }
    }
}

impl ServiceConfig {
    /// The configured key, falling back to the environment.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(key.to_string());
        }

        API_KEY_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            .ok_or_else(|| {
                VoiceError::Config(format!(
                    "no API key: set service.api_key or one of {}",
                    API_KEY_ENV_VARS.join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VoiceError::Config(format!(
                "config file not found: {}; run `poolvoice init` or use --config to specify a path",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            VoiceError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            VoiceError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the audio path cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.audio.block_size == 0 {
            return Err(VoiceError::Config("audio.block_size must be > 0".to_string()));
        }
        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(VoiceError::Config("audio sample rates must be > 0".to_string()));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(VoiceError::Config(
                "session.connect_timeout_secs must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Write a config with every default spelled out.
    pub fn write_default(path: &Path) -> Result<()> {
        Self::default().write(path)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VoiceError::Config(format!(
                    "failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let yaml = serde_yaml_ng::to_string(self)
            .map_err(|e| VoiceError::Config(format!("failed to serialize config: {e}")))?;

        std::fs::write(path, yaml).map_err(|e| {
            VoiceError::Config(format!(
                "failed to write config file {}: {e}",
                path.display()
            ))
        })
    }

    /// Record `name` as the input or output device, keeping the rest of the file.
    pub fn set_audio_device(path: &Path, role: DeviceRole, name: &str) -> Result<()> {
        use serde_yaml_ng::{Mapping, Value};

        let mut root = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                VoiceError::Config(format!("failed to read config file {}: {e}", path.display()))
            })?;
            match serde_yaml_ng::from_str::<Value>(&contents) {
                Ok(Value::Mapping(map)) => map,
                Ok(Value::Null) => Mapping::new(),
                Ok(_) => {
                    return Err(VoiceError::Config(format!(
                        "{} is not a YAML mapping",
                        path.display()
                    )));
                }
                Err(e) => {
                    return Err(VoiceError::Config(format!(
                        "failed to parse config file {}: {e}",
                        path.display()
                    )));
                }
            }
        } else {
            Mapping::new()
        };

        let audio = root
            .entry(Value::String("audio".to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()))
            .as_mapping_mut()
            .ok_or_else(|| VoiceError::Config("audio section is not a mapping".to_string()))?;
        audio.insert(
            Value::String(role.config_key().to_string()),
            Value::String(name.to_string()),
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VoiceError::Config(format!(
                    "failed to create config directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let yaml = serde_yaml_ng::to_string(&Value::Mapping(root))
            .map_err(|e| VoiceError::Config(format!("failed to serialize config: {e}")))?;
        std::fs::write(path, yaml).map_err(|e| {
            VoiceError::Config(format!("failed to write config file {}: {e}", path.display()))
        })
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("poolvoice/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config =
            serde_yaml_ng::from_str("{}").unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.audio.block_size, 4096);
        assert_eq!(config.audio.sample_conversion, SampleConversion::Clamp);
        assert_eq!(config.service.voice, "Puck");
        assert_eq!(config.session.connect_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
audio:
  input_device: "USB Mic"
  output_device: "Headphones"
  capture_sample_rate: 8000
  playback_sample_rate: 22050
  block_size: 1024
  sample_conversion: wrap

service:
  url: "ws://127.0.0.1:9000/live"
  api_key: secret
  model: test-model
  voice: Kore
  system_instruction: "Be brief."

session:
  connect_timeout_secs: 5
"#;
        let config: Config =
            serde_yaml_ng::from_str(yaml).unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.audio.output_device.as_deref(), Some("Headphones"));
        assert_eq!(config.audio.capture_sample_rate, 8000);
        assert_eq!(config.audio.block_size, 1024);
        assert_eq!(config.audio.sample_conversion, SampleConversion::Wrap);
        assert_eq!(config.service.url, "ws://127.0.0.1:9000/live");
        assert_eq!(config.service.model, "test-model");
        assert_eq!(config.service.voice, "Kore");
        assert_eq!(config.session.connect_timeout_secs, 5);
        assert_eq!(
            config.service.resolve_api_key().unwrap_or_else(|e| panic!("{e}")),
            "secret"
        );
    }

    #[test]
    fn missing_config_file_gives_error() {
        let result = Config::load(Path::new("/nonexistent/config.yaml"));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("config file not found"));
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "audio:\n  block_size: 0\n").unwrap_or_else(|e| panic!("{e}"));

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("block_size"));
    }

    #[test]
    fn written_default_loads_back() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("nested/config.yaml");

        Config::write_default(&path).unwrap_or_else(|e| panic!("{e}"));
        let config = Config::load(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.service.model, default_model());
        assert!(config.service.api_key.is_none());
    }

    #[test]
    fn set_audio_device_keeps_other_settings() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "service:\n  voice: Kore\n").unwrap_or_else(|e| panic!("{e}"));

        Config::set_audio_device(&path, DeviceRole::Input, "USB Mic")
            .unwrap_or_else(|e| panic!("{e}"));
        Config::set_audio_device(&path, DeviceRole::Output, "Headphones")
            .unwrap_or_else(|e| panic!("{e}"));

        let config = Config::load(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(config.audio.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.audio.output_device.as_deref(), Some("Headphones"));
        assert_eq!(config.service.voice, "Kore");
    }

    #[test]
    fn expand_tilde_path() {
        let expanded = Config::expand_path("~/poolvoice");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
