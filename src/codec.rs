use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VoiceError};

/// Scale between normalized samples and 16-bit integers.
pub const PCM_SCALE: f32 = 32768.0;

/// How out-of-range samples are mapped onto `i16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleConversion {
    /// Saturate at the `i16` bounds, then truncate toward zero.
    #[default]
    Clamp,
    /// Truncate toward zero, then wrap modulo 2^16.
    Wrap,
}

/// Sample rate and channel layout of a PCM payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    #[must_use]
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// MIME tag understood by the voice service, e.g. `audio/pcm;rate=16000`.
    #[must_use]
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Parse the `rate=` parameter of a MIME tag, falling back when absent.
    #[must_use]
    pub fn from_mime_type(mime: Option<&str>, fallback_rate: u32) -> Self {
        let sample_rate = mime
            .into_iter()
            .flat_map(|m| m.split(';'))
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse::<u32>().ok())
            .filter(|&rate| rate > 0)
            .unwrap_or(fallback_rate);

        Self::mono(sample_rate)
    }
}

/// Base64 text of packed PCM plus its format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: String,
    pub format: PcmFormat,
}

/// Per-channel normalized samples reconstructed from a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl DecodedBuffer {
    #[must_use]
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Playback length in seconds.
    #[must_use]
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / f64::from(self.sample_rate)
    }
}

/// Convert one normalized sample to `i16`.
#[must_use]
pub fn sample_to_pcm16(sample: f32, conversion: SampleConversion) -> i16 {
    let scaled = sample * PCM_SCALE;
    match conversion {
        SampleConversion::Clamp => scaled.clamp(-PCM_SCALE, PCM_SCALE - 1.0) as i16,
        // `as i32` truncates toward zero (NaN -> 0), `as i16` keeps the low 16 bits
        SampleConversion::Wrap => scaled as i32 as i16,
    }
}

/// Pack samples as little-endian `i16` bytes.
#[must_use]
pub fn pack_pcm16(samples: &[f32], conversion: SampleConversion) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_pcm16(sample, conversion).to_le_bytes());
    }
    bytes
}

/// Encode samples into a wire packet.
#[must_use]
pub fn encode(samples: &[f32], format: PcmFormat, conversion: SampleConversion) -> EncodedPacket {
    EncodedPacket {
        data: STANDARD.encode(pack_pcm16(samples, conversion)),
        format,
    }
}

/// Decode base64 text of interleaved little-endian `i16` PCM.
pub fn decode(data: &str, sample_rate: u32, channels: u16) -> Result<DecodedBuffer> {
    if channels == 0 {
        return Err(VoiceError::MalformedPacket(
            "channel count must be at least 1".to_string(),
        ));
    }

    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| VoiceError::MalformedPacket(format!("invalid base64: {e}")))?;

    if bytes.len() % 2 != 0 {
        return Err(VoiceError::MalformedPacket(format!(
            "odd PCM16 byte count: {}",
            bytes.len()
        )));
    }

    let ints: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    let channel_count = usize::from(channels);
    let frame_count = ints.len() / channel_count;

    let decoded = (0..channel_count)
        .map(|channel| {
            (0..frame_count)
                .map(|frame| f32::from(ints[frame * channel_count + channel]) / PCM_SCALE)
                .collect()
        })
        .collect();

    Ok(DecodedBuffer {
        sample_rate,
        channels: decoded,
    })
}
