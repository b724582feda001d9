use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};

use super::{Microphone, MicrophoneStream};

/// Raw callback buffers queued before the input context falls behind.
const RAW_QUEUE_DEPTH: usize = 64;

/// Microphone backed by a cpal input device.
pub struct CpalMicrophone {
    device_name: Option<String>,
}

impl CpalMicrophone {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device.clone(),
        }
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&self) -> Result<Box<dyn MicrophoneStream>> {
        let stream = CpalMicrophoneStream::open(self.device_name.clone())?;
        Ok(Box::new(stream))
    }
}

/// A live cpal input stream.
///
/// The cpal stream is not `Send`, so it lives on an owner thread that drops it
/// once the handle is released. Release only signals that thread.
pub struct CpalMicrophoneStream {
    receiver: Receiver<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
    stop_tx: Option<Sender<()>>,
}

impl CpalMicrophoneStream {
    fn open(device_name: Option<String>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (tx, rx) = bounded::<Vec<f32>>(RAW_QUEUE_DEPTH);

        std::thread::Builder::new()
            .name("mic-stream".to_string())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), tx) {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Blocks until release sends or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("microphone stream released");
            })?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| VoiceError::PermissionDenied("microphone thread exited".to_string()))??;

        tracing::info!(sample_rate, channels, "microphone acquired");

        Ok(Self {
            receiver: rx,
            sample_rate,
            channels,
            stop_tx: Some(stop_tx),
        })
    }
}

impl MicrophoneStream for CpalMicrophoneStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn receiver(&self) -> Receiver<Vec<f32>> {
        self.receiver.clone()
    }

    fn release(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for CpalMicrophoneStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn find_input_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        host.input_devices()
            .map_err(|e| {
                VoiceError::PermissionDenied(format!("failed to enumerate input devices: {e}"))
            })?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| VoiceError::PermissionDenied(format!("input device not found: {name}")))
    } else {
        host.default_input_device().ok_or_else(|| {
            VoiceError::PermissionDenied("no default input device available".to_string())
        })
    }
}

fn build_input_stream(
    name: Option<&str>,
    tx: Sender<Vec<f32>>,
) -> Result<(cpal::Stream, u32, u16)> {
    let device = find_input_device(name)?;

    let supported = device.default_input_config().map_err(|e| {
        VoiceError::PermissionDenied(format!("failed to get default input config: {e}"))
    })?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                // try_send keeps the audio callback from ever blocking
                let _ = tx.try_send(data.to_vec());
            },
            |err: cpal::StreamError| {
                tracing::error!("microphone stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::PermissionDenied(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::PermissionDenied(format!("failed to start input stream: {e}")))?;

    Ok((stream, sample_rate, channels))
}

pub(crate) fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

/// Names of all input devices the host reports.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| VoiceError::Audio(format!("failed to enumerate input devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| device_name(&d))
}
