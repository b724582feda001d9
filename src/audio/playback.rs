use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, StreamConfig};
use crossbeam_channel::{Sender, bounded};
use tokio::sync::mpsc;

use crate::codec::DecodedBuffer;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};

use super::capture::device_name;
use super::resample::Resampler;

/// Identifies one scheduled buffer on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaybackId(pub u64);

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A buffer scheduled or playing on an output device.
pub trait PlaybackHandle: Send {
    /// Stop the buffer now. Stopping one that already finished may error; callers ignore it.
    fn stop(&mut self) -> Result<()>;
}

/// Something that plays buffers at times on its own running clock.
///
/// Natural completion of a buffer is reported by sending its id on the
/// completion channel the device was created with.
pub trait OutputDevice: Send {
    /// Seconds since the device clock started.
    fn current_time(&self) -> f64;

    fn play_at(
        &mut self,
        id: PlaybackId,
        buffer: DecodedBuffer,
        start_at: f64,
    ) -> Result<Box<dyn PlaybackHandle>>;
}

struct Voice {
    id: PlaybackId,
    start_frame: u64,
    channels: Vec<Vec<f32>>,
    position: usize,
    stopped: Arc<AtomicBool>,
}

impl Voice {
    fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }
}

/// Sums active voices into interleaved device frames and keeps the device clock.
pub(crate) struct Mixer {
    voices: Vec<Voice>,
    clock: u64,
    completed: mpsc::UnboundedSender<PlaybackId>,
}

impl Mixer {
    pub(crate) const fn new(completed: mpsc::UnboundedSender<PlaybackId>) -> Self {
        Self {
            voices: Vec::new(),
            clock: 0,
            completed,
        }
    }

    pub(crate) const fn clock(&self) -> u64 {
        self.clock
    }

    fn add(&mut self, voice: Voice) {
        self.voices.push(voice);
    }

    pub(crate) fn render(&mut self, data: &mut [f32], channels: usize) {
        let channels = channels.max(1);

        for (i, frame) in data.chunks_mut(channels).enumerate() {
            let now = self.clock + i as u64;
            frame.fill(0.0);

            for voice in &mut self.voices {
                if voice.stopped.load(Ordering::Relaxed)
                    || now < voice.start_frame
                    || voice.position >= voice.len()
                {
                    continue;
                }
                let voice_channels = voice.channels.len();
                for (c, out) in frame.iter_mut().enumerate() {
                    *out += voice.channels[c % voice_channels][voice.position];
                }
                voice.position += 1;
            }

            for out in frame.iter_mut() {
                *out = out.clamp(-1.0, 1.0);
            }
        }

        self.clock += (data.len() / channels) as u64;

        let completed = &self.completed;
        self.voices.retain(|voice| {
            if voice.stopped.load(Ordering::Relaxed) {
                return false;
            }
            if voice.position >= voice.len() {
                let _ = completed.send(voice.id);
                return false;
            }
            true
        });
    }
}

struct MixerVoiceHandle {
    stopped: Arc<AtomicBool>,
}

impl PlaybackHandle for MixerVoiceHandle {
    fn stop(&mut self) -> Result<()> {
        self.stopped.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Output device backed by a cpal output stream.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    sample_rate: u32,
    stop_tx: Option<Sender<()>>,
    owner: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the configured output device; completions are sent on `completed`.
    pub fn open(config: &AudioConfig, completed: mpsc::UnboundedSender<PlaybackId>) -> Result<Self> {
        let mixer = Arc::new(Mutex::new(Mixer::new(completed)));
        let (ready_tx, ready_rx) = bounded::<Result<(u32, u16)>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let stream_mixer = Arc::clone(&mixer);
        let device_name = config.output_device.clone();
        let preferred_rate = config.playback_sample_rate;

        let owner = std::thread::Builder::new()
            .name("output-stream".to_string())
            .spawn(move || {
                let stream =
                    match build_output_stream(device_name.as_deref(), preferred_rate, stream_mixer)
                    {
                        Ok((stream, rate, channels)) => {
                            let _ = ready_tx.send(Ok((rate, channels)));
                            stream
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };

                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("output stream closed");
            })?;

        let (sample_rate, channels) = ready_rx
            .recv()
            .map_err(|_| VoiceError::Audio("output thread exited".to_string()))??;

        tracing::info!(sample_rate, channels, "output device opened");

        Ok(Self {
            mixer,
            sample_rate,
            stop_tx: Some(stop_tx),
            owner: Some(owner),
        })
    }

    fn lock_mixer(&self) -> Result<std::sync::MutexGuard<'_, Mixer>> {
        self.mixer
            .lock()
            .map_err(|_| VoiceError::Audio("output mixer poisoned".to_string()))
    }
}

/// Each buffer is converted on its own and keeps its exact duration, so
/// back-to-back buffers meet on the device clock without a gap.
fn to_device_rate(buffer: DecodedBuffer, device_rate: u32) -> Result<Vec<Vec<f32>>> {
    if buffer.sample_rate == device_rate {
        return Ok(buffer.channels);
    }

    buffer
        .channels
        .iter()
        .map(|channel| Resampler::new(buffer.sample_rate, device_rate, 1)?.process_all(channel))
        .collect()
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.lock_mixer()
            .map(|mixer| mixer.clock() as f64 / f64::from(self.sample_rate))
            .unwrap_or(0.0)
    }

    fn play_at(
        &mut self,
        id: PlaybackId,
        buffer: DecodedBuffer,
        start_at: f64,
    ) -> Result<Box<dyn PlaybackHandle>> {
        let channels = to_device_rate(buffer, self.sample_rate)?;
        let stopped = Arc::new(AtomicBool::new(false));
        let start_frame = (start_at.max(0.0) * f64::from(self.sample_rate)).round() as u64;

        self.lock_mixer()?.add(Voice {
            id,
            start_frame,
            channels,
            position: 0,
            stopped: Arc::clone(&stopped),
        });

        tracing::trace!(%id, start_at, "buffer queued on output device");
        Ok(Box::new(MixerVoiceHandle { stopped }))
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(owner) = self.owner.take() {
            let _ = owner.join();
        }
    }
}

fn find_output_device(name: Option<&str>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| VoiceError::Audio(format!("failed to enumerate output devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| VoiceError::Audio(format!("output device not found: {name}")))
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::Audio("no default output device available".to_string()))
    }
}

fn build_output_stream(
    name: Option<&str>,
    preferred_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
) -> Result<(cpal::Stream, u32, u16)> {
    let device = find_output_device(name)?;

    // Prefer the service's native rate so most buffers skip resampling
    let native = device
        .supported_output_configs()
        .map_err(|e| VoiceError::Audio(e.to_string()))?
        .find(|c| c.min_sample_rate() <= preferred_rate && c.max_sample_rate() >= preferred_rate)
        .map(|c| c.with_sample_rate(preferred_rate));

    let supported = match native {
        Some(c) => c,
        None => device
            .default_output_config()
            .map_err(|e| VoiceError::Audio(format!("failed to get default output config: {e}")))?,
    };

    let stream_config: StreamConfig = supported.config();
    let sample_rate = stream_config.sample_rate;
    let channels = stream_config.channels;
    let frame_channels = usize::from(channels);

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                if let Ok(mut mixer) = mixer.lock() {
                    mixer.render(data, frame_channels);
                } else {
                    data.fill(0.0);
                }
            },
            |err: cpal::StreamError| {
                tracing::error!("audio playback error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| VoiceError::Audio(format!("failed to start output stream: {e}")))?;

    Ok((stream, sample_rate, channels))
}

/// Names of all output devices the host reports.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| VoiceError::Audio(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}
