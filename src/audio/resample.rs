use audioadapter_buffers::direct::SequentialSliceOfVecs;
use rubato::audioadapter::Adapter;
use rubato::{Fft, FixedSync, Resampler as RubatoResampler};

use crate::error::{Result, VoiceError};

const CHUNK_SIZE: usize = 1024;

/// Resamples multi-channel audio to mono f32 at a target rate.
pub struct Resampler {
    inner: Option<Fft<f32>>,
    channels: u16,
    source_rate: u32,
    target_rate: u32,
    input_buf: Vec<f32>,
}

impl Resampler {
    pub fn new(source_rate: u32, target_rate: u32, channels: u16) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 || channels == 0 {
            return Err(VoiceError::Resample(format!(
                "invalid resampler shape: {source_rate} Hz -> {target_rate} Hz, {channels} channels"
            )));
        }

        let inner = if source_rate == target_rate {
            None
        } else {
            Some(
                Fft::new(
                    source_rate as usize,
                    target_rate as usize,
                    CHUNK_SIZE,
                    2, // sub_chunks
                    1, // output is always mono
                    FixedSync::Input,
                )
                .map_err(|e| VoiceError::Resample(format!("failed to create resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            channels,
            source_rate,
            target_rate,
            input_buf: Vec::new(),
        })
    }

    /// Process interleaved multi-channel samples into mono at the target rate.
    ///
    /// Input that does not fill a whole resampler chunk is held for the next call.
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let mono = downmix(interleaved, self.channels);
        self.push_mono(mono)
    }

    fn push_mono(&mut self, mono: Vec<f32>) -> Result<Vec<f32>> {
        let Some(ref mut resampler) = self.inner else {
            return Ok(mono);
        };

        self.input_buf.extend_from_slice(&mono);

        let mut output = Vec::new();
        let frames_needed = resampler.input_frames_next();

        while self.input_buf.len() >= frames_needed {
            let chunk: Vec<f32> = self.input_buf.drain(..frames_needed).collect();
            let input_data = vec![chunk];
            let input_buf = SequentialSliceOfVecs::new(&input_data, 1, frames_needed)
                .map_err(|e| VoiceError::Resample(format!("buffer error: {e}")))?;
            let result = resampler
                .process(&input_buf, 0, None)
                .map_err(|e| VoiceError::Resample(format!("resample error: {e}")))?;
            for frame in 0..result.frames() {
                output.push(result.read_sample(0, frame).unwrap_or(0.0));
            }
        }

        Ok(output)
    }

    /// Resample a complete one-shot buffer.
    ///
    /// The filter delay is flushed with trailing silence and cut from the front,
    /// so the result lines up sample for sample with the input and has the
    /// length implied by the rate ratio. The resampler is reset afterwards.
    pub fn process_all(&mut self, interleaved: &[f32]) -> Result<Vec<f32>> {
        let frames_in = interleaved.len() / usize::from(self.channels);
        let expected = (frames_in as u64 * u64::from(self.target_rate)
            / u64::from(self.source_rate)) as usize;

        let Some(delay) = self.inner.as_ref().map(|r| r.output_delay()) else {
            return self.process(interleaved);
        };

        let mut output = self.process(interleaved)?;
        while output.len() < delay + expected {
            let needed = self
                .inner
                .as_ref()
                .map_or(CHUNK_SIZE, |r| r.input_frames_next());
            let padding = match needed.saturating_sub(self.input_buf.len()) {
                0 => needed,
                n => n,
            };
            output.extend(self.push_mono(vec![0.0; padding])?);
        }

        self.input_buf.clear();
        if let Some(ref mut resampler) = self.inner {
            resampler.reset();
        }

        output.drain(..delay);
        output.truncate(expected);
        Ok(output)
    }
}

fn downmix(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    let ch = usize::from(channels);
    interleaved
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / f32::from(channels))
        .collect()
}
