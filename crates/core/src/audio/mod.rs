use std::{f32::consts::PI, fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{LivetapError, Result};

/// Index of one independent stream inside a multi-channel source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interleaved multi-channel block as produced by a capture backend. This is
/// the only input the root node accepts.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    channels: usize,
    samples: Arc<[f32]>,
}

impl AudioBuffer {
    /// Wraps interleaved samples. The sample count must be a whole multiple of
    /// the channel count.
    pub fn interleaved(channels: usize, samples: impl Into<Arc<[f32]>>) -> Result<Self> {
        let samples = samples.into();
        if channels == 0 {
            return Err(LivetapError::msg("audio buffer requires at least one channel"));
        }
        if samples.len() % channels != 0 {
            return Err(LivetapError::msg(format!(
                "{} samples cannot be split across {channels} channels",
                samples.len()
            )));
        }
        Ok(Self { channels, samples })
    }

    /// Builds a buffer from one sample vector per channel.
    pub fn from_channels(channels: &[Vec<f32>]) -> Result<Self> {
        let frames = channels.first().map(Vec::len).unwrap_or(0);
        if channels.iter().any(|channel| channel.len() != frames) {
            return Err(LivetapError::msg("all channels must hold the same number of samples"));
        }

        let mut samples = Vec::with_capacity(frames * channels.len());
        for index in 0..frames {
            samples.extend(channels.iter().map(|channel| channel[index]));
        }
        Self::interleaved(channels.len(), samples)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Extracts the samples belonging to `channel`.
    pub fn channel(&self, channel: ChannelId) -> Option<Arc<[f32]>> {
        if channel.0 >= self.channels {
            return None;
        }
        Some(
            self.samples
                .iter()
                .skip(channel.0)
                .step_by(self.channels)
                .copied()
                .collect(),
        )
    }

    /// Averages every channel into a single mono stream.
    pub fn downmix(&self) -> Arc<[f32]> {
        let scale = 1.0 / self.channels as f32;
        self.samples
            .chunks_exact(self.channels)
            .map(|frame| frame.iter().sum::<f32>() * scale)
            .collect()
    }
}

/// Magnitude spectrum of one real-valued block.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    /// `fft_size / 2 + 1` magnitudes, DC first.
    pub magnitudes: Vec<f32>,
    pub sampling_rate: u32,
    /// Length of the time-domain block the spectrum was computed from.
    pub fft_size: usize,
}

impl Spectrum {
    /// Width of a single bin in Hz.
    pub fn bin_hz(&self) -> f32 {
        if self.fft_size == 0 {
            0.0
        } else {
            self.sampling_rate as f32 / self.fft_size as f32
        }
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }
}

/// Data carried by a [`Frame`]. Both variants are reference counted and never
/// exposed mutably, so a frame broadcast to several children is one shared,
/// read-only allocation.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Samples(Arc<[f32]>),
    Spectrum(Arc<Spectrum>),
}

/// One unit of single-channel audio flowing below the root node.
#[derive(Debug, Clone)]
pub struct Frame {
    channel: ChannelId,
    payload: FramePayload,
}

impl Frame {
    pub fn samples(channel: ChannelId, samples: impl Into<Arc<[f32]>>) -> Self {
        Self {
            channel,
            payload: FramePayload::Samples(samples.into()),
        }
    }

    pub fn spectrum(channel: ChannelId, spectrum: Spectrum) -> Self {
        Self {
            channel,
            payload: FramePayload::Spectrum(Arc::new(spectrum)),
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn payload(&self) -> &FramePayload {
        &self.payload
    }

    /// Time-domain samples, if this is a time-domain frame.
    pub fn as_samples(&self) -> Option<&[f32]> {
        match &self.payload {
            FramePayload::Samples(samples) => Some(samples),
            FramePayload::Spectrum(_) => None,
        }
    }

    /// Spectrum, if this is a frequency-domain frame.
    pub fn as_spectrum(&self) -> Option<&Spectrum> {
        match &self.payload {
            FramePayload::Spectrum(spectrum) => Some(spectrum),
            FramePayload::Samples(_) => None,
        }
    }

    /// Short description used in diagnostics.
    pub fn domain(&self) -> &'static str {
        match self.payload {
            FramePayload::Samples(_) => "time-domain",
            FramePayload::Spectrum(_) => "frequency-domain",
        }
    }
}

/// Item carried by a node queue.
#[derive(Debug, Clone)]
pub enum Packet {
    Buffer(AudioBuffer),
    Frame(Frame),
}

impl Packet {
    pub fn describe(&self) -> &'static str {
        match self {
            Packet::Buffer(_) => "multi-channel buffer",
            Packet::Frame(frame) => frame.domain(),
        }
    }
}

/// Deterministic sine source used by the command line demo and by tests in
/// place of a capture backend.
#[derive(Debug, Clone)]
pub struct ToneGenerator {
    sampling_rate: u32,
    channels: usize,
    frequencies: Vec<f32>,
    amplitude: f32,
    position: u64,
}

impl ToneGenerator {
    /// One tone per channel. Channel `n` plays `frequency * (n + 1)`.
    pub fn new(sampling_rate: u32, channels: usize, frequency: f32) -> Self {
        Self {
            sampling_rate,
            channels,
            frequencies: (0..channels).map(|n| frequency * (n + 1) as f32).collect(),
            amplitude: 0.5,
            position: 0,
        }
    }

    /// Renders the next `frames` samples per channel.
    pub fn next_buffer(&mut self, frames: usize) -> Result<AudioBuffer> {
        let rate = self.sampling_rate.max(1) as f32;
        let mut samples = Vec::with_capacity(frames * self.channels);
        for offset in 0..frames as u64 {
            let t = (self.position + offset) as f32 / rate;
            samples.extend(
                self.frequencies
                    .iter()
                    .map(|hz| self.amplitude * (2.0 * PI * hz * t).sin()),
            );
        }
        self.position += frames as u64;
        AudioBuffer::interleaved(self.channels, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demultiplexes_interleaved_samples() {
        let buffer = AudioBuffer::interleaved(2, vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0]).unwrap();

        assert_eq!(buffer.frames(), 3);
        assert_eq!(&*buffer.channel(ChannelId(0)).unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(&*buffer.channel(ChannelId(1)).unwrap(), &[-1.0, -2.0, -3.0]);
        assert!(buffer.channel(ChannelId(2)).is_none());
    }

    #[test]
    fn rejects_ragged_buffers() {
        assert!(AudioBuffer::interleaved(2, vec![0.0; 3]).is_err());
        assert!(AudioBuffer::interleaved(0, vec![0.0; 4]).is_err());
        assert!(AudioBuffer::from_channels(&[vec![0.0; 2], vec![0.0; 3]]).is_err());
    }

    #[test]
    fn downmix_averages_channels() {
        let buffer = AudioBuffer::from_channels(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        assert_eq!(&*buffer.downmix(), &[0.5, 0.5]);
    }

    #[test]
    fn fan_out_clones_share_the_payload() {
        let frame = Frame::samples(ChannelId(0), vec![0.25; 8]);
        let copy = frame.clone();
        match (frame.payload(), copy.payload()) {
            (FramePayload::Samples(a), FramePayload::Samples(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected time-domain frames"),
        }
    }

    #[test]
    fn tone_generator_is_continuous_across_buffers() {
        let mut tone = ToneGenerator::new(8_000, 1, 100.0);
        let first = tone.next_buffer(40).unwrap();
        let second = tone.next_buffer(40).unwrap();

        assert_eq!(first.frames(), 40);
        // 100 Hz at 8 kHz repeats every 80 samples.
        let start = first.channel(ChannelId(0)).unwrap()[0];
        let after_period = tone.next_buffer(1).unwrap().channel(ChannelId(0)).unwrap()[0];
        assert!((start - after_period).abs() < 1e-3);
        assert!(!second.is_empty());
    }
}
