//! Leaf nodes: one analysis function per frame, results published on the bus.

use crate::{
    analysis::AnalysisSuite,
    bus::{Payload, Signal},
    config::BandMap,
    node::{expect_frame, NodeContext, NodeKind, NodeParams, PipelineNode},
    ChannelId, Frame, LivetapError, Packet, Result,
};

/// Pitch estimation algorithms a channel can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitchAlgorithm {
    Hps,
    ZeroCrossings,
    Fft,
    AutoCorrelation,
}

/// Which frames an algorithm consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Time,
    Frequency,
}

impl PitchAlgorithm {
    /// Resolves a configured algorithm name. Unrecognised names, including the
    /// empty string, select auto-correlation.
    pub fn resolve(name: &str) -> Self {
        match name {
            "hps" => PitchAlgorithm::Hps,
            "zero-crossings" => PitchAlgorithm::ZeroCrossings,
            "fft" => PitchAlgorithm::Fft,
            _ => PitchAlgorithm::AutoCorrelation,
        }
    }

    pub fn kind(self) -> NodeKind {
        match self {
            PitchAlgorithm::Hps => NodeKind::Hps,
            PitchAlgorithm::ZeroCrossings => NodeKind::ZeroCrossings,
            PitchAlgorithm::Fft => NodeKind::Fft,
            PitchAlgorithm::AutoCorrelation => NodeKind::AutoCorrelation,
        }
    }

    pub fn domain(self) -> Domain {
        match self {
            PitchAlgorithm::ZeroCrossings => Domain::Time,
            _ => Domain::Frequency,
        }
    }
}

/// Estimates the fundamental of each frame, then derives and publishes the
/// matching key.
#[derive(Debug)]
pub struct PitchWorker {
    algorithm: PitchAlgorithm,
    channel: ChannelId,
    sampling_rate: u32,
    suite: AnalysisSuite,
}

impl PitchWorker {
    pub fn new(algorithm: PitchAlgorithm, channel: ChannelId, params: &NodeParams) -> Self {
        Self {
            algorithm,
            channel,
            sampling_rate: params.sampling_rate,
            suite: params.suite.clone(),
        }
    }

    fn estimate(&self, frame: &Frame) -> Result<f32> {
        match self.algorithm.domain() {
            Domain::Time => {
                let samples = frame
                    .as_samples()
                    .ok_or_else(|| LivetapError::msg("expected time-domain samples"))?;
                (self.suite.zero_crossings)(samples, self.sampling_rate)
            }
            Domain::Frequency => {
                let spectrum = frame
                    .as_spectrum()
                    .ok_or_else(|| LivetapError::msg("expected a spectrum"))?;
                match self.algorithm {
                    PitchAlgorithm::Hps => (self.suite.hps)(spectrum),
                    PitchAlgorithm::Fft => (self.suite.fft)(spectrum),
                    _ => (self.suite.auto_correlation)(spectrum),
                }
            }
        }
    }
}

impl PipelineNode for PitchWorker {
    fn kind(&self) -> NodeKind {
        self.algorithm.kind()
    }

    fn channel(&self) -> Option<ChannelId> {
        Some(self.channel)
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let frame = expect_frame(packet, ctx)?;
        let pitch = self
            .estimate(&frame)
            .map_err(|err| LivetapError::processing(ctx.label, err.to_string()))?;

        ctx.bus
            .publish(Signal::Pitch, self.channel, Payload::Pitch(pitch))?;

        // Silence and unvoiced frames have no key.
        if pitch > 0.0 {
            let key = (self.suite.key)(pitch)
                .map_err(|err| LivetapError::processing(ctx.label, err.to_string()))?;
            ctx.bus.publish(Signal::Key, self.channel, Payload::Key(key))?;
        }

        Ok(Vec::new())
    }
}

/// Publishes normalised power for each configured frequency band.
#[derive(Debug)]
pub struct BandsWorker {
    channel: ChannelId,
    bands: BandMap,
    suite: AnalysisSuite,
}

impl BandsWorker {
    pub fn new(channel: ChannelId, params: &NodeParams) -> Self {
        Self {
            channel,
            bands: params.bands.clone(),
            suite: params.suite.clone(),
        }
    }

    pub fn bands(&self) -> &BandMap {
        &self.bands
    }
}

impl PipelineNode for BandsWorker {
    fn kind(&self) -> NodeKind {
        NodeKind::Bands
    }

    fn channel(&self) -> Option<ChannelId> {
        Some(self.channel)
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let frame = expect_frame(packet, ctx)?;
        let spectrum = frame.as_spectrum().ok_or_else(|| {
            LivetapError::processing(ctx.label, "band power needs a spectrum")
        })?;

        let powers = (self.suite.bands)(spectrum, &self.bands)
            .map_err(|err| LivetapError::processing(ctx.label, err.to_string()))?;
        ctx.bus
            .publish(Signal::Bands, self.channel, Payload::Bands(powers))?;

        Ok(Vec::new())
    }
}
