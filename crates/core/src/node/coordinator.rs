//! Internal nodes: receive a packet, optionally transform it, and hand the
//! result back to the runtime for broadcast to every child on the same
//! channel.

use crate::{
    analysis::{AnalysisSuite, BeatTracker},
    bus::{Payload, Signal},
    node::{expect_frame, NodeContext, NodeKind, NodeParams, PipelineNode},
    ChannelId, Frame, LivetapError, Packet, Result,
};

/// Top-level node. Splits interleaved buffers into one frame per analysed
/// channel, or averages them into channel 0 when channels are merged.
#[derive(Debug)]
pub struct RootCoordinator {
    input_channels: usize,
    analysed: Vec<ChannelId>,
    merge_channels: bool,
}

impl RootCoordinator {
    pub fn new(params: &NodeParams) -> Self {
        Self {
            input_channels: params.input_channels,
            analysed: (0..params.analysed_channels).map(ChannelId).collect(),
            merge_channels: params.merge_channels,
        }
    }
}

impl PipelineNode for RootCoordinator {
    fn kind(&self) -> NodeKind {
        NodeKind::Root
    }

    fn channel(&self) -> Option<ChannelId> {
        None
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let buffer = match packet {
            Packet::Buffer(buffer) => buffer,
            other => {
                return Err(LivetapError::processing(
                    ctx.label,
                    format!("expected a multi-channel buffer, got a {}", other.describe()),
                ))
            }
        };

        if buffer.channels() != self.input_channels {
            return Err(LivetapError::processing(
                ctx.label,
                format!(
                    "buffer carries {} channels, pipeline expects {}",
                    buffer.channels(),
                    self.input_channels
                ),
            ));
        }

        if self.merge_channels {
            return Ok(vec![Frame::samples(ChannelId(0), buffer.downmix())]);
        }

        Ok(self
            .analysed
            .iter()
            .filter_map(|&channel| buffer.channel(channel).map(|samples| Frame::samples(channel, samples)))
            .collect())
    }
}

/// Beat detection. Publishes a `beat` event per block from the amplitude
/// envelope and forwards the time-domain frame unchanged.
#[derive(Debug)]
pub struct BpmCoordinator {
    channel: ChannelId,
    tracker: BeatTracker,
    suite: AnalysisSuite,
}

impl BpmCoordinator {
    pub fn new(channel: ChannelId, params: &NodeParams) -> Self {
        Self {
            channel,
            tracker: BeatTracker::new(params.sampling_rate),
            suite: params.suite.clone(),
        }
    }
}

impl PipelineNode for BpmCoordinator {
    fn kind(&self) -> NodeKind {
        NodeKind::Bpm
    }

    fn channel(&self) -> Option<ChannelId> {
        Some(self.channel)
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let frame = expect_frame(packet, ctx)?;
        let samples = frame.as_samples().ok_or_else(|| {
            LivetapError::processing(ctx.label, "beat detection needs time-domain samples")
        })?;

        let envelope = (self.suite.envelope)(samples);
        let estimate = self.tracker.observe(envelope, samples.len());
        if estimate.detected {
            tracing::debug!(node = ctx.label, tempo = ?estimate.tempo_bpm, "beat");
        }
        ctx.bus
            .publish(Signal::Beat, self.channel, Payload::Beat(estimate))?;

        Ok(vec![frame])
    }
}

/// Passthrough coordinator used for the frequency and spectrogram stages.
/// It only checks that frames arrive in the domain its children expect.
#[derive(Debug)]
pub struct RelayCoordinator {
    kind: NodeKind,
    channel: ChannelId,
}

impl RelayCoordinator {
    pub fn frequency(channel: ChannelId) -> Self {
        Self {
            kind: NodeKind::Frequency,
            channel,
        }
    }

    /// Reserved stage in front of genre classification.
    pub fn spectrogram(channel: ChannelId) -> Self {
        Self {
            kind: NodeKind::Spectrogram,
            channel,
        }
    }
}

impl PipelineNode for RelayCoordinator {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn channel(&self) -> Option<ChannelId> {
        Some(self.channel)
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let frame = expect_frame(packet, ctx)?;
        let domain_ok = match self.kind {
            NodeKind::Spectrogram => frame.as_spectrum().is_some(),
            _ => frame.as_samples().is_some(),
        };
        if !domain_ok {
            return Err(LivetapError::processing(
                ctx.label,
                format!("unexpected {} frame", frame.domain()),
            ));
        }
        Ok(vec![frame])
    }
}

/// Applies the time to frequency transform once per frame so every
/// spectrum-domain child shares the same result.
#[derive(Debug)]
pub struct SpectrumCoordinator {
    channel: ChannelId,
    sampling_rate: u32,
    suite: AnalysisSuite,
}

impl SpectrumCoordinator {
    pub fn new(channel: ChannelId, params: &NodeParams) -> Self {
        Self {
            channel,
            sampling_rate: params.sampling_rate,
            suite: params.suite.clone(),
        }
    }
}

impl PipelineNode for SpectrumCoordinator {
    fn kind(&self) -> NodeKind {
        NodeKind::Spectrum
    }

    fn channel(&self) -> Option<ChannelId> {
        Some(self.channel)
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        let frame = expect_frame(packet, ctx)?;
        let samples = frame.as_samples().ok_or_else(|| {
            LivetapError::processing(ctx.label, "spectrum transform needs time-domain samples")
        })?;

        let spectrum = (self.suite.spectrum)(samples, self.sampling_rate)
            .map_err(|err| LivetapError::processing(ctx.label, err.to_string()))?;
        Ok(vec![Frame::spectrum(self.channel, spectrum)])
    }
}
