//! Pipeline node abstraction.
//!
//! Nodes form a closed set: [`NodeKind`] enumerates every node type and
//! [`AnyNode`] holds the matching behaviour. Every behaviour implements
//! [`PipelineNode`], the capability the runtime drives from a node's thread:
//! `start` once, `handle_frame` per received packet, `stop` once after the
//! queue has been drained.

pub mod coordinator;
pub mod queue;
pub mod registry;
pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    analysis::AnalysisSuite, config::BandMap, AnalysisConfig, ChannelId, EventBus, Frame,
    LivetapError, Packet, Result,
};

pub use coordinator::{BpmCoordinator, RelayCoordinator, RootCoordinator, SpectrumCoordinator};
pub use queue::{queue, Inlet};
pub use worker::{BandsWorker, Domain, PitchAlgorithm, PitchWorker};

/// Every node type the topology builder can place in a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Root,
    Bpm,
    Frequency,
    Spectrum,
    Spectrogram,
    ZeroCrossings,
    AutoCorrelation,
    Hps,
    Fft,
    Bands,
}

impl NodeKind {
    pub const ALL: [NodeKind; 10] = [
        NodeKind::Root,
        NodeKind::Bpm,
        NodeKind::Frequency,
        NodeKind::Spectrum,
        NodeKind::Spectrogram,
        NodeKind::ZeroCrossings,
        NodeKind::AutoCorrelation,
        NodeKind::Hps,
        NodeKind::Fft,
        NodeKind::Bands,
    ];

    /// Registry name of the node type.
    pub fn name(self) -> &'static str {
        match self {
            NodeKind::Root => "Root",
            NodeKind::Bpm => "BPM",
            NodeKind::Frequency => "Frequency",
            NodeKind::Spectrum => "Spectrum",
            NodeKind::Spectrogram => "Spectrogram",
            NodeKind::ZeroCrossings => "ZeroCrossings",
            NodeKind::AutoCorrelation => "AutoCorrelation",
            NodeKind::Hps => "HPS",
            NodeKind::Fft => "FFT",
            NodeKind::Bands => "Bands",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Construction-time parameters handed to every node constructor.
#[derive(Debug, Clone)]
pub struct NodeParams {
    /// `None` only for the root node.
    pub channel: Option<ChannelId>,
    /// Channel count of the buffers the root receives.
    pub input_channels: usize,
    /// Channels that own a sub-tree.
    pub analysed_channels: usize,
    pub merge_channels: bool,
    pub sampling_rate: u32,
    pub bands: BandMap,
    pub suite: AnalysisSuite,
}

impl NodeParams {
    pub fn root(config: &AnalysisConfig, suite: &AnalysisSuite) -> Self {
        Self {
            channel: None,
            input_channels: config.channels,
            analysed_channels: config.analysed_channels(),
            merge_channels: config.merge_channels,
            sampling_rate: config.sampling_rate,
            bands: config.bands.clone(),
            suite: suite.clone(),
        }
    }

    pub fn for_channel(config: &AnalysisConfig, suite: &AnalysisSuite, channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
            ..Self::root(config, suite)
        }
    }

    /// The channel of a per-channel node; fails for parameters built for the
    /// root.
    pub(crate) fn require_channel(&self, kind: NodeKind) -> Result<ChannelId> {
        self.channel
            .ok_or_else(|| LivetapError::node_construction(kind.name(), "a channel id is required"))
    }
}

/// Per-thread view a node gets while handling packets.
#[derive(Debug)]
pub struct NodeContext<'a> {
    pub bus: &'a EventBus,
    /// Thread label, e.g. `Spectrum/1`.
    pub label: &'a str,
}

/// Capability shared by every node variant.
pub trait PipelineNode: Send {
    fn kind(&self) -> NodeKind;

    fn channel(&self) -> Option<ChannelId>;

    /// Called once on the node's thread before the first packet.
    fn start(&mut self, _ctx: &NodeContext) {}

    /// Processes one packet and returns the frames to broadcast to children.
    /// Workers publish their results on the bus and return nothing.
    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>>;

    /// Called once after the input queue has closed and drained.
    fn stop(&mut self, _ctx: &NodeContext) {}
}

/// Enum dispatch over the built-in node behaviours.
#[derive(Debug)]
pub enum AnyNode {
    Root(RootCoordinator),
    Bpm(BpmCoordinator),
    Relay(RelayCoordinator),
    Spectrum(SpectrumCoordinator),
    Pitch(PitchWorker),
    Bands(BandsWorker),
}

impl PipelineNode for AnyNode {
    fn kind(&self) -> NodeKind {
        match self {
            AnyNode::Root(n) => n.kind(),
            AnyNode::Bpm(n) => n.kind(),
            AnyNode::Relay(n) => n.kind(),
            AnyNode::Spectrum(n) => n.kind(),
            AnyNode::Pitch(n) => n.kind(),
            AnyNode::Bands(n) => n.kind(),
        }
    }

    fn channel(&self) -> Option<ChannelId> {
        match self {
            AnyNode::Root(n) => n.channel(),
            AnyNode::Bpm(n) => n.channel(),
            AnyNode::Relay(n) => n.channel(),
            AnyNode::Spectrum(n) => n.channel(),
            AnyNode::Pitch(n) => n.channel(),
            AnyNode::Bands(n) => n.channel(),
        }
    }

    fn start(&mut self, ctx: &NodeContext) {
        match self {
            AnyNode::Root(n) => n.start(ctx),
            AnyNode::Bpm(n) => n.start(ctx),
            AnyNode::Relay(n) => n.start(ctx),
            AnyNode::Spectrum(n) => n.start(ctx),
            AnyNode::Pitch(n) => n.start(ctx),
            AnyNode::Bands(n) => n.start(ctx),
        }
    }

    fn handle_frame(&mut self, packet: Packet, ctx: &NodeContext) -> Result<Vec<Frame>> {
        match self {
            AnyNode::Root(n) => n.handle_frame(packet, ctx),
            AnyNode::Bpm(n) => n.handle_frame(packet, ctx),
            AnyNode::Relay(n) => n.handle_frame(packet, ctx),
            AnyNode::Spectrum(n) => n.handle_frame(packet, ctx),
            AnyNode::Pitch(n) => n.handle_frame(packet, ctx),
            AnyNode::Bands(n) => n.handle_frame(packet, ctx),
        }
    }

    fn stop(&mut self, ctx: &NodeContext) {
        match self {
            AnyNode::Root(n) => n.stop(ctx),
            AnyNode::Bpm(n) => n.stop(ctx),
            AnyNode::Relay(n) => n.stop(ctx),
            AnyNode::Spectrum(n) => n.stop(ctx),
            AnyNode::Pitch(n) => n.stop(ctx),
            AnyNode::Bands(n) => n.stop(ctx),
        }
    }
}

/// Label used for thread names and log fields.
pub fn label(kind: NodeKind, channel: Option<ChannelId>) -> String {
    match channel {
        Some(channel) => format!("{kind}/{channel}"),
        None => kind.name().to_string(),
    }
}

/// Unwraps a single-channel frame, rejecting the packet otherwise.
pub(crate) fn expect_frame(packet: Packet, ctx: &NodeContext) -> Result<Frame> {
    match packet {
        Packet::Frame(frame) => Ok(frame),
        other => Err(LivetapError::processing(
            ctx.label,
            format!("expected a single-channel frame, got a {}", other.describe()),
        )),
    }
}
