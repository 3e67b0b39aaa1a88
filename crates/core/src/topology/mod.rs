//! Builds the node tree for a configuration.
//!
//! Construction is synchronous and has no side effects beyond allocating
//! nodes: no thread is spawned until the returned [`Topology`] is started.
//! Per channel, leaves are created first and then wrapped by the
//! coordinators that feed them:
//!
//! ```text
//! Root
//! ├── BPM/c
//! └── Frequency/c
//!     ├── ZeroCrossings/c
//!     └── Spectrum/c
//!         ├── HPS/c | FFT/c | AutoCorrelation/c
//!         ├── Bands/c
//!         └── Spectrogram/c   (reserved)
//! ```

use std::fmt;

use serde::Serialize;

use crate::{
    analysis::AnalysisSuite,
    config::{BandMap, QueueSettings},
    node::{
        registry, AnyNode, Domain, NodeKind, NodeParams, PitchAlgorithm, PipelineNode,
    },
    AnalysisConfig, ChannelId, EventBus, LivetapError, Pipeline, Result,
};

/// Analysis tasks enabled for a run, with their resolved parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSet {
    pub beat: bool,
    pub pitch: Option<PitchAlgorithm>,
    /// Reserved; read but never turned into nodes.
    pub genre: bool,
    pub bands: Option<BandMap>,
}

impl TaskSet {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            beat: config.tasks.beat,
            pitch: config
                .tasks
                .pitch
                .then(|| PitchAlgorithm::resolve(&config.pitch_algorithm)),
            genre: config.tasks.genre,
            bands: config.tasks.bands.then(|| config.bands.clone()),
        }
    }
}

/// A constructed node together with the children it feeds.
#[derive(Debug)]
pub(crate) struct PendingNode {
    node: AnyNode,
    children: Vec<PendingNode>,
}

impl PendingNode {
    pub fn kind(&self) -> NodeKind {
        self.node.kind()
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.node.channel()
    }

    pub fn shape(&self) -> NodeShape {
        NodeShape {
            kind: self.kind(),
            channel: self.channel(),
            children: self.children.iter().map(PendingNode::shape).collect(),
        }
    }

    pub(crate) fn into_parts(self) -> (AnyNode, Vec<PendingNode>) {
        (self.node, self.children)
    }
}

/// Plain description of a node tree, detached from any running node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeShape {
    pub kind: NodeKind,
    pub channel: Option<ChannelId>,
    pub children: Vec<NodeShape>,
}

impl NodeShape {
    /// Number of nodes of `kind` anywhere in the tree.
    pub fn count(&self, kind: NodeKind) -> usize {
        let own = usize::from(self.kind == kind);
        own + self
            .children
            .iter()
            .map(|child| child.count(kind))
            .sum::<usize>()
    }

    /// Total number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(NodeShape::node_count).sum::<usize>()
    }

    /// Every node of `kind`, in depth-first order.
    pub fn find_all(&self, kind: NodeKind) -> Vec<&NodeShape> {
        let mut found = Vec::new();
        self.collect(kind, &mut found);
        found
    }

    fn collect<'a>(&'a self, kind: NodeKind, found: &mut Vec<&'a NodeShape>) {
        if self.kind == kind {
            found.push(self);
        }
        for child in &self.children {
            child.collect(kind, found);
        }
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let label = crate::node::label(self.kind, self.channel);
        writeln!(f, "{:indent$}{label}", "", indent = depth * 2)?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// A fully constructed but not yet running node tree.
#[derive(Debug)]
pub struct Topology {
    root: PendingNode,
    queue: QueueSettings,
}

impl Topology {
    pub fn shape(&self) -> NodeShape {
        self.root.shape()
    }

    /// Spawns one thread per node and starts consuming input.
    pub fn start(self, bus: EventBus) -> Result<Pipeline> {
        Pipeline::start(self, bus)
    }

    pub(crate) fn into_parts(self) -> (PendingNode, QueueSettings) {
        (self.root, self.queue)
    }
}

/// Builds the topology for `config` with the default analysis functions.
pub fn build(config: &AnalysisConfig) -> Result<Topology> {
    build_with(config, &AnalysisSuite::default())
}

/// Builds the topology for `config`, binding nodes to `suite`.
pub fn build_with(config: &AnalysisConfig, suite: &AnalysisSuite) -> Result<Topology> {
    if config.channels == 0 {
        return Err(LivetapError::config(
            "channel count must be at least one",
        ));
    }

    let tasks = TaskSet::from_config(config);
    let mut root_peers = Vec::new();

    for channel in (0..config.analysed_channels()).map(ChannelId) {
        let params = NodeParams::for_channel(config, suite, channel);
        let mut frequency_inputs = Vec::new();
        let mut spectrum_inputs = Vec::new();
        let spectrogram_inputs: Vec<PendingNode> = Vec::new();

        if tasks.beat {
            root_peers.push(leaf(NodeKind::Bpm.name(), &params)?);
        }

        if let Some(algorithm) = tasks.pitch {
            let worker = leaf(algorithm.kind().name(), &params)?;
            match algorithm.domain() {
                Domain::Time => frequency_inputs.push(worker),
                Domain::Frequency => spectrum_inputs.push(worker),
            }
        }

        if tasks.genre {
            tracing::debug!(%channel, "genre classification is reserved, no nodes constructed");
        }

        if tasks.bands.is_some() {
            spectrum_inputs.push(leaf(NodeKind::Bands.name(), &params)?);
        }

        if !spectrogram_inputs.is_empty() {
            spectrum_inputs.push(branch(NodeKind::Spectrogram.name(), &params, spectrogram_inputs)?);
        }

        if !spectrum_inputs.is_empty() {
            frequency_inputs.push(branch(NodeKind::Spectrum.name(), &params, spectrum_inputs)?);
        }

        if !frequency_inputs.is_empty() {
            root_peers.push(branch(NodeKind::Frequency.name(), &params, frequency_inputs)?);
        }
    }

    if root_peers.is_empty() {
        return Err(LivetapError::config(
            "no analysis tasks enabled; enable at least one of beat, pitch or bands",
        ));
    }

    let root = branch(NodeKind::Root.name(), &NodeParams::root(config, suite), root_peers)?;
    tracing::debug!(nodes = root.shape().node_count(), "built pipeline topology");

    Ok(Topology {
        root,
        queue: config.queue,
    })
}

fn leaf(name: &str, params: &NodeParams) -> Result<PendingNode> {
    branch(name, params, Vec::new())
}

fn branch(name: &str, params: &NodeParams, children: Vec<PendingNode>) -> Result<PendingNode> {
    Ok(PendingNode {
        node: registry::construct(name, params)?,
        children,
    })
}
