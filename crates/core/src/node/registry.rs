//! Static name → constructor table for every node type.

use crate::{
    node::{
        AnyNode, BandsWorker, BpmCoordinator, NodeKind, NodeParams, PitchAlgorithm, PitchWorker,
        RelayCoordinator, RootCoordinator, SpectrumCoordinator,
    },
    LivetapError, Result,
};

/// Builds one node from its construction parameters.
pub type Constructor = fn(&NodeParams) -> Result<AnyNode>;

static REGISTRY: [(NodeKind, Constructor); 10] = [
    (NodeKind::Root, root),
    (NodeKind::Bpm, bpm),
    (NodeKind::Frequency, frequency),
    (NodeKind::Spectrum, spectrum),
    (NodeKind::Spectrogram, spectrogram),
    (NodeKind::ZeroCrossings, zero_crossings),
    (NodeKind::AutoCorrelation, auto_correlation),
    (NodeKind::Hps, hps),
    (NodeKind::Fft, fft),
    (NodeKind::Bands, bands),
];

/// Looks up a node type by its registry name.
pub fn resolve(name: &str) -> Result<NodeKind> {
    REGISTRY
        .iter()
        .map(|(kind, _)| *kind)
        .find(|kind| kind.name() == name)
        .ok_or_else(|| LivetapError::node_construction(name, "no such node type"))
}

/// Constructs the node registered under `name`.
pub fn construct(name: &str, params: &NodeParams) -> Result<AnyNode> {
    construct_kind(resolve(name)?, params)
}

pub fn construct_kind(kind: NodeKind, params: &NodeParams) -> Result<AnyNode> {
    let (_, constructor) = REGISTRY
        .iter()
        .find(|(registered, _)| *registered == kind)
        .ok_or_else(|| LivetapError::node_construction(kind.name(), "not registered"))?;
    constructor(params)
}

fn root(params: &NodeParams) -> Result<AnyNode> {
    if params.channel.is_some() {
        return Err(LivetapError::node_construction(
            NodeKind::Root.name(),
            "the root node does not belong to a channel",
        ));
    }
    Ok(AnyNode::Root(RootCoordinator::new(params)))
}

fn bpm(params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(NodeKind::Bpm)?;
    Ok(AnyNode::Bpm(BpmCoordinator::new(channel, params)))
}

fn frequency(params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(NodeKind::Frequency)?;
    Ok(AnyNode::Relay(RelayCoordinator::frequency(channel)))
}

fn spectrum(params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(NodeKind::Spectrum)?;
    Ok(AnyNode::Spectrum(SpectrumCoordinator::new(channel, params)))
}

fn spectrogram(params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(NodeKind::Spectrogram)?;
    Ok(AnyNode::Relay(RelayCoordinator::spectrogram(channel)))
}

fn zero_crossings(params: &NodeParams) -> Result<AnyNode> {
    pitch(PitchAlgorithm::ZeroCrossings, params)
}

fn auto_correlation(params: &NodeParams) -> Result<AnyNode> {
    pitch(PitchAlgorithm::AutoCorrelation, params)
}

fn hps(params: &NodeParams) -> Result<AnyNode> {
    pitch(PitchAlgorithm::Hps, params)
}

fn fft(params: &NodeParams) -> Result<AnyNode> {
    pitch(PitchAlgorithm::Fft, params)
}

fn pitch(algorithm: PitchAlgorithm, params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(algorithm.kind())?;
    Ok(AnyNode::Pitch(PitchWorker::new(algorithm, channel, params)))
}

fn bands(params: &NodeParams) -> Result<AnyNode> {
    let channel = params.require_channel(NodeKind::Bands)?;
    Ok(AnyNode::Bands(BandsWorker::new(channel, params)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analysis::AnalysisSuite, node::PipelineNode, AnalysisConfig, ChannelId};

    fn channel_params() -> NodeParams {
        NodeParams::for_channel(&AnalysisConfig::default(), &AnalysisSuite::default(), ChannelId(0))
    }

    #[test]
    fn every_kind_is_registered_under_its_name() {
        for kind in NodeKind::ALL {
            assert_eq!(resolve(kind.name()).unwrap(), kind);
        }
    }

    #[test]
    fn constructs_nodes_of_the_requested_kind() {
        let params = channel_params();
        for kind in NodeKind::ALL.into_iter().filter(|kind| *kind != NodeKind::Root) {
            let node = construct(kind.name(), &params).unwrap();
            assert_eq!(node.kind(), kind);
            assert_eq!(node.channel(), Some(ChannelId(0)));
        }
    }

    #[test]
    fn unknown_names_fail_construction() {
        let err = construct("Genre", &channel_params()).unwrap_err();
        assert!(matches!(err, LivetapError::NodeConstruction { ref name, .. } if name == "Genre"));
    }

    #[test]
    fn channel_requirements_are_enforced() {
        let root_params = NodeParams::root(&AnalysisConfig::default(), &AnalysisSuite::default());
        assert!(construct("Bands", &root_params).is_err());
        assert!(construct("Root", &channel_params()).is_err());
        assert!(construct("Root", &root_params).is_ok());
    }
}
