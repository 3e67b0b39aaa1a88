//! Core library for the livetap analysis pipeline.
//!
//! A [`Topology`] is built from an [`AnalysisConfig`]: one root node that
//! splits multi-channel buffers, and per channel a small tree of
//! coordinators and workers. [`Pipeline::start`] runs every node on its own
//! thread. Workers publish their results as [`Event`]s on an [`EventBus`].

pub mod analysis;
pub mod audio;
pub mod bus;
pub mod config;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod topology;

pub use analysis::{AnalysisSuite, BeatEstimate, BeatTracker};
pub use audio::{AudioBuffer, ChannelId, Frame, FramePayload, Packet, Spectrum, ToneGenerator};
pub use bus::{ChannelFilter, Event, EventBus, Payload, Signal, SubscriptionId};
pub use config::{AnalysisConfig, Backpressure, QueueSettings, TaskFlags};
pub use error::{LivetapError, Result};
pub use node::{NodeKind, PipelineNode};
pub use pipeline::{LiveNodes, NodeReport, NodeStats, Pipeline, ShutdownMode, ShutdownReport};
pub use topology::{build, build_with, NodeShape, TaskSet, Topology};
