//! Thread-per-node runtime.
//!
//! [`Pipeline::start`] spawns one named thread per node of a [`Topology`],
//! leaves first, and wires each parent to its children's queues. Every
//! thread runs the same loop: block on its own queue, hand the packet to the
//! node, broadcast whatever frames come back to the children on the same
//! channel. Per-frame failures, including panics inside analysis functions,
//! are logged, counted and skipped; they never stop a node.
//!
//! Shutdown closes the root queue. A node leaves its loop once its queue is
//! closed and empty, then drops its children's inlets, so the signal walks
//! the tree root to leaf. The pipeline joins every thread before returning.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Receiver;
use serde::Serialize;

use crate::{
    config::{Backpressure, QueueSettings},
    node::{self, queue, AnyNode, Inlet, NodeContext, NodeKind, PipelineNode},
    topology::{self, NodeShape, PendingNode},
    AnalysisConfig, AudioBuffer, ChannelId, EventBus, Frame, LivetapError, Packet, Result,
    Topology,
};

/// What happens to packets still queued when shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Process every packet already queued before stopping. Queues keep
    /// their overflow policy while draining, so a full drop-oldest queue can
    /// still evict.
    Drain,
    /// Skip queued packets; they are counted as discarded.
    Discard,
}

/// Per-node counters collected over the node's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub processed: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl NodeStats {
    fn absorb(&mut self, other: NodeStats) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.discarded += other.discarded;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub kind: NodeKind,
    pub channel: Option<ChannelId>,
    pub stats: NodeStats,
    /// Packets evicted from this node's queue under drop-oldest.
    pub evicted: u64,
    /// The node thread died outside of frame handling.
    pub panicked: bool,
}

/// Outcome of [`Pipeline::shutdown`], one entry per node in root-to-leaf order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub nodes: Vec<NodeReport>,
}

impl ShutdownReport {
    pub fn node(&self, kind: NodeKind, channel: Option<ChannelId>) -> Option<&NodeReport> {
        self.nodes
            .iter()
            .find(|report| report.kind == kind && report.channel == channel)
    }

    /// Counters summed over every node.
    pub fn total(&self) -> NodeStats {
        let mut total = NodeStats::default();
        for report in &self.nodes {
            total.absorb(report.stats);
        }
        total
    }

    pub fn evicted(&self) -> u64 {
        self.nodes.iter().map(|report| report.evicted).sum()
    }
}

/// Observes how many node threads are still running. Remains valid after
/// the pipeline itself is gone.
#[derive(Debug, Clone)]
pub struct LiveNodes(Arc<AtomicUsize>);

impl LiveNodes {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decrements the live count when a node thread ends, however it ends.
struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// State shared by every node thread of one pipeline.
#[derive(Clone)]
struct Runtime {
    bus: EventBus,
    cancel: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    queue: QueueSettings,
}

/// Join handle and bookkeeping for one spawned node.
struct RunningNode {
    kind: NodeKind,
    channel: Option<ChannelId>,
    thread: Option<JoinHandle<NodeStats>>,
    evicted: Arc<AtomicU64>,
    children: Vec<RunningNode>,
}

impl RunningNode {
    fn join_into(mut self, reports: &mut Vec<NodeReport>) {
        let (stats, panicked) = match self.thread.take().map(JoinHandle::join) {
            Some(Ok(stats)) => (stats, false),
            Some(Err(payload)) => {
                tracing::error!(
                    node = %node::label(self.kind, self.channel),
                    panic = %panic_message(payload.as_ref()),
                    "node thread panicked"
                );
                (NodeStats::default(), true)
            }
            None => (NodeStats::default(), false),
        };

        reports.push(NodeReport {
            kind: self.kind,
            channel: self.channel,
            stats,
            evicted: self.evicted.load(Ordering::Relaxed),
            panicked,
        });

        for child in self.children {
            child.join_into(reports);
        }
    }
}

/// A running node tree. Owns every node thread; dropping it performs a
/// discarding shutdown.
pub struct Pipeline {
    inlet: Option<Inlet>,
    root: Option<RunningNode>,
    shape: NodeShape,
    bus: EventBus,
    cancel: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
}

impl Pipeline {
    /// Builds the topology for `config` with default analysis functions and
    /// starts it.
    pub fn build(config: &AnalysisConfig, bus: EventBus) -> Result<Self> {
        topology::build(config)?.start(bus)
    }

    /// Spawns every node of `topology`. Results are published on `bus`.
    pub fn start(topology: Topology, bus: EventBus) -> Result<Self> {
        let shape = topology.shape();
        let (root, settings) = topology.into_parts();
        let runtime = Runtime {
            bus: bus.clone(),
            cancel: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicUsize::new(0)),
            queue: settings,
        };

        let (inlet, root) = spawn(root, &runtime)?;
        tracing::info!(
            nodes = shape.node_count(),
            capacity = settings.capacity,
            policy = ?settings.policy,
            "pipeline started"
        );

        Ok(Self {
            inlet: Some(inlet),
            root: Some(root),
            shape,
            bus,
            cancel: runtime.cancel,
            live: runtime.live,
        })
    }

    /// Feeds one interleaved multi-channel buffer to the root node.
    pub fn push(&self, buffer: AudioBuffer) -> Result<()> {
        self.push_packet(Packet::Buffer(buffer))
    }

    /// Feeds an arbitrary packet to the root node. The root only understands
    /// buffers; anything else is dropped there with a warning.
    pub fn push_packet(&self, packet: Packet) -> Result<()> {
        self.inlet
            .as_ref()
            .ok_or(LivetapError::Closed)?
            .send(packet)
    }

    pub fn shape(&self) -> &NodeShape {
        &self.shape
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn live_nodes(&self) -> LiveNodes {
        LiveNodes(Arc::clone(&self.live))
    }

    /// Stops every node and waits for all threads to exit.
    pub fn shutdown(mut self, mode: ShutdownMode) -> ShutdownReport {
        self.stop(mode)
    }

    fn stop(&mut self, mode: ShutdownMode) -> ShutdownReport {
        if mode == ShutdownMode::Discard {
            self.cancel.store(true, Ordering::Release);
        }
        drop(self.inlet.take());

        let mut nodes = Vec::with_capacity(self.shape.node_count());
        if let Some(root) = self.root.take() {
            root.join_into(&mut nodes);
        }
        let report = ShutdownReport { nodes };

        let total = report.total();
        tracing::info!(
            ?mode,
            processed = total.processed,
            failed = total.failed,
            discarded = total.discarded,
            evicted = report.evicted(),
            "pipeline stopped"
        );
        report
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.root.is_some() {
            self.stop(ShutdownMode::Discard);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("nodes", &self.shape.node_count())
            .field("live", &self.live.load(Ordering::SeqCst))
            .field("running", &self.root.is_some())
            .finish()
    }
}

fn spawn(pending: PendingNode, runtime: &Runtime) -> Result<(Inlet, RunningNode)> {
    let (node, pending_children) = pending.into_parts();

    let mut inlets = Vec::with_capacity(pending_children.len());
    let mut children = Vec::with_capacity(pending_children.len());
    for child in pending_children {
        match spawn(child, runtime) {
            Ok((inlet, running)) => {
                inlets.push(inlet);
                children.push(running);
            }
            Err(err) => {
                abandon(inlets, children);
                return Err(err);
            }
        }
    }

    let kind = node.kind();
    let channel = node.channel();
    let label = node::label(kind, channel);
    let (inlet, inbox) = queue(queue_settings(kind, runtime.queue), channel);
    let evicted = inlet.evicted();

    let shared = runtime.clone();
    runtime.live.fetch_add(1, Ordering::SeqCst);
    let spawned = thread::Builder::new()
        .name(format!("livetap-{label}"))
        .spawn(move || {
            let _guard = LiveGuard(Arc::clone(&shared.live));
            run_node(node, inbox, inlets, &shared, &label)
        });
    let thread = match spawned {
        Ok(thread) => thread,
        Err(err) => {
            // The rejected closure, and the child inlets with it, is already
            // dropped, so the children are on their way out.
            runtime.live.fetch_sub(1, Ordering::SeqCst);
            abandon(Vec::new(), children);
            return Err(err.into());
        }
    };

    Ok((
        inlet,
        RunningNode {
            kind,
            channel,
            thread: Some(thread),
            evicted,
            children,
        },
    ))
}

/// Only the root queue honours `block`. Every queue below it drops its
/// oldest packet when full so a stalled child never holds up its siblings.
fn queue_settings(kind: NodeKind, settings: QueueSettings) -> QueueSettings {
    if kind == NodeKind::Root {
        settings
    } else {
        QueueSettings {
            policy: Backpressure::DropOldest,
            ..settings
        }
    }
}

/// Closes the queues of already spawned children and joins them. Used when
/// a later spawn fails part way through the tree.
fn abandon(inlets: Vec<Inlet>, children: Vec<RunningNode>) {
    drop(inlets);
    let mut reports = Vec::with_capacity(children.len());
    for child in children {
        child.join_into(&mut reports);
    }
    tracing::warn!(joined = reports.len(), "pipeline start aborted");
}

fn run_node(
    mut node: AnyNode,
    inbox: Receiver<Packet>,
    children: Vec<Inlet>,
    runtime: &Runtime,
    label: &str,
) -> NodeStats {
    let ctx = NodeContext {
        bus: &runtime.bus,
        label,
    };
    let mut stats = NodeStats::default();

    node.start(&ctx);
    tracing::debug!(node = label, children = children.len(), "node started");

    for packet in inbox.iter() {
        if runtime.cancel.load(Ordering::Acquire) {
            stats.discarded += 1;
            continue;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| node.handle_frame(packet, &ctx))) {
            Ok(Ok(frames)) => {
                stats.processed += 1;
                broadcast(frames, &children, label);
            }
            Ok(Err(err)) => {
                stats.failed += 1;
                tracing::warn!(node = label, error = %err, "dropped frame");
            }
            Err(payload) => {
                stats.failed += 1;
                tracing::warn!(
                    node = label,
                    panic = %panic_message(payload.as_ref()),
                    "frame handler panicked, dropped frame"
                );
            }
        }
    }

    node.stop(&ctx);
    // Closing the child queues is what stops the children.
    drop(children);
    tracing::debug!(
        node = label,
        processed = stats.processed,
        failed = stats.failed,
        discarded = stats.discarded,
        "node stopped"
    );
    stats
}

/// Hands each frame to every child on the frame's channel. Children share
/// the frame's payload; nothing is copied.
fn broadcast(frames: Vec<Frame>, children: &[Inlet], label: &str) {
    for frame in frames {
        for child in children.iter().filter(|child| child.accepts(frame.channel())) {
            if let Err(err) = child.send(Packet::Frame(frame.clone())) {
                tracing::warn!(node = label, error = %err, "child queue closed");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        analysis::AnalysisSuite,
        bus::{ChannelFilter, Payload, Signal},
        config::{Backpressure, TaskFlags},
        topology::build_with,
        Spectrum, ToneGenerator,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn config(tasks: TaskFlags, algorithm: &str) -> AnalysisConfig {
        AnalysisConfig {
            channels: 1,
            sampling_rate: 8_000,
            tasks,
            pitch_algorithm: algorithm.to_string(),
            ..Default::default()
        }
    }

    fn pitch_only(algorithm: &str) -> AnalysisConfig {
        config(
            TaskFlags {
                pitch: true,
                ..TaskFlags::none()
            },
            algorithm,
        )
    }

    fn mono(value: f32, len: usize) -> AudioBuffer {
        AudioBuffer::interleaved(1, vec![value; len]).unwrap()
    }

    fn pitches(rx: &Receiver<crate::Event>) -> Vec<f32> {
        rx.try_iter()
            .map(|event| match event.payload {
                Payload::Pitch(hz) => hz,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect()
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let mut config = pitch_only("zero-crossings");
        config.queue = QueueSettings {
            capacity: 64,
            policy: Backpressure::Block,
        };
        let mut suite = AnalysisSuite::default();
        suite.zero_crossings = Arc::new(|samples: &[f32], _: u32| -> Result<f32> { Ok(samples[0]) });

        let bus = EventBus::new();
        let (_, rx) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let pipeline = build_with(&config, &suite).unwrap().start(bus).unwrap();

        for n in 1..=50 {
            pipeline.push(mono(n as f32, 16)).unwrap();
        }
        let report = pipeline.shutdown(ShutdownMode::Drain);

        let expected: Vec<f32> = (1..=50).map(|n| n as f32).collect();
        assert_eq!(pitches(&rx), expected);
        assert_eq!(report.total().failed, 0);
        assert_eq!(report.evicted(), 0);
    }

    #[test]
    fn blocked_child_does_not_delay_siblings() {
        let config = config(
            TaskFlags {
                pitch: true,
                bands: true,
                ..TaskFlags::none()
            },
            "hps",
        );
        let (release, gate) = unbounded::<()>();
        let mut suite = AnalysisSuite::default();
        suite.hps = Arc::new(move |_: &Spectrum| -> Result<f32> {
            // Blocks until the sender side is dropped.
            let _ = gate.recv();
            Ok(220.0)
        });

        let bus = EventBus::new();
        let (_, bands) = bus.subscribe_channel(Signal::Bands, ChannelFilter::Any).unwrap();
        let (_, pitch) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let pipeline = build_with(&config, &suite).unwrap().start(bus).unwrap();

        for _ in 0..3 {
            pipeline.push(mono(0.5, 256)).unwrap();
        }
        for _ in 0..3 {
            bands
                .recv_timeout(WAIT)
                .expect("bands must be delivered while HPS is blocked");
        }
        assert!(pitch.try_recv().is_err());

        drop(release);
        let report = pipeline.shutdown(ShutdownMode::Drain);

        assert_eq!(pitches(&pitch).len(), 3);
        let spectrum = report
            .node(NodeKind::Spectrum, Some(ChannelId(0)))
            .expect("spectrum node");
        assert_eq!(spectrum.stats.processed, 3);
    }

    #[test]
    fn failing_analysis_is_isolated_to_the_frame() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut suite = AnalysisSuite::default();
        suite.fft = Arc::new(move |_: &Spectrum| -> Result<f32> {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 => Err(LivetapError::msg("estimator failed")),
                1 => panic!("estimator exploded"),
                _ => Ok(440.0),
            }
        });

        let bus = EventBus::new();
        let (_, rx) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let mut config = pitch_only("fft");
        config.queue.policy = Backpressure::Block;
        let pipeline = build_with(&config, &suite).unwrap().start(bus).unwrap();

        for _ in 0..4 {
            pipeline.push(mono(0.25, 64)).unwrap();
        }
        let report = pipeline.shutdown(ShutdownMode::Drain);

        assert_eq!(pitches(&rx), vec![440.0, 440.0]);
        let fft = report.node(NodeKind::Fft, Some(ChannelId(0))).unwrap();
        assert_eq!(fft.stats.failed, 2);
        assert_eq!(fft.stats.processed, 2);
        assert!(!fft.panicked);
    }

    #[test]
    fn malformed_packets_are_dropped_and_the_loop_continues() {
        let bus = EventBus::new();
        let (_, rx) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let pipeline = Pipeline::build(&pitch_only("zero-crossings"), bus).unwrap();

        pipeline
            .push_packet(Packet::Frame(Frame::samples(ChannelId(0), vec![1.0; 8])))
            .unwrap();
        pipeline
            .push(AudioBuffer::interleaved(2, vec![0.0; 8]).unwrap())
            .unwrap();
        pipeline.push(mono(0.0, 64)).unwrap();
        let report = pipeline.shutdown(ShutdownMode::Drain);

        let root = report.node(NodeKind::Root, None).unwrap();
        assert_eq!(root.stats.failed, 2);
        assert_eq!(root.stats.processed, 1);
        assert_eq!(pitches(&rx).len(), 1);
    }

    #[test]
    fn shutdown_joins_every_node() {
        let mut config = config(TaskFlags::default(), "fft");
        config.channels = 2;
        let pipeline = Pipeline::build(&config, EventBus::new()).unwrap();
        let live = pipeline.live_nodes();
        let nodes = pipeline.shape().node_count();
        assert_eq!(live.get(), nodes);

        let mut tone = ToneGenerator::new(8_000, 2, 440.0);
        for _ in 0..3 {
            pipeline.push(tone.next_buffer(512).unwrap()).unwrap();
        }
        let report = pipeline.shutdown(ShutdownMode::Drain);

        assert_eq!(live.get(), 0);
        assert_eq!(report.nodes.len(), nodes);
        assert_eq!(report.nodes[0].kind, NodeKind::Root);
        assert!(report.nodes.iter().all(|node| node.stats.processed == 3));
    }

    #[test]
    fn discard_skips_queued_frames() {
        let mut suite = AnalysisSuite::default();
        suite.fft = Arc::new(|_: &Spectrum| -> Result<f32> {
            thread::sleep(Duration::from_millis(20));
            Ok(440.0)
        });
        let mut config = pitch_only("fft");
        config.queue = QueueSettings {
            capacity: 64,
            policy: Backpressure::Block,
        };

        let bus = EventBus::new();
        let (_, rx) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let pipeline = build_with(&config, &suite).unwrap().start(bus).unwrap();
        let live = pipeline.live_nodes();

        for _ in 0..20 {
            pipeline.push(mono(0.1, 64)).unwrap();
        }
        let report = pipeline.shutdown(ShutdownMode::Discard);

        assert_eq!(live.get(), 0);
        assert!(report.total().discarded > 0);
        assert!(pitches(&rx).len() < 20);
    }

    #[test]
    fn dropping_the_pipeline_stops_its_threads() {
        let pipeline = Pipeline::build(&pitch_only("fft"), EventBus::new()).unwrap();
        let live = pipeline.live_nodes();
        assert!(live.get() > 0);

        drop(pipeline);
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn analyses_every_channel_end_to_end() {
        let mut config = config(TaskFlags::default(), "auto-correlation");
        config.channels = 2;

        let bus = EventBus::new();
        let (_, pitch) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let (_, keys) = bus
            .subscribe_channel(Signal::Key, ChannelFilter::Only(ChannelId(1)))
            .unwrap();
        let (_, beats) = bus.subscribe_channel(Signal::Beat, ChannelFilter::Any).unwrap();
        let (_, bands) = bus.subscribe_channel(Signal::Bands, ChannelFilter::Any).unwrap();
        let pipeline = Pipeline::build(&config, bus).unwrap();

        let mut tone = ToneGenerator::new(8_000, 2, 440.0);
        for _ in 0..4 {
            pipeline.push(tone.next_buffer(1024).unwrap()).unwrap();
        }
        pipeline.shutdown(ShutdownMode::Drain);

        let events: Vec<_> = pitch.try_iter().collect();
        assert_eq!(events.len(), 8);
        for event in events {
            let expected = if event.channel == ChannelId(0) { 440.0 } else { 880.0 };
            match event.payload {
                Payload::Pitch(hz) => assert!((hz - expected).abs() < expected * 0.05, "pitch {hz}"),
                other => panic!("unexpected payload {other:?}"),
            }
        }
        let keys: Vec<_> = keys.try_iter().map(|event| event.payload).collect();
        assert_eq!(keys, vec![Payload::Key("A5".into()); 4]);
        assert_eq!(beats.try_iter().count(), 8);
        assert_eq!(bands.try_iter().count(), 8);
    }

    #[test]
    fn drop_oldest_bounds_a_stalled_queue() {
        let (release, gate) = unbounded::<()>();
        let mut suite = AnalysisSuite::default();
        suite.fft = Arc::new(move |_: &Spectrum| -> Result<f32> {
            let _ = gate.recv();
            Ok(1.0)
        });
        let mut config = pitch_only("fft");
        config.queue = QueueSettings {
            capacity: 2,
            policy: Backpressure::DropOldest,
        };

        let pipeline = build_with(&config, &suite)
            .unwrap()
            .start(EventBus::new())
            .unwrap();
        for _ in 0..40 {
            pipeline.push(mono(0.1, 64)).unwrap();
        }
        // Let the upstream nodes push into the stalled worker's queue.
        thread::sleep(Duration::from_millis(100));
        drop(release);
        let report = pipeline.shutdown(ShutdownMode::Drain);

        let fft = report.node(NodeKind::Fft, Some(ChannelId(0))).unwrap();
        assert!(report.evicted() > 0);
        assert!(fft.stats.processed < 40);
    }

    #[test]
    fn block_policy_applies_only_at_the_root() {
        let block = QueueSettings {
            capacity: 8,
            policy: Backpressure::Block,
        };
        assert_eq!(queue_settings(NodeKind::Root, block), block);
        for kind in NodeKind::ALL.into_iter().filter(|kind| *kind != NodeKind::Root) {
            let settings = queue_settings(kind, block);
            assert_eq!(settings.policy, Backpressure::DropOldest);
            assert_eq!(settings.capacity, 8);
        }
    }

    #[test]
    fn blocked_child_does_not_delay_siblings_under_block_policy() {
        let mut config = config(
            TaskFlags {
                pitch: true,
                bands: true,
                ..TaskFlags::none()
            },
            "hps",
        );
        config.queue = QueueSettings {
            capacity: 2,
            policy: Backpressure::Block,
        };
        let (release, gate) = unbounded::<()>();
        let mut suite = AnalysisSuite::default();
        suite.hps = Arc::new(move |_: &Spectrum| -> Result<f32> {
            let _ = gate.recv();
            Ok(220.0)
        });

        let bus = EventBus::new();
        let (_, bands) = bus.subscribe_channel(Signal::Bands, ChannelFilter::Any).unwrap();
        let (_, pitch) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let pipeline = build_with(&config, &suite).unwrap().start(bus).unwrap();

        for n in 0..10 {
            pipeline.push(mono(0.5, 256)).unwrap();
            bands
                .recv_timeout(WAIT)
                .unwrap_or_else(|_| panic!("bands event {n} held up by the stalled HPS worker"));
        }

        drop(release);
        let report = pipeline.shutdown(ShutdownMode::Drain);

        let hps = report.node(NodeKind::Hps, Some(ChannelId(0))).unwrap();
        assert!(hps.evicted > 0);
        assert_eq!(pitches(&pitch).len() as u64 + hps.evicted, 10);
    }

    #[test]
    fn abandoning_a_partial_tree_joins_spawned_nodes() {
        let topology = build_with(&pitch_only("fft"), &AnalysisSuite::default()).unwrap();
        let (root, settings) = topology.into_parts();
        let runtime = Runtime {
            bus: EventBus::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            live: Arc::new(AtomicUsize::new(0)),
            queue: settings,
        };

        let (inlet, running) = spawn(root, &runtime).unwrap();
        assert_eq!(runtime.live.load(Ordering::SeqCst), 4);

        abandon(vec![inlet], vec![running]);
        assert_eq!(runtime.live.load(Ordering::SeqCst), 0);
    }
}
