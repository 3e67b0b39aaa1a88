//! Bounded node queues.
//!
//! Every node owns the receiving end of one queue. The producing side, an
//! [`Inlet`], is held by the parent (or by the pipeline for the root) and
//! applies the configured [`Backpressure`] policy when the queue is full.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::{
    config::{Backpressure, QueueSettings},
    ChannelId, LivetapError, Packet, Result,
};

/// Producer handle for a node's queue.
#[derive(Debug)]
pub struct Inlet {
    channel: Option<ChannelId>,
    sender: Sender<Packet>,
    /// Second receiver used only to evict the oldest packet under the
    /// drop-oldest policy.
    evictor: Option<Receiver<Packet>>,
    evicted: Arc<AtomicU64>,
}

/// Creates a queue for a node on `channel` (`None` for the root).
pub fn queue(settings: QueueSettings, channel: Option<ChannelId>) -> (Inlet, Receiver<Packet>) {
    let (sender, receiver) = bounded(settings.capacity.max(1));
    let evictor = match settings.policy {
        Backpressure::DropOldest => Some(receiver.clone()),
        Backpressure::Block => None,
    };
    let inlet = Inlet {
        channel,
        sender,
        evictor,
        evicted: Arc::new(AtomicU64::new(0)),
    };
    (inlet, receiver)
}

impl Inlet {
    /// Whether frames for `channel` belong in this queue.
    pub fn accepts(&self, channel: ChannelId) -> bool {
        self.channel.map_or(true, |own| own == channel)
    }

    /// Shared counter of packets evicted from this queue.
    pub fn evicted(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.evicted)
    }

    /// Enqueues `packet`. Under drop-oldest this never blocks; under block it
    /// waits for space.
    pub fn send(&self, packet: Packet) -> Result<()> {
        let Some(evictor) = &self.evictor else {
            return self.sender.send(packet).map_err(|_| LivetapError::Closed);
        };

        let mut packet = packet;
        loop {
            match self.sender.try_send(packet) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(rejected)) => {
                    if evictor.try_recv().is_ok() {
                        let total = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(channel = ?self.channel, total, "queue full, evicted oldest packet");
                    }
                    packet = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return Err(LivetapError::Closed),
            }
        }
    }
}
