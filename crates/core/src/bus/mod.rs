//! In-process publish/subscribe channel between pipeline nodes and result
//! consumers.
//!
//! An [`EventBus`] is an ordinary value: the pipeline receives one at start-up
//! and hands clones to every node that publishes. There is no process-wide
//! registry. Delivery happens synchronously on the publishing node's thread,
//! so events for one `(signal, channel)` pair arrive in publish order while
//! events from different nodes may interleave freely.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use crossbeam_channel::{unbounded, Receiver};
use serde::{Deserialize, Serialize};

use crate::{analysis::BeatEstimate, ChannelId, LivetapError, Result};

/// Names under which results are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Beat,
    Pitch,
    Key,
    Bands,
    /// Reserved for genre classification.
    Spectrogram,
}

impl Signal {
    pub const ALL: [Signal; 5] = [
        Signal::Beat,
        Signal::Pitch,
        Signal::Key,
        Signal::Bands,
        Signal::Spectrogram,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Signal::Beat => "beat",
            Signal::Pitch => "pitch",
            Signal::Key => "key",
            Signal::Bands => "bands",
            Signal::Spectrogram => "spectrogram",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signal-specific result value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Beat(BeatEstimate),
    /// Frequency in Hz.
    Pitch(f32),
    /// Note label such as `A4`.
    Key(String),
    /// Band name to normalised power.
    Bands(BTreeMap<String, f32>),
    Spectrogram(Vec<f32>),
}

/// One published result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub signal: Signal,
    pub channel: ChannelId,
    pub payload: Payload,
}

/// Restricts a subscription to one sender channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelFilter {
    #[default]
    Any,
    Only(ChannelId),
}

impl ChannelFilter {
    pub fn matches(self, channel: ChannelId) -> bool {
        match self {
            ChannelFilter::Any => true,
            ChannelFilter::Only(wanted) => wanted == channel,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// Whether a subscriber could still take an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// The consuming end is gone; the subscription is pruned.
    Disconnected,
}

type Callback = Arc<dyn Fn(&Event) -> Delivery + Send + Sync>;

struct Subscriber {
    id: SubscriptionId,
    signal: Signal,
    filter: ChannelFilter,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    subscribers: Vec<Subscriber>,
}

/// Cloneable handle to a shared subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for every event on `signal` accepted by `filter`.
    ///
    /// Callbacks run on the publishing node's thread and should return
    /// quickly; a slow callback stalls that node.
    pub fn subscribe<F>(&self, signal: Signal, filter: ChannelFilter, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(
            signal,
            filter,
            Arc::new(move |event: &Event| {
                callback(event);
                Delivery::Delivered
            }),
        )
    }

    /// Subscribes through an unbounded queue instead of a callback. The
    /// subscription is removed on the first publish after the receiver is
    /// dropped.
    pub fn subscribe_channel(
        &self,
        signal: Signal,
        filter: ChannelFilter,
    ) -> Result<(SubscriptionId, Receiver<Event>)> {
        let (tx, rx) = unbounded();
        let id = self.register(
            signal,
            filter,
            Arc::new(move |event: &Event| match tx.send(event.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Disconnected,
            }),
        )?;
        Ok((id, rx))
    }

    fn register(&self, signal: Signal, filter: ChannelFilter, callback: Callback) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write()?.subscribers.push(Subscriber {
            id,
            signal,
            filter,
            callback,
        });
        tracing::trace!(%signal, ?filter, ?id, "subscribed");
        Ok(id)
    }

    /// Removes a subscription. Returns `false` when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let mut registry = self.write()?;
        let before = registry.subscribers.len();
        registry.subscribers.retain(|subscriber| subscriber.id != id);
        Ok(registry.subscribers.len() != before)
    }

    /// Delivers an event to every matching subscriber and returns how many
    /// received it. Channel subscriptions whose receiver is gone are not
    /// counted and are removed.
    pub fn publish(&self, signal: Signal, channel: ChannelId, payload: Payload) -> Result<usize> {
        // Snapshot the callbacks so they run without holding the lock and may
        // themselves subscribe or unsubscribe.
        let targets: Vec<(SubscriptionId, Callback)> = self
            .read()?
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.signal == signal && subscriber.filter.matches(channel))
            .map(|subscriber| (subscriber.id, Arc::clone(&subscriber.callback)))
            .collect();

        if targets.is_empty() {
            return Ok(0);
        }

        let event = Event {
            signal,
            channel,
            payload,
        };
        let mut delivered = 0;
        let mut disconnected = Vec::new();
        for (id, callback) in &targets {
            match callback(&event) {
                Delivery::Delivered => delivered += 1,
                Delivery::Disconnected => disconnected.push(*id),
            }
        }

        if !disconnected.is_empty() {
            self.write()?
                .subscribers
                .retain(|subscriber| !disconnected.contains(&subscriber.id));
            tracing::debug!(%signal, pruned = disconnected.len(), "removed subscriptions with dropped receivers");
        }
        Ok(delivered)
    }

    pub fn subscriber_count(&self) -> usize {
        self.read()
            .map(|registry| registry.subscribers.len())
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Registry>> {
        self.registry
            .read()
            .map_err(|_| LivetapError::msg("event bus registry has been poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Registry>> {
        self.registry
            .write()
            .map_err(|_| LivetapError::msg("event bus registry has been poisoned"))
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, thread};

    use super::*;

    #[test]
    fn delivers_only_matching_signal() {
        let bus = EventBus::new();
        let (_, pitch) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        let (_, key) = bus.subscribe_channel(Signal::Key, ChannelFilter::Any).unwrap();

        let delivered = bus
            .publish(Signal::Pitch, ChannelId(0), Payload::Pitch(440.0))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(pitch.try_recv().unwrap().payload, Payload::Pitch(440.0));
        assert!(key.try_recv().is_err());
    }

    #[test]
    fn channel_filter_restricts_delivery() {
        let bus = EventBus::new();
        let (_, rx) = bus
            .subscribe_channel(Signal::Key, ChannelFilter::Only(ChannelId(1)))
            .unwrap();

        bus.publish(Signal::Key, ChannelId(0), Payload::Key("A4".into()))
            .unwrap();
        bus.publish(Signal::Key, ChannelId(1), Payload::Key("C4".into()))
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.channel, ChannelId(1));
        assert_eq!(event.payload, Payload::Key("C4".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe_channel(Signal::Beat, ChannelFilter::Any).unwrap();

        assert!(bus.unsubscribe(id).unwrap());
        assert!(!bus.unsubscribe(id).unwrap());
        assert_eq!(bus.subscriber_count(), 0);

        let delivered = bus
            .publish(Signal::Pitch, ChannelId(0), Payload::Pitch(1.0))
            .unwrap();
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn callbacks_may_subscribe_while_publishing() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.subscribe(Signal::Pitch, ChannelFilter::Any, move |_| {
            inner
                .subscribe(Signal::Key, ChannelFilter::Any, |_| {})
                .expect("nested subscribe should not deadlock");
        })
        .unwrap();

        bus.publish(Signal::Pitch, ChannelId(0), Payload::Pitch(1.0))
            .unwrap();
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn concurrent_publishers_preserve_per_channel_order() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        bus.subscribe(Signal::Pitch, ChannelFilter::Any, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        let (_, rx) = bus
            .subscribe_channel(Signal::Pitch, ChannelFilter::Only(ChannelId(2)))
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|channel| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for n in 0..100 {
                        bus.publish(Signal::Pitch, ChannelId(channel), Payload::Pitch(n as f32))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 400);
        let order: Vec<f32> = rx
            .try_iter()
            .map(|event| match event.payload {
                Payload::Pitch(hz) => hz,
                other => panic!("unexpected payload {other:?}"),
            })
            .collect();
        assert_eq!(order, (0..100).map(|n| n as f32).collect::<Vec<_>>());
    }

    #[test]
    fn dropped_receivers_are_pruned_on_publish() {
        let bus = EventBus::new();
        for _ in 0..1000 {
            let (_, rx) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
            drop(rx);
        }
        let (_, live) = bus.subscribe_channel(Signal::Pitch, ChannelFilter::Any).unwrap();
        assert_eq!(bus.subscriber_count(), 1001);

        let delivered = bus
            .publish(Signal::Pitch, ChannelId(0), Payload::Pitch(440.0))
            .unwrap();

        assert_eq!(delivered, 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(live.try_recv().unwrap().payload, Payload::Pitch(440.0));

        drop(live);
        let delivered = bus
            .publish(Signal::Pitch, ChannelId(0), Payload::Pitch(440.0))
            .unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_races_safely_with_publishers() {
        let bus = EventBus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&delivered);
        let id = bus
            .subscribe(Signal::Bands, ChannelFilter::Any, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let (_, witness) = bus.subscribe_channel(Signal::Bands, ChannelFilter::Any).unwrap();

        let publishers: Vec<_> = (0..4)
            .map(|channel| {
                let bus = bus.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        bus.publish(Signal::Bands, ChannelId(channel), Payload::Bands(BTreeMap::new()))
                            .unwrap();
                    }
                })
            })
            .collect();

        // Unsubscribe while the publishers are mid-stream.
        witness.recv().unwrap();
        assert!(bus.unsubscribe(id).unwrap());
        for publisher in publishers {
            publisher.join().unwrap();
        }

        let settled = delivered.load(Ordering::SeqCst);
        assert!(settled <= 8_000);
        bus.publish(Signal::Bands, ChannelId(0), Payload::Bands(BTreeMap::new()))
            .unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), settled);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(witness.try_iter().count(), 8_000);
    }
}
