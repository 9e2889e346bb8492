//! Fan-out delivery of samples and events to independent consumers.
//!
//! ```text
//! AcquisitionScheduler ─┐
//! InstrumentSession ────┼─→ SampleBus → [plot, exporter, logger, ...]
//! SafetyInterlock ──────┘
//! ```
//!
//! The bus wraps a `tokio::sync::broadcast` channel. [`SampleBus::publish`]
//! never blocks; each consumer reads at its own pace and one that falls more
//! than `capacity` items behind loses its oldest unread items. The first time
//! a consumer finds it has lagged, it receives one [`EventKind::Overflow`]
//! notice ahead of the surviving items and a warning is logged. The episode
//! ends once that consumer has caught up with the bus.
//!
//! # Example
//!
//! ```rust
//! use hv_daq::bus::SampleBus;
//! use hv_daq::events::{BusMessage, Event, EventKind};
//!
//! # async fn example() {
//! let bus = SampleBus::new(128);
//! let mut gui = bus.subscribe("gui");
//! bus.publish(Event::new(EventKind::Reset, None, "operator reset"));
//! assert!(matches!(gui.recv().await, Some(BusMessage::Event(_))));
//! # }
//! ```

use crate::events::{BusMessage, Event, EventKind};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Delivery statistics for one consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerMetrics {
    /// Name given to [`SampleBus::subscribe`].
    pub consumer: String,
    /// Items handed to the consumer, overflow notices excluded.
    pub total_delivered: u64,
    /// Items lost to lag, counted when the consumer discovers them.
    pub total_dropped: u64,
    /// Overflow episodes so far.
    pub overflow_episodes: u64,
    /// Items published but not yet read (at most the capacity).
    pub queue_occupancy: usize,
    /// Items a consumer may fall behind before losing any.
    pub queue_capacity: usize,
}

#[derive(Default)]
struct Counters {
    delivered: u64,
    dropped: u64,
    episodes: u64,
    overflowing: bool,
}

/// Registry entry for one subscription.
struct Consumer {
    id: u64,
    name: String,
    /// Bus publish count when the subscription started.
    start: u64,
    counters: Mutex<Counters>,
}

struct BusInner {
    capacity: usize,
    /// `None` once closed.
    sender: Mutex<Option<broadcast::Sender<BusMessage>>>,
    published: AtomicU64,
    consumers: Mutex<Vec<Arc<Consumer>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn metrics_for(&self, consumer: &Consumer) -> ConsumerMetrics {
        let counters = consumer.counters.lock();
        let published = self.published.load(Ordering::Acquire);
        let behind = published
            .saturating_sub(consumer.start)
            .saturating_sub(counters.delivered)
            .saturating_sub(counters.dropped);
        ConsumerMetrics {
            consumer: consumer.name.clone(),
            total_delivered: counters.delivered,
            total_dropped: counters.dropped,
            overflow_episodes: counters.episodes,
            queue_occupancy: usize::try_from(behind)
                .unwrap_or(usize::MAX)
                .min(self.capacity),
            queue_capacity: self.capacity,
        }
    }
}

/// Bounded multi-consumer bus. Cheap to clone; clones share one channel.
#[derive(Clone)]
pub struct SampleBus {
    inner: Arc<BusInner>,
}

impl SampleBus {
    /// Bus letting each consumer fall `capacity` items behind, rounded up to
    /// a power of two as the broadcast channel requires.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                capacity,
                sender: Mutex::new(Some(sender)),
                published: AtomicU64::new(0),
                consumers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Per-consumer lag allowance.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Deliver `message` to every current consumer without blocking.
    pub fn publish(&self, message: impl Into<BusMessage>) {
        let sender = self.inner.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return;
        };
        // No receivers is not an error for a fan-out bus.
        if sender.send(message.into()).is_ok() {
            self.inner.published.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Register a consumer. It sees only items published from now on.
    pub fn subscribe(&self, name: impl Into<String>) -> ConsumerHandle {
        let sender = self.inner.sender.lock();
        let receiver = match sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // A receiver whose channel is already closed.
                let (closed, receiver) = broadcast::channel(1);
                drop(closed);
                receiver
            }
        };
        let consumer = Arc::new(Consumer {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            start: self.inner.published.load(Ordering::Acquire),
            counters: Mutex::new(Counters::default()),
        });
        drop(sender);

        self.inner.consumers.lock().push(consumer.clone());
        tracing::debug!(consumer = %consumer.name, "bus consumer subscribed");
        ConsumerHandle {
            receiver,
            consumer,
            capacity: self.inner.capacity,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Number of live consumers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.consumers.lock().len()
    }

    /// Metrics for every live consumer.
    pub fn metrics(&self) -> Vec<ConsumerMetrics> {
        let consumers: Vec<Arc<Consumer>> = self.inner.consumers.lock().clone();
        consumers
            .iter()
            .map(|c| self.inner.metrics_for(c))
            .collect()
    }

    /// End every consumer stream once it has read what was already published;
    /// later publishes are ignored.
    pub fn close(&self) {
        if self.inner.sender.lock().take().is_some() {
            tracing::debug!("sample bus closed");
        }
    }
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct ConsumerHandle {
    receiver: broadcast::Receiver<BusMessage>,
    consumer: Arc<Consumer>,
    capacity: usize,
    bus: Weak<BusInner>,
}

impl ConsumerHandle {
    /// Consumer name.
    pub fn name(&self) -> &str {
        &self.consumer.name
    }

    /// Next item, waiting if nothing is pending. `None` once the bus is
    /// closed and everything published before that has been read.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        match self.receiver.recv().await {
            Ok(message) => Some(self.delivered(message)),
            Err(RecvError::Lagged(skipped)) => Some(self.lagged(skipped)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Next item if one is already pending.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        match self.receiver.try_recv() {
            Ok(message) => Some(self.delivered(message)),
            Err(TryRecvError::Lagged(skipped)) => Some(self.lagged(skipped)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Everything currently pending, without waiting.
    pub fn drain(&mut self) -> Vec<BusMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Delivery statistics for this consumer.
    pub fn metrics(&self) -> ConsumerMetrics {
        match self.bus.upgrade() {
            Some(bus) => bus.metrics_for(&self.consumer),
            None => {
                let counters = self.consumer.counters.lock();
                ConsumerMetrics {
                    consumer: self.consumer.name.clone(),
                    total_delivered: counters.delivered,
                    total_dropped: counters.dropped,
                    overflow_episodes: counters.episodes,
                    queue_occupancy: self.receiver.len(),
                    queue_capacity: self.capacity,
                }
            }
        }
    }

    /// Consume the handle as an async stream.
    pub fn into_stream(self) -> impl Stream<Item = BusMessage> {
        futures::stream::unfold(self, |mut handle| async move {
            handle.recv().await.map(|item| (item, handle))
        })
    }

    fn delivered(&mut self, message: BusMessage) -> BusMessage {
        let mut counters = self.consumer.counters.lock();
        counters.delivered = counters.delivered.saturating_add(1);
        if counters.overflowing && self.receiver.is_empty() {
            counters.overflowing = false;
            tracing::debug!(consumer = %self.consumer.name, "bus consumer caught up");
        }
        message
    }

    /// Account for `skipped` lost items and produce the episode's notice.
    fn lagged(&mut self, skipped: u64) -> BusMessage {
        let new_episode = {
            let mut counters = self.consumer.counters.lock();
            counters.dropped = counters.dropped.saturating_add(skipped);
            let new_episode = !counters.overflowing;
            if new_episode {
                counters.overflowing = true;
                counters.episodes = counters.episodes.saturating_add(1);
            }
            new_episode
        };

        if !new_episode {
            // Still in the same episode: skip straight to the next real item.
            return match self.receiver.try_recv() {
                Ok(message) => self.delivered(message),
                Err(TryRecvError::Lagged(more)) => self.lagged(more),
                Err(TryRecvError::Empty | TryRecvError::Closed) => {
                    BusMessage::Event(self.overflow_notice(skipped))
                }
            };
        }

        tracing::warn!(
            consumer = %self.consumer.name,
            capacity = self.capacity,
            dropped = skipped,
            "bus consumer overflowing, dropping oldest items"
        );
        BusMessage::Event(self.overflow_notice(skipped))
    }

    fn overflow_notice(&self, skipped: u64) -> Event {
        Event::new(
            EventKind::Overflow,
            None,
            format!(
                "consumer '{}' fell behind; {} oldest items dropped (capacity {})",
                self.consumer.name, skipped, self.capacity
            ),
        )
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.consumers.lock().retain(|c| c.id != self.consumer.id);
        }
        tracing::debug!(consumer = %self.consumer.name, "bus consumer unsubscribed");
    }
}
