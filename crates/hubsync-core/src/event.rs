// ── Model event bus ──
//
// Every observable mutation of the model is published as one
// `ModelEvent`. Subscribers are called synchronously, in order, on the
// mutating context (the change recorder and sync trigger rely on that);
// UI consumers can instead take an async stream fed by a broadcast channel.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::task::{Context, Poll};

use arc_swap::ArcSwap;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{trace, warn};

use crate::changes::ChangeEntry;
use crate::model::{DeviceId, SyncStatus};

const EVENT_CHANNEL_SIZE: usize = 256;

// ── Event types ─────────────────────────────────────────────────────

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    /// A local edit, sync pass or load fix-up.
    Local,
    /// Applied while replaying another session's change log.
    Merge,
}

/// Entity whose aggregate sync status changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusTarget {
    Device(DeviceId),
    Channel { device: DeviceId, channel: u8 },
    LinkTable(DeviceId),
}

impl StatusTarget {
    pub fn device(&self) -> DeviceId {
        match *self {
            Self::Device(id) | Self::LinkTable(id) => id,
            Self::Channel { device, .. } => device,
        }
    }
}

/// One observer notification.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    /// A recordable mutation (property, collection or table change).
    Change(ChangeEntry),
    /// A derived aggregate status moved.
    StatusChanged {
        target: StatusTarget,
        old: SyncStatus,
        new: SyncStatus,
    },
}

/// An event together with its origin, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub origin: EventOrigin,
    pub event: ModelEvent,
}

// ── EventBus ────────────────────────────────────────────────────────

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Fan-out point for model events. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: ArcSwap<Vec<(SubscriptionId, Subscriber)>>,
    stream: broadcast::Sender<Arc<EventEnvelope>>,
    merge_depth: AtomicU32,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(BusInner {
                subscribers: ArcSwap::from_pointee(Vec::new()),
                stream,
                merge_depth: AtomicU32::new(0),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a synchronous subscriber.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: Subscriber = Arc::new(callback);
        self.inner.subscribers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push((id, Arc::clone(&callback)));
            next
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.subscribers.rcu(|current| {
            current
                .iter()
                .filter(|(sid, _)| *sid != id)
                .cloned()
                .collect::<Vec<_>>()
        });
    }

    /// Async stream of every event published from now on.
    pub fn stream(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.inner.stream.subscribe()),
        }
    }

    /// Origin stamped on events published right now.
    pub fn origin(&self) -> EventOrigin {
        if self.inner.merge_depth.load(Ordering::Acquire) > 0 {
            EventOrigin::Merge
        } else {
            EventOrigin::Local
        }
    }

    /// Mark events as merge-originated until the guard drops.
    pub fn merge_scope(&self) -> MergeScope {
        self.inner.merge_depth.fetch_add(1, Ordering::AcqRel);
        MergeScope { bus: self.clone() }
    }

    pub fn publish(&self, event: ModelEvent) {
        let envelope = EventEnvelope {
            origin: self.origin(),
            event,
        };
        trace!(origin = ?envelope.origin, event = ?envelope.event, "model event");

        let subscribers = self.inner.subscribers.load();
        for (_, callback) in subscribers.iter() {
            callback(&envelope);
        }
        // No receivers is fine: the stream is optional.
        let _ = self.inner.stream.send(Arc::new(envelope));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.load().len())
            .field("origin", &self.origin())
            .finish()
    }
}

/// Guard returned by [`EventBus::merge_scope`].
#[must_use = "events are only tagged as merge while the scope is alive"]
pub struct MergeScope {
    bus: EventBus,
}

impl Drop for MergeScope {
    fn drop(&mut self) {
        self.bus.inner.merge_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// `Stream` of published events. Lagged receivers skip what they missed.
pub struct EventStream {
    inner: BroadcastStream<Arc<EventEnvelope>>,
}

impl Stream for EventStream {
    type Item = Arc<EventEnvelope>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(envelope))) => return Poll::Ready(Some(envelope)),
                Poll::Ready(Some(Err(lagged))) => {
                    warn!(error = %lagged, "event stream lagged");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ── Notifier ────────────────────────────────────────────────────────

/// Per-entity handle on the bus. Detached while an entity is being built
/// or loaded, so bulk construction never looks like user edits.
#[derive(Clone, Default)]
pub(crate) struct Notifier(Option<EventBus>);

impl Notifier {
    pub(crate) fn attached(bus: &EventBus) -> Self {
        Self(Some(bus.clone()))
    }

    /// Publish the event built by `make`, if attached.
    pub(crate) fn emit(&self, make: impl FnOnce() -> ModelEvent) {
        if let Some(bus) = &self.0 {
            bus.publish(make());
        }
    }

    pub(crate) fn change(&self, make: impl FnOnce() -> ChangeEntry) {
        self.emit(|| ModelEvent::Change(make()));
    }

    pub(crate) fn status(&self, target: StatusTarget, old: SyncStatus, new: SyncStatus) {
        self.emit(|| ModelEvent::StatusChanged { target, old, new });
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "Notifier(attached)"
        } else {
            "Notifier(detached)"
        })
    }
}
