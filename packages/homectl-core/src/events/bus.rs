//! Process-wide event bus over a broadcast channel.
//!
//! The [`EventBus`] implements [`EventEmitter`] by forwarding events to a
//! `tokio::sync::broadcast` channel. Each subscriber holds an
//! [`EventSubscription`] and drains it on its own cadence, so a slow consumer
//! never blocks a publisher.

use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::emitter::EventEmitter;
use super::{BroadcastEvent, DeviceEvent, DiscoveryEvent};

/// Broadcasts domain events to every live subscription.
///
/// An optional external emitter receives every event as well, which lets a
/// GUI host get events pushed without polling a subscription.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BroadcastEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` events behind skips the
    /// oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter for platform-specific event delivery.
    ///
    /// Can be called after construction, when the platform handle becomes
    /// available.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Generates an [`EventEmitter`] method that forwards to the external emitter
/// (if set) and then sends to the broadcast channel.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(ref emitter) = *self.external_emitter.read() {
                emitter.$method(event.clone());
            }
            if let Err(e) = self.tx.send(BroadcastEvent::$variant(event)) {
                log::trace!("[EventBus] No subscribers: {}", e);
            }
        }
    };
}

impl EventEmitter for EventBus {
    impl_emit!(emit_device, DeviceEvent, Device);
    impl_emit!(emit_discovery, DiscoveryEvent, Discovery);
}

/// A live subscription to the [`EventBus`].
///
/// Dropping the subscription (or calling [`unsubscribe`](Self::unsubscribe))
/// removes the subscriber.
pub struct EventSubscription {
    rx: broadcast::Receiver<BroadcastEvent>,
}

impl EventSubscription {
    /// Returns the next pending event without waiting.
    ///
    /// Returns `None` when nothing is pending or the bus is gone. If the
    /// subscriber lagged, the skipped events are logged and the oldest
    /// retained event is returned.
    pub fn try_next(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    log::warn!("[EventBus] Subscriber lagged, skipped {} events", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Returns every pending event without waiting.
    ///
    /// Meant for a presentation loop that drains the bus once per frame.
    pub fn drain(&mut self) -> Vec<BroadcastEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    /// Waits for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("[EventBus] Subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Converts the subscription into a stream that ends with the bus.
    ///
    /// Lagged gaps are logged and skipped.
    pub fn into_stream(self) -> impl Stream<Item = BroadcastEvent> + Send + 'static {
        BroadcastStream::new(self.rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    log::warn!("[EventBus] Subscriber lagged, skipped {} events", skipped);
                    None
                }
            }
        })
    }

    /// Removes the subscriber.
    pub fn unsubscribe(self) {}
}
