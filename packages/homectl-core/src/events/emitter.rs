//! Event emitter abstraction for decoupling services from transport.
//!
//! The registry and the discovery orchestrator depend on the [`EventEmitter`]
//! trait rather than a concrete channel, so tests can record events directly
//! and a GUI host can receive them without going through the bus.

use super::{DeviceEvent, DiscoveryEvent};

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a device lifecycle or state event.
    fn emit_device(&self, event: DeviceEvent);

    /// Emits a discovery lifecycle event.
    fn emit_discovery(&self, event: DiscoveryEvent);
}

/// No-op emitter for headless use or testing.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit_device(&self, _event: DeviceEvent) {}

    fn emit_discovery(&self, _event: DiscoveryEvent) {}
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_device(&self, event: DeviceEvent) {
        tracing::debug!(?event, "device_event");
    }

    fn emit_discovery(&self, event: DiscoveryEvent) {
        tracing::debug!(?event, "discovery_event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, Protocol};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        device_count: AtomicUsize,
        discovery_count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit_device(&self, _event: DeviceEvent) {
            self.device_count.fetch_add(1, Ordering::SeqCst);
        }

        fn emit_discovery(&self, _event: DiscoveryEvent) {
            self.discovery_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitters_are_usable_as_trait_objects() {
        let counting = Arc::new(CountingEventEmitter {
            device_count: AtomicUsize::new(0),
            discovery_count: AtomicUsize::new(0),
        });
        let emitters: Vec<Arc<dyn EventEmitter>> = vec![
            Arc::new(NoopEventEmitter),
            Arc::new(LoggingEventEmitter),
            counting.clone(),
        ];

        for emitter in &emitters {
            emitter.emit_device(DeviceEvent::Lost {
                device_id: DeviceId::new(Protocol::Tuya, "bf01"),
                timestamp: 0,
            });
            emitter.emit_discovery(DiscoveryEvent::Stopped { timestamp: 0 });
        }

        assert_eq!(counting.device_count.load(Ordering::SeqCst), 1);
        assert_eq!(counting.discovery_count.load(Ordering::SeqCst), 1);
    }
}
