//! Event system for device lifecycle, state and discovery notifications.
//!
//! This module provides:
//! - [`EventEmitter`] trait for services to emit events without knowing the transport
//! - [`EventBus`] broadcasting events to every [`EventSubscription`]
//! - Event types for the device and discovery domains
//!
//! The bus keeps no history. A subscriber only sees events published after it
//! subscribed.

mod bus;
mod emitter;

pub use bus::{EventBus, EventSubscription};
pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use serde::Serialize;

use crate::error::ErrorKind;
use crate::model::{DeviceDescriptor, DeviceId, DeviceState, Protocol};

/// Events broadcast to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Device lifecycle and state events.
    Device(DeviceEvent),

    /// Discovery orchestrator lifecycle events.
    Discovery(DiscoveryEvent),
}

impl BroadcastEvent {
    /// The device the event concerns, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::Device(event) => Some(event.device_id()),
            Self::Discovery(_) => None,
        }
    }
}

/// Events about a single device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DeviceEvent {
    /// A device was registered for the first time.
    Discovered {
        descriptor: DeviceDescriptor,
        /// Unix timestamp in milliseconds.
        timestamp: u64,
    },
    /// A device was removed after its grace period expired.
    Lost {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        timestamp: u64,
    },
    /// The stored state of a device changed.
    StateChanged {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        state: DeviceState,
        timestamp: u64,
    },
    /// A command or poll against the device failed.
    Error {
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
        kind: ErrorKind,
        message: String,
        timestamp: u64,
    },
}

impl DeviceEvent {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            Self::Discovered { descriptor, .. } => &descriptor.id,
            Self::Lost { device_id, .. }
            | Self::StateChanged { device_id, .. }
            | Self::Error { device_id, .. } => device_id,
        }
    }
}

/// Events from the discovery orchestrator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DiscoveryEvent {
    /// Probing started for the listed protocols.
    Started {
        protocols: Vec<Protocol>,
        timestamp: u64,
    },
    /// A probe finished a full pass.
    PassCompleted {
        protocol: Protocol,
        /// Devices seen in the pass.
        sightings: usize,
        timestamp: u64,
    },
    /// A probe pass failed. Other protocols are unaffected.
    ProbeFailed {
        protocol: Protocol,
        message: String,
        timestamp: u64,
    },
    /// Discovery stopped.
    Stopped { timestamp: u64 },
}

impl From<DeviceEvent> for BroadcastEvent {
    fn from(event: DeviceEvent) -> Self {
        BroadcastEvent::Device(event)
    }
}

impl From<DiscoveryEvent> for BroadcastEvent {
    fn from(event: DiscoveryEvent) -> Self {
        BroadcastEvent::Discovery(event)
    }
}
