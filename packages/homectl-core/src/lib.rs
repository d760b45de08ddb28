//! homectl core - local control of heterogeneous smart-home devices.
//!
//! The crate discovers Chromecast speakers and WiZ, Tapo and Tuya bulbs on
//! the local network, keeps one authoritative state per device and pushes
//! changes to subscribers as events.
//!
//! # Architecture
//!
//! - [`model`]: capabilities, device identity, state and commands
//! - [`adapters`]: one [`DeviceAdapter`](adapters::DeviceAdapter) per vendor protocol
//! - [`registry`]: the device map and per-device lanes (commands, polling, push)
//! - [`discovery`]: per-protocol probes and pass reconciliation
//! - [`bridge`]: the bounded worker pool and command tickets
//! - [`events`]: the event bus and emitter abstraction
//! - [`hub`]: [`DeviceHub`], the facade a presentation layer drives
//! - [`api`]: optional HTTP/WebSocket surface over the same services
//!
//! # Abstraction Traits
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): Spawning background tasks
//! - [`EventEmitter`](events::EventEmitter): Emitting domain events
//! - [`DeviceAdapter`](adapters::DeviceAdapter): Talking to one vendor protocol
//! - [`DiscoveryProbe`](discovery::DiscoveryProbe): Finding devices of one protocol

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod api;
pub mod bootstrap;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod events;
pub mod hub;
pub mod model;
pub mod protocol_constants;
pub mod registry;
pub mod runtime;
pub mod utils;

// Re-export commonly used types at the crate root
pub use config::{Config, Credentials, TapoAccount, TuyaDeviceConfig};
pub use error::{CoreError, CoreResult, DeviceError, DeviceResult, ErrorCode, ErrorKind};
pub use events::{
    BroadcastEvent, DeviceEvent, DiscoveryEvent, EventBus, EventEmitter, EventSubscription,
    LoggingEventEmitter, NoopEventEmitter,
};
pub use hub::DeviceHub;
pub use runtime::{IoRuntime, TaskSpawner, TokioSpawner};
pub use utils::now_millis;

// Re-export model types
pub use model::{
    Capability, CapabilitySet, ColorInput, Command, DeviceCommand, DeviceDescriptor, DeviceId,
    DeviceKind, DeviceState, Endpoint, MediaAction, Protocol, Rgb,
};

// Re-export service types
pub use bridge::{CommandBridge, CommandOutcome, CommandTicket};
pub use discovery::{DiscoveryOrchestrator, DiscoveryProbe, Sighting};
pub use registry::{DeviceSnapshot, Registry};

// Re-export bootstrap types
pub use bootstrap::{bootstrap_services, BootstrappedServices};

// Re-export API types
pub use api::{bind, start_server, AppState, AppStateBuilder, ServerError, WsConnectionManager};
