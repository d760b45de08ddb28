//! Device data model and capability model.
//!
//! Everything that crosses the core's public boundary lives here:
//! identities, descriptors, state, capabilities and commands. All types are
//! plain values; the registry hands out clones, never references.

mod capability;
pub mod color;
mod command;
mod device;
mod state;

pub use capability::{Capability, CapabilitySet};
pub use color::{Hsv, Rgb};
pub use command::{ColorInput, Command, CommandKind, DeviceCommand, MediaAction};
pub use device::{DeviceDescriptor, DeviceId, DeviceKind, Endpoint, Protocol, Transport};
pub use state::{DeviceState, MediaInfo, MediaPatch, PlaybackState, StatePatch};
