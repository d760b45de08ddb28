//! Shared types for device discovery.

use thiserror::Error;

use crate::model::{
    CapabilitySet, DeviceDescriptor, DeviceId, DeviceKind, Endpoint, Protocol,
};

/// Errors that fail a whole probe pass.
///
/// A failed pass is reported as `discovery.probeFailed` and never marks
/// devices lost.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Failed to bind a UDP socket for discovery.
    #[error("failed to bind UDP socket: {0}")]
    SocketBind(#[source] std::io::Error),

    /// Failed to send a discovery datagram on every interface.
    #[error("failed to send discovery request: {0}")]
    Send(#[source] std::io::Error),

    /// No usable network interfaces found.
    #[error("no usable network interfaces found")]
    NoInterfaces,

    /// mDNS daemon error.
    #[error("mDNS daemon error: {0}")]
    MdnsDaemon(String),

    /// The probe cannot run right now (stopped orchestrator, missing pool).
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

/// Convenient Result alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// One device seen by one probe pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub display_name: String,
    pub address: Endpoint,
    pub model: Option<String>,
    /// Narrowed capability set, when the probe learned one.
    pub capabilities: Option<CapabilitySet>,
}

impl Sighting {
    pub fn new(
        protocol: Protocol,
        identity: &str,
        display_name: impl Into<String>,
        address: Endpoint,
    ) -> Self {
        Self {
            id: DeviceId::new(protocol, identity),
            kind: protocol.default_kind(),
            display_name: display_name.into(),
            address,
            model: None,
            capabilities: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.id.protocol()
    }

    /// Capabilities the device will be registered with.
    ///
    /// A probe can only narrow the protocol's set, never widen it.
    pub fn effective_capabilities(&self) -> CapabilitySet {
        let full = self.protocol().default_capabilities();
        match &self.capabilities {
            Some(narrowed) => narrowed.iter().filter(|cap| full.contains(*cap)).collect(),
            None => full,
        }
    }

    pub fn to_descriptor(&self, now: u64) -> DeviceDescriptor {
        DeviceDescriptor {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            kind: self.kind,
            protocol: self.protocol(),
            capabilities: self.effective_capabilities(),
            address: self.address.clone(),
            model: self.model.clone(),
            last_seen: now,
        }
    }
}
