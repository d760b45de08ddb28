use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use super::capability::{Capability, CapabilitySet};
use crate::error::{DeviceError, DeviceResult};
use crate::protocol_constants::{CAST_PORT, TAPO_HTTP_PORT, TUYA_PORT, WIZ_PORT};

/// Vendor protocol family a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Chromecast,
    Wiz,
    Tapo,
    Tuya,
}

/// How an adapter learns about state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// The registry drives periodic `fetch_state` calls.
    Poll,
    /// The adapter holds a subscription and reports changes as they happen.
    Push,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [Self::Chromecast, Self::Wiz, Self::Tapo, Self::Tuya];

    /// Short tag used as the `DeviceId` prefix.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Chromecast => "cast",
            Self::Wiz => "wiz",
            Self::Tapo => "tapo",
            Self::Tuya => "tuya",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.tag() == tag)
    }

    pub fn default_kind(self) -> DeviceKind {
        match self {
            Self::Chromecast => DeviceKind::Speaker,
            Self::Wiz | Self::Tapo | Self::Tuya => DeviceKind::Light,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Chromecast => CAST_PORT,
            Self::Wiz => WIZ_PORT,
            Self::Tapo => TAPO_HTTP_PORT,
            Self::Tuya => TUYA_PORT,
        }
    }

    /// Full capability set for the protocol family.
    ///
    /// Probes may narrow this per device, never widen it.
    pub fn default_capabilities(self) -> CapabilitySet {
        use Capability::*;
        match self {
            Self::Chromecast => CapabilitySet::of(&[Power, Volume, Media]),
            Self::Wiz => CapabilitySet::of(&[Power, Brightness, Color, ColorTemp]),
            Self::Tapo => CapabilitySet::of(&[Power, Brightness, Color, ColorTemp]),
            Self::Tuya => CapabilitySet::of(&[Power, Brightness, Color]),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chromecast => "Chromecast",
            Self::Wiz => "WiZ",
            Self::Tapo => "Tapo",
            Self::Tuya => "Tuya",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    Speaker,
    Light,
}

/// Stable, protocol-qualified device identity (`<tag>:<vendor id>`).
///
/// The sole key into the registry. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId {
    repr: String,
    protocol: Protocol,
}

impl DeviceId {
    pub fn new(protocol: Protocol, identity: &str) -> Self {
        Self {
            repr: format!("{}:{}", protocol.tag(), identity.trim()),
            protocol,
        }
    }

    /// Parses an id received from outside the core.
    pub fn parse(raw: &str) -> DeviceResult<Self> {
        let (tag, identity) = raw
            .split_once(':')
            .ok_or_else(|| DeviceError::InvalidArgument(format!("malformed device id: {raw}")))?;
        let protocol = Protocol::from_tag(tag).ok_or_else(|| {
            DeviceError::InvalidArgument(format!("unknown protocol tag in device id: {raw}"))
        })?;
        if identity.trim().is_empty() {
            return Err(DeviceError::InvalidArgument(format!(
                "empty identity in device id: {raw}"
            )));
        }
        Ok(Self::new(protocol, identity))
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The vendor identity part (MAC, uuid, host or Tuya device id).
    pub fn identity(&self) -> &str {
        &self.repr[self.protocol.tag().len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.repr
    }
}

/// Network endpoint of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolves the endpoint to a socket address.
    ///
    /// Hosts are IP literals in practice (discovery reports addresses), but
    /// configured hosts may be names, so resolution goes through the system
    /// resolver.
    pub fn socket_addr(&self) -> DeviceResult<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
            .ok_or_else(|| DeviceError::ConnectionError(format!("cannot resolve {}", self)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity and static description of a known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub display_name: String,
    pub kind: DeviceKind,
    pub protocol: Protocol,
    pub capabilities: CapabilitySet,
    pub address: Endpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Unix timestamp in milliseconds of the most recent sighting.
    pub last_seen: u64,
}

impl DeviceDescriptor {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }
}
