//! Core configuration: tunables and per-protocol credentials.
//!
//! The core only reads configuration. It is supplied at startup and again on
//! an explicit [`DeviceHub::reload_config`](crate::hub::DeviceHub::reload_config);
//! nothing here watches a settings store.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Tapo cloud account credentials, used for the local KLAP handshake.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TapoAccount {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for TapoAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapoAccount")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A Tuya device reachable on the LAN with its pre-shared local key.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TuyaDeviceConfig {
    /// Tuya device id (`devId`).
    pub id: String,
    /// Display name; the id is used when empty.
    #[serde(default)]
    pub name: String,
    pub ip: String,
    /// 16-character local key.
    pub local_key: String,
    #[serde(default = "default_tuya_version")]
    pub version: String,
}

fn default_tuya_version() -> String {
    "3.3".to_string()
}

impl std::fmt::Debug for TuyaDeviceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TuyaDeviceConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("local_key", &"<redacted>")
            .field("version", &self.version)
            .finish()
    }
}

/// Per-protocol credentials and static host lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Credentials {
    pub tapo_account: Option<TapoAccount>,
    /// Hosts of Tapo bulbs (Tapo has no LAN discovery).
    pub tapo_hosts: Vec<String>,
    pub tuya_devices: Vec<TuyaDeviceConfig>,
}

impl Credentials {
    pub fn tuya_device(&self, id: &str) -> Option<&TuyaDeviceConfig> {
        self.tuya_devices.iter().find(|d| d.id == id)
    }
}

/// Shared, reloadable view of [`Credentials`].
///
/// Adapters and probes read through this on every operation, so a reload
/// takes effect without restarting anything.
pub type CredentialStore = Arc<RwLock<Credentials>>;

/// Configuration for the homectl core.
///
/// All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Discovery
    /// Run discovery probes continuously.
    pub auto_discovery: bool,

    /// Interval between continuous discovery passes (seconds).
    pub discovery_interval_secs: u64,

    /// Window within which repeated identical sightings are suppressed (seconds).
    pub sighting_window_secs: u64,

    /// Delay between a device missing from a pass and its removal (seconds).
    pub grace_period_secs: u64,

    /// mDNS browse duration per pass (milliseconds).
    pub mdns_browse_timeout_ms: u64,

    /// How long a WiZ broadcast pass listens for replies (milliseconds).
    pub wiz_discovery_timeout_ms: u64,

    // Polling
    /// Poll poll-style devices for state.
    pub polling_enabled: bool,

    /// Interval between state polls per device (seconds).
    pub poll_interval_secs: u64,

    // Device I/O
    /// Maximum concurrent outbound device operations.
    pub worker_pool_size: usize,

    /// Bound on every adapter operation (milliseconds).
    pub operation_timeout_ms: u64,

    /// Backoff delays between retries of transient failures (milliseconds).
    pub retry_delays_ms: Vec<u64>,

    // Events
    /// Capacity of the event broadcast channel.
    pub event_channel_capacity: usize,

    /// Per-protocol credentials and static host lists.
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_discovery: true,
            discovery_interval_secs: 60,
            sighting_window_secs: 30,
            grace_period_secs: 120,
            mdns_browse_timeout_ms: 3000,
            wiz_discovery_timeout_ms: 2000,
            polling_enabled: true,
            poll_interval_secs: 5,
            worker_pool_size: 4,
            operation_timeout_ms: 5000,
            retry_delays_ms: vec![200, 500, 1000],
            event_channel_capacity: 256,
            credentials: Credentials::default(),
        }
    }
}

impl Config {
    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_pool_size == 0 {
            return Err("worker_pool_size must be >= 1".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err(
                "event_channel_capacity must be >= 1 (broadcast::channel panics on 0)".to_string(),
            );
        }
        if self.polling_enabled && self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be >= 1 when polling is enabled".to_string());
        }
        if self.auto_discovery && self.discovery_interval_secs == 0 {
            return Err(
                "discovery_interval_secs must be >= 1 when auto discovery is enabled".to_string(),
            );
        }
        if self.operation_timeout_ms == 0 {
            return Err("operation_timeout_ms must be >= 1".to_string());
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn sighting_window(&self) -> Duration {
        Duration::from_secs(self.sighting_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.polling_enabled
            .then(|| Duration::from_secs(self.poll_interval_secs))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}
