//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the vendors' wire protocols and changing them
//! would break interoperability. Tunables live in [`crate::config::Config`].

// ─────────────────────────────────────────────────────────────────────────────
// Google Cast (v2)
// ─────────────────────────────────────────────────────────────────────────────

/// TLS port of the Cast v2 channel.
pub const CAST_PORT: u16 = 8009;

/// mDNS service type advertised by Cast devices (trailing dot required by mdns-sd).
pub const CAST_SERVICE_TYPE: &str = "_googlecast._tcp.local.";

/// Sender and receiver endpoint names for the platform channel.
pub const CAST_SENDER_ID: &str = "sender-0";
pub const CAST_RECEIVER_ID: &str = "receiver-0";

/// Cast message namespaces.
pub const CAST_NS_CONNECTION: &str = "urn:x-cast:com.google.cast.tp.connection";
pub const CAST_NS_HEARTBEAT: &str = "urn:x-cast:com.google.cast.tp.heartbeat";
pub const CAST_NS_RECEIVER: &str = "urn:x-cast:com.google.cast.receiver";
pub const CAST_NS_MEDIA: &str = "urn:x-cast:com.google.cast.media";

/// App id of the idle backdrop; a device showing it has nothing to stop.
pub const CAST_BACKDROP_APP_ID: &str = "E8C28D3C";

/// Interval between heartbeat PINGs on a watched connection (seconds).
pub const CAST_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// A watched connection with no traffic for this long is considered lost (seconds).
pub const CAST_IDLE_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a single Cast frame (bytes).
pub const CAST_MAX_FRAME_SIZE: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// WiZ
// ─────────────────────────────────────────────────────────────────────────────

/// UDP port for WiZ pilot commands and discovery.
pub const WIZ_PORT: u16 = 38899;

/// Minimum dimming value accepted by WiZ firmware (percent).
pub const WIZ_MIN_DIMMING: u8 = 10;

/// Interval between resends of an unanswered WiZ request (milliseconds).
pub const WIZ_RESEND_INTERVAL_MS: u64 = 750;

/// Number of `registration` broadcasts per discovery pass.
pub const WIZ_DISCOVERY_SENDS: u32 = 3;

/// Spacing between discovery broadcasts (milliseconds).
pub const WIZ_DISCOVERY_SPACING_MS: u64 = 500;

// ─────────────────────────────────────────────────────────────────────────────
// Tapo (KLAP)
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP port of the local KLAP endpoint.
pub const TAPO_HTTP_PORT: u16 = 80;

/// Re-authentication attempts before a session failure is surfaced.
pub const TAPO_MAX_REAUTH: usize = 2;

/// Session lifetime assumed when the device omits `TIMEOUT` in its cookie (seconds).
pub const TAPO_DEFAULT_SESSION_SECS: u64 = 86_400;

/// Tapo error code for an expired or unknown session.
pub const TAPO_SESSION_EXPIRED: i64 = 9999;

// ─────────────────────────────────────────────────────────────────────────────
// Tuya (local protocol 3.3)
// ─────────────────────────────────────────────────────────────────────────────

/// TCP port of the Tuya local protocol.
pub const TUYA_PORT: u16 = 6668;

/// Frame prefix and suffix markers.
pub const TUYA_PREFIX: u32 = 0x0000_55AA;
pub const TUYA_SUFFIX: u32 = 0x0000_AA55;

/// The only local protocol version this crate speaks.
pub const TUYA_VERSION: &str = "3.3";

/// Data point ids used by Tuya bulbs.
pub const TUYA_DPS_SWITCH: &str = "1";
pub const TUYA_DPS_BRIGHTNESS_LEGACY: &str = "2";
pub const TUYA_DPS_SWITCH_LED: &str = "20";
pub const TUYA_DPS_MODE: &str = "21";
pub const TUYA_DPS_BRIGHTNESS: &str = "22";
pub const TUYA_DPS_COLOUR: &str = "24";

/// Upper bound on a single Tuya frame payload (bytes).
pub const TUYA_MAX_PAYLOAD: usize = 8 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Application Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier reported by the health endpoint.
pub const SERVICE_ID: &str = "homectl";

/// Capacity of each device lane's push report channel.
pub const PUSH_CHANNEL_CAPACITY: usize = 32;

/// First delay before re-establishing a lost push subscription (milliseconds).
pub const PUSH_RECONNECT_BASE_MS: u64 = 500;

/// Upper bound on the push reconnect delay (seconds).
pub const PUSH_RECONNECT_MAX_SECS: u64 = 30;

/// WebSocket heartbeat timeout (seconds).
pub const WS_HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// How long the HTTP command endpoint waits for an outcome (seconds).
pub const HTTP_COMMAND_WAIT_SECS: u64 = 15;

/// How often a WebSocket connection checks for heartbeat timeout (seconds).
pub const WS_HEARTBEAT_CHECK_INTERVAL_SECS: u64 = 5;

/// Port range searched when no HTTP port is configured.
pub const HTTP_PORT_RANGE_START: u16 = 49500;
pub const HTTP_PORT_RANGE_END: u16 = 49510;
