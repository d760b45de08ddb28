//! WiZ bulbs: JSON over UDP port 38899.
//!
//! Requests are `{"method": ..., "params": {...}}` datagrams. The bulb answers
//! with `{"method": ..., "result": {...}}` or `{"method": ..., "error": {...}}`.
//! UDP gives no delivery guarantee, so an unanswered request is resent every
//! [`WIZ_RESEND_INTERVAL_MS`] until the operation timeout.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::net::UdpSocket;

use super::{DeviceAdapter, DeviceSession};
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capability, CapabilitySet, DeviceCommand, DeviceDescriptor, DeviceState, Protocol, Rgb,
};
use crate::protocol_constants::{WIZ_MIN_DIMMING, WIZ_RESEND_INTERVAL_MS};
use crate::utils::now_millis;

/// Adapter for WiZ bulbs. Stateless; every session opens its own socket.
pub struct WizAdapter {
    timeout: Duration,
}

impl WizAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DeviceAdapter for WizAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Wiz
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceSession>> {
        let addr = descriptor.address.socket_addr()?;
        let client = WizClient::connect(addr, self.timeout).await?;
        Ok(Box::new(WizSession { client }))
    }
}

struct WizSession {
    client: WizClient,
}

#[async_trait]
impl DeviceSession for WizSession {
    async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        let params = pilot_params(command)?;
        let result = self.client.request("setPilot", params).await?;
        if result.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(DeviceError::ProtocolError(
                "setPilot was not acknowledged".into(),
            ));
        }
        Ok(())
    }

    async fn fetch_state(&mut self) -> DeviceResult<DeviceState> {
        let result = self.client.request("getPilot", json!({})).await?;
        parse_pilot(&result, now_millis())
    }

    async fn close(self: Box<Self>) {}
}

/// Request/response client for a single bulb.
pub(crate) struct WizClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl WizClient {
    pub(crate) async fn connect(addr: SocketAddr, timeout: Duration) -> DeviceResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("bind failed: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| DeviceError::ConnectionError(format!("{addr}: {e}")))?;
        Ok(Self { socket, timeout })
    }

    /// Sends `method` and returns the `result` object of the matching reply.
    pub(crate) async fn request(&self, method: &str, params: Value) -> DeviceResult<Value> {
        let body = serde_json::to_vec(&json!({ "method": method, "params": params }))
            .map_err(|e| DeviceError::InvalidArgument(e.to_string()))?;

        tokio::time::timeout(self.timeout, self.exchange(method, &body))
            .await
            .map_err(|_| {
                DeviceError::DeviceUnreachable(format!(
                    "no {} reply within {}ms",
                    method,
                    self.timeout.as_millis()
                ))
            })?
    }

    async fn exchange(&self, method: &str, body: &[u8]) -> DeviceResult<Value> {
        let mut resend = tokio::time::interval(Duration::from_millis(WIZ_RESEND_INTERVAL_MS));
        let mut buf = [0u8; 2048];
        loop {
            tokio::select! {
                _ = resend.tick() => {
                    self.socket
                        .send(body)
                        .await
                        .map_err(|e| DeviceError::DeviceUnreachable(format!("send failed: {e}")))?;
                }
                received = self.socket.recv(&mut buf) => {
                    let len = received
                        .map_err(|e| DeviceError::DeviceUnreachable(format!("recv failed: {e}")))?;
                    if let Some(result) = parse_reply(method, &buf[..len])? {
                        return Ok(result);
                    }
                }
            }
        }
    }
}

/// Extracts the result of a reply to `method`.
///
/// Returns `Ok(None)` for datagrams that are not a reply to `method` (late
/// answers to an earlier resend, unrelated broadcasts).
fn parse_reply(method: &str, datagram: &[u8]) -> DeviceResult<Option<Value>> {
    let Ok(reply) = serde_json::from_slice::<Value>(datagram) else {
        log::debug!("[WiZ] Ignoring non-JSON datagram ({} bytes)", datagram.len());
        return Ok(None);
    };
    if reply.get("method").and_then(Value::as_str) != Some(method) {
        return Ok(None);
    }
    if let Some(error) = reply.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(DeviceError::ProtocolError(format!("{method}: {message}")));
    }
    match reply.get("result") {
        Some(result) => Ok(Some(result.clone())),
        None => Err(DeviceError::ProtocolError(format!("{method}: reply has no result"))),
    }
}

/// `setPilot` parameters for a command.
pub(crate) fn pilot_params(command: &DeviceCommand) -> DeviceResult<Value> {
    match *command {
        DeviceCommand::SetPower { on } => Ok(json!({ "state": on })),
        DeviceCommand::SetBrightness { level: 0 } => Ok(json!({ "state": false })),
        DeviceCommand::SetBrightness { level } => Ok(json!({
            "state": true,
            "dimming": level.max(WIZ_MIN_DIMMING),
        })),
        DeviceCommand::SetColor { color } => Ok(json!({
            "state": true,
            "r": color.r,
            "g": color.g,
            "b": color.b,
        })),
        DeviceCommand::SetVolume { .. } | DeviceCommand::SetMuted { .. } => {
            Err(DeviceError::UnsupportedCapability(Capability::Volume))
        }
        DeviceCommand::Media { .. } => Err(DeviceError::UnsupportedCapability(Capability::Media)),
    }
}

/// Builds device state from a `getPilot` result.
pub(crate) fn parse_pilot(result: &Value, now: u64) -> DeviceResult<DeviceState> {
    let power = result
        .get("state")
        .and_then(Value::as_bool)
        .ok_or_else(|| DeviceError::ProtocolError("getPilot result has no state".into()))?;

    let channel = |key: &str| {
        result
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u8::try_from(v).ok())
    };
    let color = match (channel("r"), channel("g"), channel("b")) {
        (Some(r), Some(g), Some(b)) => Some(Rgb::new(r, g, b)),
        _ => None,
    };
    let color_temp = result
        .get("temp")
        .and_then(Value::as_u64)
        .filter(|t| *t > 0)
        .and_then(|t| u16::try_from(t).ok());
    let brightness = result
        .get("dimming")
        .and_then(Value::as_u64)
        .map(|d| d.min(100) as u8);

    Ok(DeviceState {
        power,
        brightness,
        color,
        color_temp,
        reachable: true,
        last_updated: now,
        ..DeviceState::default()
    })
}

/// Narrows the WiZ capability set by `getSystemConfig` module name.
///
/// Module names encode the bulb type: `SHRGB` bulbs have full color, `SHTW`
/// are tunable white, `SHDW` are dimmable white only.
pub(crate) fn capabilities_for_module(module_name: &str) -> CapabilitySet {
    let caps = Protocol::Wiz.default_capabilities();
    let upper = module_name.to_ascii_uppercase();
    if upper.contains("RGB") {
        caps
    } else if upper.contains("SHTW") {
        caps.without(Capability::Color)
    } else if upper.contains("SHDW") {
        caps.without(Capability::Color).without(Capability::ColorTemp)
    } else {
        caps
    }
}
