//! Tuya bulbs and plugs over the local protocol 3.3 (TCP 6668).
//!
//! Tuya exposes device features as numbered data points (DPS). Which ids a
//! device uses depends on its firmware: bulbs switch on DPS 20 and dim on
//! DPS 22 (10–1000), older bulbs and plugs switch on DPS 1 and dim on DPS 2
//! (0–255). The layout is learned from the first status query and cached per
//! device.

mod frame;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use self::frame::{read_frame, Frame, TuyaCipher, CMD_CONTROL, CMD_DP_QUERY};
use super::{DeviceAdapter, DeviceSession};
use crate::config::CredentialStore;
use crate::error::{DeviceError, DeviceResult};
use crate::model::{
    Capability, DeviceCommand, DeviceDescriptor, DeviceState, Hsv, Protocol, Rgb,
};
use crate::protocol_constants::{
    TUYA_DPS_BRIGHTNESS, TUYA_DPS_BRIGHTNESS_LEGACY, TUYA_DPS_COLOUR, TUYA_DPS_MODE,
    TUYA_DPS_SWITCH, TUYA_DPS_SWITCH_LED, TUYA_VERSION,
};
use crate::utils::{now_millis, now_secs};

/// Adapter for Tuya devices configured with a local key.
pub struct TuyaAdapter {
    credentials: CredentialStore,
    timeout: Duration,
    layouts: Arc<DashMap<String, DpsLayout>>,
}

impl TuyaAdapter {
    pub fn new(credentials: CredentialStore, timeout: Duration) -> Self {
        Self {
            credentials,
            timeout,
            layouts: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl DeviceAdapter for TuyaAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Tuya
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceSession>> {
        let dev_id = descriptor.id.identity().to_string();
        let (local_key, version) = {
            let credentials = self.credentials.read();
            let config = credentials.tuya_device(&dev_id).ok_or_else(|| {
                DeviceError::ConfigurationError(format!("no local key configured for {dev_id}"))
            })?;
            (config.local_key.clone(), config.version.clone())
        };
        if version != TUYA_VERSION {
            return Err(DeviceError::ConfigurationError(format!(
                "Tuya protocol version {version} is not supported (only {TUYA_VERSION})"
            )));
        }
        let cipher = TuyaCipher::new(&local_key)?;

        let addr = descriptor.address.socket_addr()?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| DeviceError::ConnectionError(format!("{addr}: connect timed out")))?
            .map_err(|e| DeviceError::ConnectionError(format!("{addr}: {e}")))?;

        Ok(Box::new(TuyaSession {
            stream,
            cipher,
            dev_id,
            seq: 0,
            layouts: Arc::clone(&self.layouts),
        }))
    }
}

struct TuyaSession {
    stream: TcpStream,
    cipher: TuyaCipher,
    dev_id: String,
    seq: u32,
    layouts: Arc<DashMap<String, DpsLayout>>,
}

impl TuyaSession {
    async fn send(&mut self, cmd: u32, payload: Vec<u8>) -> DeviceResult<()> {
        self.seq = self.seq.wrapping_add(1);
        let bytes = Frame {
            seq: self.seq,
            cmd,
            payload,
        }
        .encode();
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|e| DeviceError::DeviceUnreachable(format!("write failed: {e}")))
    }

    /// Reads frames until the reply to `cmd` arrives.
    ///
    /// Devices interleave unsolicited STATUS pushes with replies; those are
    /// skipped.
    async fn reply_to(&mut self, cmd: u32) -> DeviceResult<Option<Value>> {
        loop {
            let frame = read_frame(&mut self.stream).await?;
            if frame.cmd == cmd {
                return self.cipher.open_reply(&frame.payload);
            }
            log::trace!("[Tuya] Skipping frame cmd={} while waiting for {}", frame.cmd, cmd);
        }
    }

    async fn query_dps(&mut self) -> DeviceResult<Map<String, Value>> {
        let t = now_secs().to_string();
        let payload = self.cipher.query_payload(&json!({
            "gwId": self.dev_id,
            "devId": self.dev_id,
            "uid": self.dev_id,
            "t": t,
        }))?;
        self.send(CMD_DP_QUERY, payload).await?;
        let reply = self
            .reply_to(CMD_DP_QUERY)
            .await?
            .ok_or_else(|| DeviceError::ProtocolError("empty DP_QUERY reply".into()))?;
        let dps = match reply.get("dps") {
            Some(Value::Object(dps)) => dps.clone(),
            _ => return Err(DeviceError::ProtocolError("DP_QUERY reply has no dps".into())),
        };
        self.layouts
            .insert(self.dev_id.clone(), DpsLayout::from_dps(&dps));
        Ok(dps)
    }

    async fn layout(&mut self) -> DeviceResult<DpsLayout> {
        if let Some(layout) = self.layouts.get(&self.dev_id).map(|l| *l.value()) {
            return Ok(layout);
        }
        let dps = self.query_dps().await?;
        Ok(DpsLayout::from_dps(&dps))
    }
}

#[async_trait]
impl DeviceSession for TuyaSession {
    async fn apply_command(&mut self, command: &DeviceCommand) -> DeviceResult<()> {
        let layout = self.layout().await?;
        let dps = layout.command_dps(command)?;
        let t = now_secs().to_string();
        let payload = self.cipher.control_payload(&json!({
            "devId": self.dev_id,
            "uid": self.dev_id,
            "t": t,
            "dps": dps,
        }))?;
        self.send(CMD_CONTROL, payload).await?;
        self.reply_to(CMD_CONTROL).await.map(|_| ())
    }

    async fn fetch_state(&mut self) -> DeviceResult<DeviceState> {
        let dps = self.query_dps().await?;
        let layout = DpsLayout::from_dps(&dps);
        Ok(layout.state_from_dps(&dps, now_millis()))
    }

    async fn close(mut self: Box<Self>) {
        let _ = self.stream.shutdown().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DPS mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrightnessDp {
    /// DPS 22, 10–1000.
    Scaled,
    /// DPS 2, 0–255.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DpsLayout {
    switch: &'static str,
    brightness: Option<BrightnessDp>,
    colour: bool,
}

impl DpsLayout {
    fn from_dps(dps: &Map<String, Value>) -> Self {
        let switch = if dps.contains_key(TUYA_DPS_SWITCH_LED) {
            TUYA_DPS_SWITCH_LED
        } else {
            TUYA_DPS_SWITCH
        };
        let brightness = if dps.contains_key(TUYA_DPS_BRIGHTNESS) {
            Some(BrightnessDp::Scaled)
        } else if dps.get(TUYA_DPS_BRIGHTNESS_LEGACY).is_some_and(Value::is_u64) {
            Some(BrightnessDp::Legacy)
        } else {
            None
        };
        Self {
            switch,
            brightness,
            colour: dps.contains_key(TUYA_DPS_COLOUR),
        }
    }

    fn command_dps(&self, command: &DeviceCommand) -> DeviceResult<Value> {
        let mut dps = Map::new();
        match *command {
            DeviceCommand::SetPower { on } => {
                dps.insert(self.switch.into(), json!(on));
            }
            DeviceCommand::SetBrightness { level: 0 } => {
                dps.insert(self.switch.into(), json!(false));
            }
            DeviceCommand::SetBrightness { level } => {
                let (id, value) = match self.brightness {
                    Some(BrightnessDp::Scaled) => (TUYA_DPS_BRIGHTNESS, scale_brightness(level)),
                    Some(BrightnessDp::Legacy) => (
                        TUYA_DPS_BRIGHTNESS_LEGACY,
                        (f64::from(level) * 255.0 / 100.0).round() as u32,
                    ),
                    None => return Err(DeviceError::UnsupportedCapability(Capability::Brightness)),
                };
                dps.insert(self.switch.into(), json!(true));
                dps.insert(id.into(), json!(value));
            }
            DeviceCommand::SetColor { color } => {
                if !self.colour {
                    return Err(DeviceError::UnsupportedCapability(Capability::Color));
                }
                dps.insert(self.switch.into(), json!(true));
                dps.insert(TUYA_DPS_MODE.into(), json!("colour"));
                dps.insert(TUYA_DPS_COLOUR.into(), json!(encode_colour(color)));
            }
            DeviceCommand::SetVolume { .. } | DeviceCommand::SetMuted { .. } => {
                return Err(DeviceError::UnsupportedCapability(Capability::Volume));
            }
            DeviceCommand::Media { .. } => {
                return Err(DeviceError::UnsupportedCapability(Capability::Media));
            }
        }
        Ok(Value::Object(dps))
    }

    fn state_from_dps(&self, dps: &Map<String, Value>, now: u64) -> DeviceState {
        let power = dps
            .get(self.switch)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let brightness = match self.brightness {
            Some(BrightnessDp::Scaled) => dps
                .get(TUYA_DPS_BRIGHTNESS)
                .and_then(Value::as_u64)
                .map(unscale_brightness),
            Some(BrightnessDp::Legacy) => dps
                .get(TUYA_DPS_BRIGHTNESS_LEGACY)
                .and_then(Value::as_u64)
                .map(|raw| ((raw.min(255) as f64) * 100.0 / 255.0).round() as u8),
            None => None,
        };
        let in_colour_mode = dps.get(TUYA_DPS_MODE).and_then(Value::as_str) == Some("colour");
        let color = if in_colour_mode {
            dps.get(TUYA_DPS_COLOUR)
                .and_then(Value::as_str)
                .and_then(decode_colour)
        } else {
            None
        };

        DeviceState {
            power,
            brightness,
            color,
            reachable: true,
            last_updated: now,
            ..DeviceState::default()
        }
    }
}

/// 0–100 to the 10–1000 scale of DPS 22.
fn scale_brightness(level: u8) -> u32 {
    (10.0 + f64::from(level) / 100.0 * 990.0).round() as u32
}

fn unscale_brightness(raw: u64) -> u8 {
    let raw = raw.clamp(10, 1000) as f64;
    ((raw - 10.0) / 990.0 * 100.0).round() as u8
}

/// `HHHHSSSSVVVV`: hue in degrees, saturation and value on 0–1000, as hex.
fn encode_colour(color: Rgb) -> String {
    let hsv = color.to_hsv();
    format!(
        "{:04x}{:04x}{:04x}",
        hsv.h,
        (hsv.s * 1000.0).round() as u16,
        (hsv.v * 1000.0).round() as u16
    )
}

fn decode_colour(hex: &str) -> Option<Rgb> {
    if hex.len() != 12 || !hex.is_ascii() {
        return None;
    }
    let field = |range: std::ops::Range<usize>| u16::from_str_radix(&hex[range], 16).ok();
    Some(
        Hsv {
            h: field(0..4)?,
            s: f64::from(field(4..8)?) / 1000.0,
            v: f64::from(field(8..12)?) / 1000.0,
        }
        .to_rgb(),
    )
}
